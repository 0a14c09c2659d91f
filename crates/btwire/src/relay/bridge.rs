//! A bridge publishes a listening Bluetooth socket and relays every accepted
//! connection to a fixed network endpoint.

use std::sync::{Arc, Mutex as StdMutex};

use indexmap::IndexMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::relay::RelayError;
use crate::relay::config::{BridgeSpec, NetProtocol};
use crate::relay::connection::{BridgeConnection, BridgeState, ConnectionInfo};
use crate::scope::Scope;
use crate::session::BluetoothSocket;
use crate::supervisor::WorkerSupervisor;

type Registry = Arc<StdMutex<IndexMap<Uuid, (String, watch::Receiver<BridgeState>)>>>;

pub struct Bridge {
    spec: BridgeSpec,
    port: u16,
    scope: Scope,
    connections: Registry,
    accept_loop: JoinHandle<()>,
}

impl Bridge {
    /// Open the server socket and start accepting.
    ///
    /// Returns once the socket is bound, listening and (when configured)
    /// advertised; a failure in any of those steps closes the socket and is
    /// returned here.
    pub async fn start(
        spec: BridgeSpec,
        supervisor: &WorkerSupervisor,
        scope: &Scope,
    ) -> Result<Self, RelayError> {
        let mut server = supervisor.new_socket(spec.bluetooth_protocol).await?;
        tracing::info!(bridge = %spec.name, session = %server.id(), "Bluetooth server socket created");

        let port = match Self::prepare(&spec, &mut server).await {
            Ok(port) => port,
            Err(e) => {
                tracing::error!(bridge = %spec.name, error = %e, "Unable to start bridge");
                let _ = server.close().await;
                return Err(e);
            }
        };

        let scope = scope.child();
        let connections = Registry::default();
        let accept_loop = scope.spawn(accept_loop(
            spec.clone(),
            server,
            scope.clone(),
            Arc::clone(&connections),
        ));
        tracing::info!(bridge = %spec.name, port, "Bridge started");

        Ok(Self {
            spec,
            port,
            scope,
            connections,
            accept_loop,
        })
    }

    async fn prepare(spec: &BridgeSpec, server: &mut BluetoothSocket) -> Result<u16, RelayError> {
        server.bind(spec.bluetooth_port).await?;
        let local = server.local_address().await?;
        tracing::info!(bridge = %spec.name, port = local.port, "Bluetooth server socket bound");
        server.listen(None).await?;
        if let Some(service) = &spec.service {
            server.advertise_service(&service.name, &service.uuid).await?;
            tracing::info!(bridge = %spec.name, service = %service.name, uuid = %service.uuid, "Advertised service");
        }
        Ok(local.port)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BridgeSpec {
        &self.spec
    }

    /// Port the server socket is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_accepting(&self) -> bool {
        !self.accept_loop.is_finished()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let registry = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .iter()
            .map(|(id, (peer, state))| ConnectionInfo {
                id: *id,
                peer: peer.clone(),
                state: *state.borrow(),
            })
            .collect()
    }

    /// Stop accepting, close every connection and the server socket.
    pub async fn close(self) {
        tracing::info!(bridge = %self.spec.name, "Closing bridge");
        self.scope.shutdown().await;
        let mut registry = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        registry.clear();
    }
}

async fn accept_loop(spec: BridgeSpec, mut server: BluetoothSocket, scope: Scope, connections: Registry) {
    let cancel = scope.token();
    let handler_scope = scope.clone();
    let handler_spec = spec.clone();
    let handler = move |session: BluetoothSocket| {
        serve(handler_spec.clone(), session, handler_scope.clone(), Arc::clone(&connections))
    };

    tracing::info!(bridge = %spec.name, "Waiting for bluetooth connections");
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = server.accept_cycle(handler) => {
            if let Err(e) = result {
                tracing::info!(bridge = %spec.name, error = %e, "Accept loop ended");
            }
        }
    }
    if let Err(e) = server.close().await {
        tracing::debug!(bridge = %spec.name, error = %e, "Server socket close failed");
    }
    tracing::info!(bridge = %spec.name, "Terminated");
}

/// Hand one accepted session to a relay task on the bridge scope.
async fn serve(spec: BridgeSpec, mut session: BluetoothSocket, scope: Scope, connections: Registry) {
    let peer = session
        .peer()
        .map(ToString::to_string)
        .unwrap_or_else(|| session.id().to_string());
    tracing::info!(bridge = %spec.name, %peer, "Accepted connection");

    if spec.net_protocol != NetProtocol::Tcp {
        tracing::warn!(bridge = %spec.name, protocol = %spec.net_protocol, "Unsupported net protocol, skipped");
        let _ = session.close().await;
        return;
    }

    let connection = BridgeConnection::new(peer, spec.net_host.clone(), spec.net_port, spec.reconnect);
    let id = connection.id();
    connections
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, (connection.peer().to_string(), connection.subscribe()));

    let cancel = scope.token();
    let task_scope = scope.clone();
    scope.spawn(async move {
        connection.run(session, cancel, &task_scope).await;
        connections.lock().unwrap_or_else(|e| e.into_inner()).shift_remove(&id);
    });
}

/// Start every bridge, logging the ones that fail.
pub async fn start_all(
    specs: impl IntoIterator<Item = BridgeSpec>,
    supervisor: &WorkerSupervisor,
    scope: &Scope,
) -> Vec<Bridge> {
    let mut bridges = Vec::new();
    for spec in specs {
        let name = spec.name.clone();
        match Bridge::start(spec, supervisor, scope).await {
            Ok(bridge) => bridges.push(bridge),
            Err(e) => tracing::error!(bridge = %name, error = %e, "Bridge not started"),
        }
    }
    bridges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::config::WorkerConfig;
    use crate::model::SocketProtocol;
    use crate::relay::config::{ReconnectPolicy, ServiceAdvert};
    use crate::session::SessionError;
    use crate::test_support::{FakeScript, FakeSpawner};
    use crate::wire::WireError;

    fn spec(net_port: u16) -> BridgeSpec {
        BridgeSpec {
            name: "robot".into(),
            bluetooth_port: Some(3),
            bluetooth_protocol: SocketProtocol::Rfcomm,
            service: Some(ServiceAdvert {
                name: "robot".into(),
                uuid: "94f39d29-7d6d-437d-973b-fba39e49d4ee".into(),
            }),
            net_host: "127.0.0.1".into(),
            net_port,
            net_protocol: NetProtocol::Tcp,
            reconnect: ReconnectPolicy::default(),
        }
    }

    async fn supervisor(script: FakeScript) -> (WorkerSupervisor, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner::new(script));
        let config = WorkerConfig::new().with_spawner(spawner.clone());
        let sup = WorkerSupervisor::start(config, &Scope::new()).await.unwrap();
        (sup, spawner)
    }

    fn command_names(spawner: &FakeSpawner) -> Vec<String> {
        spawner
            .commands()
            .iter()
            .map(|c| serde_json::from_str::<serde_json::Value>(c).unwrap()["cmd"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn relays_accepted_connection_to_net_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let script = FakeScript::default()
            .with_session_ids(["server", "c1"])
            .with_accept_limit(1)
            .with_receive("c1", "hello", Duration::from_millis(10));
        let (sup, spawner) = supervisor(script).await;

        let scope = Scope::new();
        let bridge = Bridge::start(spec(listener.local_addr().unwrap().port()), &sup, &scope)
            .await
            .unwrap();
        assert_eq!(bridge.name(), "robot");
        assert_eq!(bridge.port(), 3);
        assert_eq!(
            &command_names(&spawner)[..5],
            ["sock_new", "sock_bind", "sock_get_local_address", "sock_listen", "sock_advertise_service"]
        );

        let (mut net, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        net.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let connections = bridge.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].peer, "AA:BB:CC:DD:EE:FF@1");

        bridge.close().await;
        let names = command_names(&spawner);
        assert_eq!(names.iter().filter(|n| *n == "sock_close").count(), 2);
        sup.close().await;
    }

    #[tokio::test]
    async fn failed_start_closes_server_socket() {
        let (sup, spawner) = supervisor(FakeScript::default().failing_command("sock_listen")).await;

        let err = Bridge::start(spec(1), &sup, &Scope::new()).await.err().unwrap();
        assert!(matches!(
            err,
            RelayError::Session(SessionError::Wire(WireError::Protocol(_)))
        ));
        assert_eq!(command_names(&spawner).last().map(String::as_str), Some("sock_close"));
        assert!(sup.active_actors().await.unwrap().is_empty());
        sup.close().await;
    }

    #[tokio::test]
    async fn udp_bridges_skip_connections() {
        let script = FakeScript::default()
            .with_session_ids(["server", "c1"])
            .with_accept_limit(1);
        let (sup, spawner) = supervisor(script).await;

        let mut udp = spec(1);
        udp.net_protocol = NetProtocol::Udp;
        udp.service = None;
        let bridge = Bridge::start(udp, &sup, &Scope::new()).await.unwrap();

        for _ in 0..200 {
            if !bridge.is_accepting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!bridge.is_accepting());
        bridge.close().await;

        // The accepted session is closed by its handler, not by the bridge.
        let closed = || spawner.commands().iter().any(|c| c.contains("sock_close") && c.contains("c1"));
        for _ in 0..200 {
            if closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed());
        sup.close().await;
    }

    #[tokio::test]
    async fn start_all_skips_failing_bridges() {
        let script = FakeScript::default()
            .failing_command("sock_advertise_service")
            .with_accept_limit(0);
        let (sup, _) = supervisor(script).await;

        let mut plain = spec(1);
        plain.name = "plain".into();
        plain.service = None;
        let bridges = start_all([spec(1), plain], &sup, &Scope::new()).await;
        assert_eq!(bridges.len(), 1);
        assert_eq!(bridges[0].name(), "plain");
        for bridge in bridges {
            bridge.close().await;
        }
        sup.close().await;
    }
}
