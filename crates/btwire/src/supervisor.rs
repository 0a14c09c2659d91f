//! Worker supervisor: owns the worker process and its three routers.
//!
//! Flow:
//! 1. Stage the worker script and spawn the process
//! 2. Frame stdout/stderr into lines and stdin out of lines
//! 3. Route stdout and stderr by content, merge commands into stdin
//! 4. Wait for the worker's first `IDLE`
//! 5. Serve top-level commands one at a time; restart the worker on demand
//!
//! Sockets opened through [`WorkerSupervisor::new_socket`] hold their own
//! routes on the same routers and run concurrently with top-level commands.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::bridge::codec::{decode_reply, encode_command};
use crate::bridge::protocol::{Command, MAIN_SOURCE, Reply, WorkerState, key};
use crate::config::WorkerConfig;
use crate::framer::{LineFramer, LineWriter};
use crate::model::{BluetoothDevice, BluetoothService, LookupResult, ServiceQuery, SocketProtocol};
use crate::router::passage::{allowed_keys, key_equals};
use crate::router::{FanInRouter, FanOutRouter, RouterError, open};
use crate::scope::Scope;
use crate::session::{BluetoothSocket, SessionError};
use crate::wire::{WireError, WireReader, WireWriter};
use crate::worker::{
    ArtifactError, SpawnError, WorkerProcess, WorkerSpawnConfig, prepare_worker_artifact,
};

const MAIN_STDOUT_ROUTE: &str = "main:stdout";
const MAIN_STDERR_ROUTE: &str = "main:stderr";
const MAIN_STDIN_ROUTE: &str = "main:stdin";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("worker did not report IDLE within {0:?}")]
    StartupTimeout(std::time::Duration),
    #[error("worker is not running")]
    NotRunning,
    #[error("supervisor is closed")]
    Closed,
}

/// Handles on one worker generation's routers, shared with its sessions.
#[derive(Clone)]
pub(crate) struct WorkerRoutes {
    pub stdout: FanOutRouter<Reply>,
    pub stderr: FanOutRouter<Reply>,
    pub stdin: FanInRouter<Command>,
    pub capacity: usize,
    /// Scope for tasks that outlive a single call, such as accepted-connection handlers.
    pub tasks: Scope,
}

/// One running worker process and everything wired to it.
struct Generation {
    id: u64,
    process: Box<dyn WorkerProcess>,
    scope: Scope,
    routes: WorkerRoutes,
    reader: WireReader,
    writer: WireWriter,
}

impl Generation {
    /// Drop replies left over from earlier commands.
    fn begin(&mut self) {
        self.reader.skip_remaining();
        for stale in self.reader.check_all_errors() {
            tracing::debug!(generation = self.id, error = %stale, "Discarding stale worker error");
        }
    }

    /// Close routers and channels, then stop the process if it is still up.
    async fn teardown(mut self) {
        tracing::debug!(generation = self.id, "Tearing down worker generation");
        self.routes.stderr.close().await;
        self.routes.stdout.close().await;
        self.reader.close();
        drop(self.writer);
        self.routes.stdin.close().await;
        self.scope.shutdown().await;

        if self.process.is_alive() {
            if let Err(e) = self.process.kill().await {
                tracing::warn!(generation = self.id, error = %e, "Failed to kill worker");
            }
        }
    }
}

pub struct WorkerSupervisor {
    config: WorkerConfig,
    scope: Scope,
    generation: Mutex<Option<Generation>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl WorkerSupervisor {
    /// Start the worker and wait until it is ready for commands.
    pub async fn start(config: WorkerConfig, scope: &Scope) -> Result<Self, SupervisorError> {
        let supervisor = Self::new(config, scope);
        supervisor.ensure_running().await?;
        Ok(supervisor)
    }

    /// Create without starting; the first command starts the worker.
    pub fn new(config: WorkerConfig, scope: &Scope) -> Self {
        Self {
            config,
            scope: scope.child(),
            generation: Mutex::new(None),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn is_alive(&self) -> bool {
        let mut slot = self.generation.lock().await;
        slot.as_mut().is_some_and(|g| g.process.is_alive())
    }

    pub async fn pid(&self) -> Option<u32> {
        let slot = self.generation.lock().await;
        slot.as_ref().and_then(|g| g.process.id())
    }

    /// Start the worker if it is not alive.
    pub async fn ensure_running(&self) -> Result<(), SupervisorError> {
        let mut slot = self.generation.lock().await;
        self.running(&mut slot).await.map(|_| ())
    }

    async fn running<'a>(
        &self,
        slot: &'a mut Option<Generation>,
    ) -> Result<&'a mut Generation, SupervisorError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SupervisorError::Closed);
        }
        let alive = slot.as_mut().is_some_and(|g| g.process.is_alive());
        if !alive {
            if let Some(old) = slot.take() {
                tracing::warn!(generation = old.id, "Worker is not alive, restarting");
                old.teardown().await;
            }
            *slot = Some(self.start_generation().await?);
        }
        slot.as_mut().ok_or(SupervisorError::NotRunning)
    }

    async fn start_generation(&self) -> Result<Generation, SupervisorError> {
        let id = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let script = prepare_worker_artifact(&self.config.artifact)?;
        let io = self
            .config
            .spawner
            .spawn(&WorkerSpawnConfig { script })
            .await?;
        let pid = io.process.id();
        tracing::info!(generation = id, ?pid, "Worker spawned");

        let scope = self.scope.child();
        let capacity = self.config.route_capacity;
        let delivery = self.config.delivery;

        let (stdout_lines, _) = LineFramer::spawn("worker-stdout", io.stdout, &scope).into_parts();
        let (stderr_lines, _) = LineFramer::spawn("worker-stderr", io.stderr, &scope).into_parts();
        let (stdin_lines, _) = LineWriter::spawn("worker-stdin", io.stdin, capacity, &scope);

        let stdout = FanOutRouter::spawn(
            "worker-stdout",
            stdout_lines,
            |line: String| decode_reply(&line),
            delivery,
            &scope,
        );
        let stderr = FanOutRouter::spawn(
            "worker-stderr",
            stderr_lines,
            |line: String| {
                let reply = decode_reply(&line);
                if reply.is_none() && !line.trim().is_empty() {
                    tracing::debug!(target: "btwire::worker", "{}", line);
                }
                reply
            },
            delivery,
            &scope,
        );
        let stdin = FanInRouter::spawn(
            "worker-stdin",
            stdin_lines,
            |command: Command| match encode_command(&command) {
                Ok(line) => Some(line),
                Err(e) => {
                    tracing::error!(cmd = command.name(), error = %e, "Failed to encode command");
                    None
                }
            },
            &scope,
        );

        let routes = WorkerRoutes {
            stdout,
            stderr,
            stdin,
            capacity,
            tasks: self.scope.clone(),
        };

        let mut generation = match Self::wire_main_routes(&routes).await {
            Ok((reader, writer)) => Generation {
                id,
                process: io.process,
                scope,
                routes,
                reader,
                writer,
            },
            Err(e) => {
                let mut process = io.process;
                routes.stderr.close().await;
                routes.stdout.close().await;
                routes.stdin.close().await;
                scope.shutdown().await;
                let _ = process.kill().await;
                return Err(e.into());
            }
        };

        let ready = tokio::time::timeout(
            self.config.startup_timeout,
            generation.reader.ensure_state(WorkerState::Idle),
        )
        .await;
        match ready {
            Ok(Ok(())) => {
                tracing::info!(generation = id, ?pid, "Worker ready");
                Ok(generation)
            }
            Ok(Err(e)) => {
                tracing::error!(generation = id, error = %e, "Worker failed to become ready");
                generation.teardown().await;
                Err(e.into())
            }
            Err(_) => {
                tracing::error!(generation = id, "Worker startup timed out");
                generation.teardown().await;
                Err(SupervisorError::StartupTimeout(self.config.startup_timeout))
            }
        }
    }

    async fn wire_main_routes(
        routes: &WorkerRoutes,
    ) -> Result<(WireReader, WireWriter), RouterError> {
        let replies = routes
            .stdout
            .new_route(MAIN_STDOUT_ROUTE, routes.capacity, allowed_keys(key::TOP_LEVEL))
            .await?;
        let errors = routes
            .stderr
            .new_route(MAIN_STDERR_ROUTE, routes.capacity, key_equals(key::SOURCE, MAIN_SOURCE))
            .await?;
        let commands = routes
            .stdin
            .new_route(MAIN_STDIN_ROUTE, routes.capacity, open())
            .await?;

        routes.stderr.start().await?;
        routes.stdout.start().await?;
        routes.stdin.start().await?;

        Ok((
            WireReader::new("main", replies, errors),
            WireWriter::new("main", commands),
        ))
    }

    pub async fn scan(&self) -> Result<Vec<BluetoothDevice>, SupervisorError> {
        let mut slot = self.generation.lock().await;
        let g = self.running(&mut slot).await?;
        g.begin();
        g.writer.write_scan().await?;
        g.reader.ensure_busy_state(WorkerState::Scanning).await?;
        let devices = g.reader.read_scan_result().await?;
        g.reader.ensure_state(WorkerState::Idle).await?;
        tracing::debug!(count = devices.len(), "Scan complete");
        Ok(devices)
    }

    pub async fn lookup(&self, address: &str) -> Result<LookupResult, SupervisorError> {
        let mut slot = self.generation.lock().await;
        let g = self.running(&mut slot).await?;
        g.begin();
        g.writer.write_lookup(address).await?;
        g.reader.ensure_busy_state(WorkerState::LookingUp).await?;
        let result = g.reader.read_lookup_result().await?;
        g.reader.ensure_state(WorkerState::Idle).await?;
        Ok(result)
    }

    pub async fn find_services(
        &self,
        query: &ServiceQuery,
    ) -> Result<Vec<BluetoothService>, SupervisorError> {
        let mut slot = self.generation.lock().await;
        let g = self.running(&mut slot).await?;
        g.begin();
        g.writer.write_find_services(query).await?;
        g.reader.ensure_busy_state(WorkerState::FindingServices).await?;
        let services = g.reader.read_find_services_result().await?;
        g.reader.ensure_state(WorkerState::Idle).await?;
        Ok(services)
    }

    /// A free channel (RFCOMM) or PSM (L2CAP) on the local adapter.
    pub async fn available_port(&self, protocol: SocketProtocol) -> Result<u16, SupervisorError> {
        let mut slot = self.generation.lock().await;
        let g = self.running(&mut slot).await?;
        g.begin();
        g.writer.write_available_port(protocol).await?;
        g.reader
            .ensure_busy_state(WorkerState::GettingAvailablePort)
            .await?;
        let port = g.reader.read_available_port().await?;
        g.reader.ensure_state(WorkerState::Idle).await?;
        Ok(port)
    }

    /// Names of the sockets the worker currently holds.
    pub async fn active_actors(&self) -> Result<Vec<String>, SupervisorError> {
        let mut slot = self.generation.lock().await;
        let g = self.running(&mut slot).await?;
        g.begin();
        g.writer.write_active_actors().await?;
        g.reader
            .ensure_busy_state(WorkerState::GettingActiveActors)
            .await?;
        let actors = g.reader.read_active_actors().await?;
        g.reader.ensure_state(WorkerState::Idle).await?;
        Ok(actors)
    }

    /// Create a socket in the worker and attach a session to it.
    pub async fn new_socket(
        &self,
        protocol: SocketProtocol,
    ) -> Result<BluetoothSocket, SupervisorError> {
        let mut slot = self.generation.lock().await;
        let g = self.running(&mut slot).await?;
        g.begin();
        g.writer.write_new_socket(protocol).await?;
        g.reader.ensure_busy_state(WorkerState::CreatingSocket).await?;
        let id = g.reader.read_new_socket_uuid().await?;
        g.reader.ensure_state(WorkerState::Idle).await?;
        let socket = BluetoothSocket::open(g.routes.clone(), id, protocol).await?;
        tracing::debug!(generation = g.id, session = %socket.id(), %protocol, "Socket created");
        Ok(socket)
    }

    /// Attach a session to an id without creating the socket in the worker.
    #[cfg(test)]
    pub(crate) async fn attach_session(
        &self,
        id: crate::bridge::protocol::SessionId,
        protocol: SocketProtocol,
    ) -> Result<BluetoothSocket, SupervisorError> {
        let mut slot = self.generation.lock().await;
        let g = self.running(&mut slot).await?;
        Ok(BluetoothSocket::open(g.routes.clone(), id, protocol).await?)
    }

    /// Terminate the worker and release every route. Later calls return
    /// [`SupervisorError::Closed`].
    pub async fn close(&self) {
        let mut slot = self.generation.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut g) = slot.take() {
            if g.process.is_alive() {
                g.begin();
                match Self::terminate(&mut g).await {
                    Ok(code) => tracing::info!(generation = g.id, ?code, "Worker terminated"),
                    Err(e) => tracing::warn!(generation = g.id, error = %e, "Worker did not terminate cleanly"),
                }
            }
            g.teardown().await;
        }
        self.scope.shutdown().await;
    }

    async fn terminate(g: &mut Generation) -> Result<Option<i32>, SupervisorError> {
        g.writer.write_terminate().await?;
        g.reader.ensure_busy_state(WorkerState::Terminated).await?;
        let code = g
            .process
            .wait()
            .await
            .map_err(|e| SupervisorError::Spawn(SpawnError::Spawn(e)))?;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::test_support::{FakeScript, FakeSpawner};

    async fn supervisor(script: FakeScript) -> (WorkerSupervisor, Arc<FakeSpawner>) {
        let spawner = Arc::new(FakeSpawner::new(script));
        let config = WorkerConfig::new()
            .with_spawner(spawner.clone())
            .with_startup_timeout(Duration::from_secs(5));
        let supervisor = WorkerSupervisor::start(config, &Scope::new()).await.unwrap();
        (supervisor, spawner)
    }

    #[tokio::test]
    async fn scan_returns_devices() {
        let script = FakeScript::default().with_device("00:11:22:33:44:55", "headset", 0x240404);
        let (sup, spawner) = supervisor(script).await;

        let devices = sup.scan().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "00:11:22:33:44:55");
        assert_eq!(devices[0].name.as_deref(), Some("headset"));
        assert_eq!(spawner.spawn_count(), 1);

        let commands = spawner.commands();
        assert_eq!(commands, vec![r#"{"cmd":"scan"}"#.to_string()]);
        sup.close().await;
    }

    #[tokio::test]
    async fn debug_output_does_not_block_replies() {
        let script = FakeScript::default()
            .with_device("00:11:22:33:44:55", "headset", 0x240404)
            .with_name("00:11:22:33:44:55", "headset")
            .with_debug_noise();
        let (sup, _) = supervisor(script).await;

        let devices = tokio::time::timeout(Duration::from_secs(5), sup.scan())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(
            sup.lookup("00:11:22:33:44:55").await.unwrap(),
            LookupResult::Found { name: "headset".to_string() }
        );
        sup.close().await;
    }

    #[tokio::test]
    async fn consecutive_commands_reuse_worker() {
        let script = FakeScript::default().with_name("AA:BB:CC:DD:EE:FF", "phone");
        let (sup, spawner) = supervisor(script).await;

        assert_eq!(
            sup.lookup("AA:BB:CC:DD:EE:FF").await.unwrap(),
            LookupResult::Found { name: "phone".to_string() }
        );
        assert!(matches!(
            sup.lookup("11:11:11:11:11:11").await.unwrap(),
            LookupResult::NotFound { reason: Some(_) }
        ));
        assert!(sup.scan().await.unwrap().is_empty());
        assert_eq!(sup.available_port(SocketProtocol::Rfcomm).await.unwrap(), 1);
        assert_eq!(spawner.spawn_count(), 1);
        sup.close().await;
    }

    #[tokio::test]
    async fn find_services_decodes_records() {
        let script = FakeScript::default().with_service("00:11:22:33:44:55", "SPP", 3);
        let (sup, _) = supervisor(script).await;

        let services = sup
            .find_services(&ServiceQuery::any().with_name("SPP"))
            .await
            .unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].port, Some(3));
        assert_eq!(services[0].protocol, crate::model::ServiceProtocol::Rfcomm);
        sup.close().await;
    }

    #[tokio::test]
    async fn main_error_surfaces_as_protocol_error() {
        let (sup, _) = supervisor(FakeScript::default().failing_command("scan")).await;

        let err = sup.scan().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Wire(WireError::Protocol(_))));

        // The worker went back to IDLE; the next command works.
        assert!(sup.active_actors().await.unwrap().is_empty());
        sup.close().await;
    }

    #[tokio::test]
    async fn dead_worker_is_restarted_on_next_command() {
        let (sup, spawner) = supervisor(FakeScript::default()).await;
        assert!(sup.is_alive().await);

        spawner.kill_current();
        for _ in 0..100 {
            if !sup.is_alive().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!sup.is_alive().await);

        sup.scan().await.unwrap();
        assert_eq!(spawner.spawn_count(), 2);
        assert!(sup.is_alive().await);
        sup.close().await;
    }

    #[tokio::test]
    async fn sessions_of_dead_generation_fail_closed() {
        let (sup, spawner) = supervisor(FakeScript::default()).await;
        let mut socket = sup.new_socket(SocketProtocol::Rfcomm).await.unwrap();

        spawner.kill_current();
        for _ in 0..100 {
            if !sup.is_alive().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sup.ensure_running().await.unwrap();

        let err = socket.bind(Some(1)).await.unwrap_err();
        assert!(err.is_closed(), "{err}");
        sup.close().await;
    }

    #[tokio::test]
    async fn close_terminates_worker_and_rejects_further_commands() {
        let (sup, spawner) = supervisor(FakeScript::default()).await;
        sup.close().await;

        assert!(!sup.is_alive().await);
        assert!(spawner.commands().iter().any(|c| c.contains("terminate")));
        assert!(matches!(sup.scan().await, Err(SupervisorError::Closed)));
        sup.close().await;
    }

    #[tokio::test]
    async fn startup_fails_when_worker_never_idles() {
        let spawner = Arc::new(FakeSpawner::new(FakeScript::default().silent()));
        let config = WorkerConfig::new()
            .with_spawner(spawner)
            .with_startup_timeout(Duration::from_millis(50));
        let err = WorkerSupervisor::start(config, &Scope::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::StartupTimeout(_)));
    }

    #[tokio::test]
    async fn socket_commands_interleave_with_top_level() {
        let (sup, _) = supervisor(FakeScript::default()).await;
        let mut socket = sup.new_socket(SocketProtocol::Rfcomm).await.unwrap();

        socket.bind(Some(1)).await.unwrap();
        // Socket commands leave extra IDLE reports on the main route.
        let devices = sup.scan().await.unwrap();
        assert!(devices.is_empty());
        socket.listen(Some(1)).await.unwrap();
        assert_eq!(sup.active_actors().await.unwrap().len(), 1);
        socket.close().await.unwrap();
        sup.close().await;
    }
}
