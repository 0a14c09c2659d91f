//! Socket sessions.
//!
//! A [`BluetoothSocket`] is a handle on one socket living in the worker. It
//! owns three private routes: replies tagged with its id, error reports whose
//! source names it, and a command route into stdin. Sessions run
//! independently of each other and of top-level commands.
//!
//! Dropping a session without [`BluetoothSocket::close`] leaves the worker
//! socket open; its routes are pruned by the routers once they notice the
//! channels are gone.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::bridge::protocol::{SessionId, key};
use crate::model::{SocketAddress, SocketProtocol};
use crate::router::passage::{all_of, allowed_keys, denied_keys, key_equals, source_contains};
use crate::router::{RouteInfo, RouterError, open};
use crate::supervisor::WorkerRoutes;
use crate::wire::{WireError, WireReader, WireWriter};

/// Reply keys that carry received payloads.
const RECEIVE_KEYS: &[&str] = &[key::RECEIVE_RES, key::RECEIVED_DATA];

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("session {0} is closed")]
    Closed(SessionId),
}

impl SessionError {
    /// True when the session can no longer talk to the worker.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Wire(e) => e.is_closed(),
            Self::Router(RouterError::Terminated(_)) => true,
            Self::Router(_) => false,
            Self::Closed(_) => true,
        }
    }
}

/// Names of the routes a session registers.
#[derive(Debug, Clone)]
struct RouteNames {
    stdout: String,
    stderr: String,
    stdin: String,
}

impl RouteNames {
    fn new(id: &SessionId, suffix: &str) -> Self {
        Self {
            stdout: format!("session:{id}:stdout{suffix}"),
            stderr: format!("session:{id}:stderr{suffix}"),
            stdin: format!("session:{id}:stdin{suffix}"),
        }
    }

    /// Withdraw every route. Errors mean the router is already gone.
    async fn withdraw(&self, routes: &WorkerRoutes) {
        let _ = routes.stdout.remove_route(&self.stdout).await;
        let _ = routes.stderr.remove_route(&self.stderr).await;
        let _ = routes.stdin.remove_route(&self.stdin).await;
    }
}

fn ensure_registered(
    found: Result<Option<RouteInfo>, RouterError>,
    name: &str,
) -> Result<(), RouterError> {
    match found? {
        Some(_) => Ok(()),
        None => Err(RouterError::Rejected(format!("route {name} missing after registration"))),
    }
}

pub struct BluetoothSocket {
    id: SessionId,
    protocol: SocketProtocol,
    reader: WireReader,
    writer: WireWriter,
    routes: WorkerRoutes,
    names: RouteNames,
    peer: Option<SocketAddress>,
    closed: bool,
}

impl BluetoothSocket {
    /// Register the session's routes and verify them.
    pub(crate) async fn open(
        routes: WorkerRoutes,
        id: SessionId,
        protocol: SocketProtocol,
    ) -> Result<Self, SessionError> {
        let names = RouteNames::new(&id, "");
        let replies = routes
            .stdout
            .new_route(&names.stdout, routes.capacity, key_equals(key::SOCK_UUID, id.as_str()))
            .await?;
        let errors = routes
            .stderr
            .new_route(&names.stderr, routes.capacity, source_contains(id.as_str()))
            .await?;
        let commands = routes
            .stdin
            .new_route(&names.stdin, routes.capacity, open())
            .await?;

        let verified = async {
            ensure_registered(routes.stdout.get_route(&names.stdout).await, &names.stdout)?;
            ensure_registered(routes.stderr.get_route(&names.stderr).await, &names.stderr)?;
            ensure_registered(routes.stdin.get_route(&names.stdin).await, &names.stdin)
        }
        .await;
        if let Err(e) = verified {
            names.withdraw(&routes).await;
            return Err(e.into());
        }

        let label = format!("session:{id}");
        Ok(Self {
            reader: WireReader::new(label.clone(), replies, errors),
            writer: WireWriter::new(label, commands),
            id,
            protocol,
            routes,
            names,
            peer: None,
            closed: false,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn protocol(&self) -> SocketProtocol {
        self.protocol
    }

    /// Remote endpoint, known after `accept` or `connect`.
    pub fn peer(&self) -> Option<&SocketAddress> {
        self.peer.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.reader.skip_remaining();
        for stale in self.reader.check_all_errors() {
            tracing::debug!(session = %self.id, error = %stale, "Discarding stale session error");
        }
        Ok(())
    }

    /// Bind to `port`, or let the worker choose when `None`.
    pub async fn bind(&mut self, port: Option<u16>) -> Result<(), SessionError> {
        self.begin()?;
        self.writer.write_bind(&self.id, port).await?;
        self.reader.read_ack(key::BIND_RES).await?;
        Ok(())
    }

    pub async fn listen(&mut self, backlog: Option<u32>) -> Result<(), SessionError> {
        self.begin()?;
        self.writer.write_listen(&self.id, backlog).await?;
        self.reader.read_ack(key::LISTEN_RES).await?;
        Ok(())
    }

    /// Wait for one incoming connection and return a session for it.
    pub async fn accept(&mut self) -> Result<BluetoothSocket, SessionError> {
        self.begin()?;
        self.writer.write_accept(&self.id).await?;
        let (child_id, peer) = self.reader.read_accept_result().await?;
        let mut child = BluetoothSocket::open(self.routes.clone(), child_id, self.protocol).await?;
        tracing::info!(session = %self.id, child = %child.id, %peer, "Accepted connection");
        child.peer = Some(peer);
        Ok(child)
    }

    pub async fn connect(&mut self, address: &str, port: u16) -> Result<(), SessionError> {
        self.begin()?;
        self.writer.write_connect(&self.id, address, port).await?;
        self.reader.read_ack(key::CONNECT_RES).await?;
        self.peer = Some(SocketAddress {
            address: address.to_string(),
            port,
        });
        Ok(())
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.begin()?;
        self.writer.write_send(&self.id, data).await?;
        self.reader.read_ack(key::SENT_RES).await?;
        Ok(())
    }

    /// Receive up to `bufsize` bytes.
    pub async fn receive(&mut self, bufsize: usize) -> Result<Vec<u8>, SessionError> {
        self.begin()?;
        self.writer.write_receive(&self.id, bufsize).await?;
        Ok(self.reader.read_received().await?)
    }

    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.begin()?;
        self.writer.write_shutdown(&self.id).await?;
        self.reader.read_ack(key::SHUTDOWN_RES).await?;
        Ok(())
    }

    pub async fn set_l2cap_mtu(&mut self, mtu: u16) -> Result<(), SessionError> {
        self.begin()?;
        self.writer.write_set_l2cap_mtu(&self.id, mtu).await?;
        self.reader.read_ack(key::SET_L2CAP_MTU_RES).await?;
        Ok(())
    }

    /// Publish an SDP record for this (listening) socket.
    pub async fn advertise_service(
        &mut self,
        service_name: &str,
        service_uuid: &str,
    ) -> Result<(), SessionError> {
        self.begin()?;
        self.writer
            .write_advertise_service(&self.id, service_name, service_uuid)
            .await?;
        self.reader.read_ack(key::ADVERTISE_SERVICE_RES).await?;
        Ok(())
    }

    pub async fn stop_advertising(&mut self) -> Result<(), SessionError> {
        self.begin()?;
        self.writer.write_stop_advertising(&self.id).await?;
        self.reader.read_ack(key::STOP_ADVERTISING_RES).await?;
        Ok(())
    }

    pub async fn local_address(&mut self) -> Result<SocketAddress, SessionError> {
        self.begin()?;
        self.writer.write_local_address(&self.id).await?;
        Ok(self.reader.read_local_address().await?)
    }

    pub async fn remote_address(&mut self) -> Result<SocketAddress, SessionError> {
        self.begin()?;
        self.writer.write_remote_address(&self.id).await?;
        Ok(self.reader.read_remote_address().await?)
    }

    /// Close the worker socket and withdraw the session's routes.
    ///
    /// The routes are withdrawn even when the close command fails.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.reader.skip_remaining();
        let result = async {
            self.writer.write_close(&self.id).await?;
            self.reader.read_ack(key::CLOSE_RES).await
        }
        .await;
        self.closed = true;
        self.reader.close();
        self.names.withdraw(&self.routes).await;
        tracing::debug!(session = %self.id, "Session closed");
        Ok(result?)
    }

    /// Accept connections until accepting fails, running `handler` on each
    /// accepted session in its own task.
    pub async fn accept_cycle<F, Fut>(&mut self, mut handler: F) -> Result<(), SessionError>
    where
        F: FnMut(BluetoothSocket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let child = self.accept().await?;
            self.routes.tasks.spawn(handler(child));
        }
    }

    /// Run [`accept_cycle`](Self::accept_cycle) in the background.
    pub fn async_accept_all<F, Fut>(mut self, handler: F) -> JoinHandle<Result<(), SessionError>>
    where
        F: FnMut(BluetoothSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tasks = self.routes.tasks.clone();
        tasks.spawn(async move {
            let result = self.accept_cycle(handler).await;
            if let Err(e) = &result {
                tracing::info!(session = %self.id, error = %e, "Accept loop ended");
            }
            result
        })
    }

    /// Split into independent receive and send halves that may be driven
    /// concurrently. Receive replies go to the receiver; everything else to the sender.
    pub async fn split(self) -> Result<(SocketReceiver, SocketSender), SessionError> {
        if self.closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        let rx_names = RouteNames::new(&self.id, ":rx");
        let capacity = self.routes.capacity;

        let rx_replies = self
            .routes
            .stdout
            .new_route(
                &rx_names.stdout,
                capacity,
                all_of(vec![
                    key_equals(key::SOCK_UUID, self.id.as_str()),
                    allowed_keys(RECEIVE_KEYS),
                ]),
            )
            .await?;
        let rx_errors = self
            .routes
            .stderr
            .new_route(&rx_names.stderr, capacity, source_contains(self.id.as_str()))
            .await?;
        // Re-registering under the same name replaces the original reply route.
        let tx_replies = self
            .routes
            .stdout
            .new_route(
                &self.names.stdout,
                capacity,
                all_of(vec![
                    key_equals(key::SOCK_UUID, self.id.as_str()),
                    denied_keys(RECEIVE_KEYS),
                ]),
            )
            .await?;

        let Self {
            id,
            reader,
            writer,
            routes,
            names,
            ..
        } = self;
        let tx_errors = reader.into_errors();

        let receiver = SocketReceiver {
            reader: WireReader::new(format!("session:{id}:rx"), rx_replies, rx_errors),
            writer: writer.clone(),
            id: id.clone(),
            routes: routes.clone(),
            names: rx_names,
        };
        let sender = SocketSender {
            reader: WireReader::new(format!("session:{id}:tx"), tx_replies, tx_errors),
            writer,
            id,
            routes,
            names,
            closed: false,
        };
        Ok((receiver, sender))
    }
}

/// Receiving half of a split session.
pub struct SocketReceiver {
    id: SessionId,
    reader: WireReader,
    writer: WireWriter,
    routes: WorkerRoutes,
    names: RouteNames,
}

impl SocketReceiver {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn receive(&mut self, bufsize: usize) -> Result<Vec<u8>, SessionError> {
        self.reader.skip_remaining();
        self.writer.write_receive(&self.id, bufsize).await?;
        Ok(self.reader.read_received().await?)
    }

    /// Withdraw the receive routes. The worker socket is closed by the sender.
    pub async fn close(mut self) {
        self.reader.close();
        let _ = self.routes.stdout.remove_route(&self.names.stdout).await;
        let _ = self.routes.stderr.remove_route(&self.names.stderr).await;
    }
}

/// Sending half of a split session. Owns the worker socket's lifetime.
pub struct SocketSender {
    id: SessionId,
    reader: WireReader,
    writer: WireWriter,
    routes: WorkerRoutes,
    names: RouteNames,
    closed: bool,
}

impl SocketSender {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed(self.id.clone()));
        }
        self.reader.skip_remaining();
        self.writer.write_send(&self.id, data).await?;
        self.reader.read_ack(key::SENT_RES).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.reader.skip_remaining();
        self.writer.write_shutdown(&self.id).await?;
        self.reader.read_ack(key::SHUTDOWN_RES).await?;
        Ok(())
    }

    /// Close the worker socket and withdraw the original session routes.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.reader.skip_remaining();
        let result = async {
            self.writer.write_close(&self.id).await?;
            self.reader.read_ack(key::CLOSE_RES).await
        }
        .await;
        self.closed = true;
        self.reader.close();
        self.names.withdraw(&self.routes).await;
        Ok(result?)
    }
}
