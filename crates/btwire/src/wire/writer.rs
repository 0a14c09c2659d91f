use tokio::sync::mpsc;

use super::WireError;
use crate::bridge::protocol::{Command, SessionId, cmd};
use crate::model::{ServiceQuery, SocketProtocol};

/// Default buffer size requested by `sock_receive`.
pub const DEFAULT_RECEIVE_SIZE: usize = 1024;

/// Writes commands into one inbound route of the stdin router.
#[derive(Debug, Clone)]
pub struct WireWriter {
    name: String,
    commands: mpsc::Sender<Command>,
}

impl WireWriter {
    pub fn new(name: impl Into<String>, commands: mpsc::Sender<Command>) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn write_command(&self, command: Command) -> Result<(), WireError> {
        tracing::trace!(writer = %self.name, cmd = command.name(), "Writing command");
        self.commands
            .send(command)
            .await
            .map_err(|_| WireError::Closed(self.name.clone()))
    }

    /// Write `{"cmd": name, k1: v1, ...}`.
    pub async fn write(&self, name: &str, args: &[(&str, &str)]) -> Result<(), WireError> {
        let command = args
            .iter()
            .fold(Command::new(name), |c, (k, v)| c.arg(*k, *v));
        self.write_command(command).await
    }

    pub async fn write_scan(&self) -> Result<(), WireError> {
        self.write_command(Command::new(cmd::SCAN)).await
    }

    pub async fn write_lookup(&self, address: &str) -> Result<(), WireError> {
        self.write_command(Command::new(cmd::LOOKUP).arg("address", address))
            .await
    }

    pub async fn write_find_services(&self, query: &ServiceQuery) -> Result<(), WireError> {
        self.write_command(
            Command::new(cmd::FIND_SERVICES)
                .opt_arg("name", query.name.as_deref())
                .opt_arg("uuid", query.uuid.as_deref())
                .opt_arg("address", query.address.as_deref()),
        )
        .await
    }

    pub async fn write_terminate(&self) -> Result<(), WireError> {
        self.write_command(Command::new(cmd::TERMINATE)).await
    }

    pub async fn write_available_port(&self, protocol: SocketProtocol) -> Result<(), WireError> {
        self.write_command(Command::new(cmd::GET_AVAILABLE_PORT).arg("protocol", protocol.as_str()))
            .await
    }

    pub async fn write_active_actors(&self) -> Result<(), WireError> {
        self.write_command(Command::new(cmd::GET_ACTIVE_ACTORS))
            .await
    }

    pub async fn write_new_socket(&self, protocol: SocketProtocol) -> Result<(), WireError> {
        self.write_command(Command::new(cmd::SOCK_NEW).arg("protocol", protocol.as_str()))
            .await
    }

    pub async fn write_bind(&self, session: &SessionId, port: Option<u16>) -> Result<(), WireError> {
        self.write_command(
            Command::for_session(cmd::SOCK_BIND, session).opt_arg("port", port.map(|p| p.to_string())),
        )
        .await
    }

    pub async fn write_listen(&self, session: &SessionId, backlog: Option<u32>) -> Result<(), WireError> {
        self.write_command(
            Command::for_session(cmd::SOCK_LISTEN, session)
                .opt_arg("backlog", backlog.map(|b| b.to_string())),
        )
        .await
    }

    pub async fn write_accept(&self, session: &SessionId) -> Result<(), WireError> {
        self.write_command(Command::for_session(cmd::SOCK_ACCEPT, session))
            .await
    }

    pub async fn write_connect(&self, session: &SessionId, address: &str, port: u16) -> Result<(), WireError> {
        self.write_command(
            Command::for_session(cmd::SOCK_CONNECT, session)
                .arg("address", address)
                .arg("port", port.to_string()),
        )
        .await
    }

    pub async fn write_receive(&self, session: &SessionId, bufsize: usize) -> Result<(), WireError> {
        self.write_command(
            Command::for_session(cmd::SOCK_RECEIVE, session).arg("bufsize", bufsize.to_string()),
        )
        .await
    }

    /// Payload travels as text; invalid UTF-8 is replaced.
    pub async fn write_send(&self, session: &SessionId, data: &[u8]) -> Result<(), WireError> {
        self.write_command(
            Command::for_session(cmd::SOCK_SEND, session).arg("data", String::from_utf8_lossy(data)),
        )
        .await
    }

    pub async fn write_shutdown(&self, session: &SessionId) -> Result<(), WireError> {
        self.write_command(Command::for_session(cmd::SOCK_SHUTDOWN, session))
            .await
    }

    pub async fn write_close(&self, session: &SessionId) -> Result<(), WireError> {
        self.write_command(Command::for_session(cmd::SOCK_CLOSE, session))
            .await
    }

    pub async fn write_set_l2cap_mtu(&self, session: &SessionId, mtu: u16) -> Result<(), WireError> {
        self.write_command(
            Command::for_session(cmd::SOCK_SET_L2CAP_MTU, session).arg("mtu", mtu.to_string()),
        )
        .await
    }

    pub async fn write_advertise_service(
        &self,
        session: &SessionId,
        service_name: &str,
        service_uuid: &str,
    ) -> Result<(), WireError> {
        self.write_command(
            Command::for_session(cmd::SOCK_ADVERTISE_SERVICE, session)
                .arg("service_name", service_name)
                .arg("service_uuid", service_uuid),
        )
        .await
    }

    pub async fn write_stop_advertising(&self, session: &SessionId) -> Result<(), WireError> {
        self.write_command(Command::for_session(cmd::SOCK_STOP_ADVERTISING, session))
            .await
    }

    pub async fn write_local_address(&self, session: &SessionId) -> Result<(), WireError> {
        self.write_command(Command::for_session(cmd::SOCK_GET_LOCAL_ADDRESS, session))
            .await
    }

    pub async fn write_remote_address(&self, session: &SessionId) -> Result<(), WireError> {
        self.write_command(Command::for_session(cmd::SOCK_GET_REMOTE_ADDRESS, session))
            .await
    }
}
