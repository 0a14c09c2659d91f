//! Wire vocabulary shared with the worker process.
//!
//! Three streams:
//! - **stdin**: one [`Command`] per line, `{"cmd": "<name>", "<arg>": "<value>", ...}`
//! - **stdout**: [`Reply`] objects, each carrying one recognised result key
//! - **stderr**: error reports, `{"source": "...", "err": "..."}`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command names understood by the worker.
pub mod cmd {
    pub const SCAN: &str = "scan";
    pub const LOOKUP: &str = "lookup";
    pub const FIND_SERVICES: &str = "find_services";
    pub const TERMINATE: &str = "terminate";
    pub const GET_AVAILABLE_PORT: &str = "get_available_port";
    pub const GET_ACTIVE_ACTORS: &str = "get_active_actors";
    pub const SOCK_NEW: &str = "sock_new";
    pub const SOCK_BIND: &str = "sock_bind";
    pub const SOCK_LISTEN: &str = "sock_listen";
    pub const SOCK_ACCEPT: &str = "sock_accept";
    pub const SOCK_RECEIVE: &str = "sock_receive";
    pub const SOCK_CLOSE: &str = "sock_close";
    pub const SOCK_CONNECT: &str = "sock_connect";
    pub const SOCK_SEND: &str = "sock_send";
    pub const SOCK_SHUTDOWN: &str = "sock_shutdown";
    pub const SOCK_SET_L2CAP_MTU: &str = "sock_set_l2cap_mtu";
    pub const SOCK_ADVERTISE_SERVICE: &str = "sock_advertise_service";
    pub const SOCK_STOP_ADVERTISING: &str = "sock_stop_advertising";
    pub const SOCK_GET_LOCAL_ADDRESS: &str = "sock_get_local_address";
    pub const SOCK_GET_REMOTE_ADDRESS: &str = "sock_get_remote_address";
}

/// Keys that may appear in worker output.
pub mod key {
    /// Reserved command-name field on outbound lines.
    pub const CMD: &str = "cmd";

    pub const STATE: &str = "state";
    pub const SCAN_RES: &str = "scan_res";
    pub const LOOKUP_RES: &str = "lookup_res";
    pub const LOOKUP_ERR_NAME: &str = "errName";
    pub const LOOKUP_ERR_ARGS: &str = "errArgs";
    pub const FIND_SERVICES_RES: &str = "find_services_res";
    pub const NEW_SOCKET_UUID: &str = "new_socket_uuid";
    pub const AVAILABLE_PORT: &str = "available_port";
    pub const ACTIVE_ACTORS_RES: &str = "active_actors_res";

    pub const SOCK_UUID: &str = "sock_uuid";
    pub const ACCEPT_RES: &str = "accept_res";
    pub const ACCEPT_RES_ADDRESS: &str = "accept_res_address";
    pub const ACCEPT_RES_PORT: &str = "accept_res_port";
    pub const SOCK_LOCAL_ADDRESS: &str = "sock_local_address";
    pub const SOCK_LOCAL_PORT: &str = "sock_local_port";
    pub const SOCK_REMOTE_ADDRESS: &str = "sock_remote_address";
    pub const SOCK_REMOTE_PORT: &str = "sock_remote_port";
    pub const ADVERTISE_SERVICE_RES: &str = "advertise_service_res";
    pub const STOP_ADVERTISING_RES: &str = "stop_advertising_res";
    pub const SET_L2CAP_MTU_RES: &str = "set_l2cap_mtu_res";
    pub const CONNECT_RES: &str = "connect_res";
    pub const BIND_RES: &str = "bind_res";
    pub const LISTEN_RES: &str = "listen_res";
    pub const SENT_RES: &str = "sent_res";
    pub const SHUTDOWN_RES: &str = "shutdown_res";
    pub const CLOSE_RES: &str = "close_res";
    pub const RECEIVE_RES: &str = "receive_res";
    /// Older workers name the receive payload this way.
    pub const RECEIVED_DATA: &str = "received_data";
    pub const SIZE: &str = "size";

    pub const SOURCE: &str = "source";
    pub const ERR: &str = "err";

    /// Result keys routed to the top-level reader.
    pub const TOP_LEVEL: &[&str] = &[
        STATE,
        SCAN_RES,
        LOOKUP_RES,
        FIND_SERVICES_RES,
        NEW_SOCKET_UUID,
        AVAILABLE_PORT,
        ACTIVE_ACTORS_RES,
    ];
}

/// `source` value the worker uses for errors raised by its main loop.
pub const MAIN_SOURCE: &str = "main";

/// Marker carried by errors that come from the native Bluetooth stack.
pub const NATIVE_ERROR_MARKER: &str = "BluetoothError";

/// Identifier minted by the worker for one logical socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One outbound command: a name plus ordered string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<(String, String)>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    /// Adds the argument only when a value is present.
    pub fn opt_arg(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.arg(key, value),
            None => self,
        }
    }

    /// Command addressed to one session.
    pub fn for_session(name: impl Into<String>, session: &SessionId) -> Self {
        Self::new(name).arg(key::SOCK_UUID, session.as_str())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The JSON object written to the worker's stdin.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::with_capacity(self.args.len() + 1);
        obj.insert(key::CMD.to_string(), Value::String(self.name.clone()));
        for (k, v) in &self.args {
            if k == key::CMD {
                tracing::warn!(cmd = %self.name, "Ignoring argument named cmd");
                continue;
            }
            obj.insert(k.clone(), Value::String(v.clone()));
        }
        obj
    }
}

/// A JSON object read from the worker.
///
/// Replies are not otherwise typed: callers match on which result key is present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reply(Map<String, Value>);

impl Reply {
    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer field, accepting both JSON numbers and numeric strings.
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Session the reply belongs to, if any.
    pub fn session(&self) -> Option<&str> {
        self.str(key::SOCK_UUID)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Reply {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// Error report read from the worker's stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub source: String,
    pub err: String,
}

impl ErrorReport {
    pub fn from_reply(reply: &Reply) -> Option<Self> {
        let err = reply.str(key::ERR)?;
        Some(Self {
            source: reply.str(key::SOURCE).unwrap_or_default().trim().to_string(),
            err: err.trim().to_string(),
        })
    }

    /// True when the error was raised by the native Bluetooth stack.
    pub fn is_native_io(&self) -> bool {
        self.source.contains(NATIVE_ERROR_MARKER) || self.err.contains(NATIVE_ERROR_MARKER)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.err)
    }
}

/// State reported by the worker after every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Idle,
    Scanning,
    LookingUp,
    FindingServices,
    CreatingSocket,
    BindingSocket,
    ListeningSocket,
    AcceptingSocket,
    ReceivingSocket,
    SendingSocket,
    ClosingSocket,
    Terminated,
    GettingAvailablePort,
    GettingActiveActors,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Scanning => "SCANNING",
            Self::LookingUp => "LOOKING_UP",
            Self::FindingServices => "FINDING_SERVICES",
            Self::CreatingSocket => "CREATING_SOCKET",
            Self::BindingSocket => "BINDING_SOCKET",
            Self::ListeningSocket => "LISTENING_SOCKET",
            Self::AcceptingSocket => "ACCEPTING_SOCKET",
            Self::ReceivingSocket => "RECEIVING_SOCKET",
            Self::SendingSocket => "SENDING_SOCKET",
            Self::ClosingSocket => "CLOSING_SOCKET",
            Self::Terminated => "TERMINATED",
            Self::GettingAvailablePort => "GETTING_AVAILABLE_PORT",
            Self::GettingActiveActors => "GETTING_ACTIVE_ACTORS",
        }
    }

    /// Case-insensitive parse of a state tag.
    pub fn parse(tag: &str) -> Option<Self> {
        let upper = tag.trim().to_ascii_uppercase();
        serde_json::from_value(Value::String(upper)).ok()
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
