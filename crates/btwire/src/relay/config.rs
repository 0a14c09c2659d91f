//! Bridge definitions: one JSON object per line.
//!
//! ```text
//! {"bridge_name": "robot", "bluetooth_protocol": "RFCOMM", "bluetooth_port": 3,
//!  "bluetooth_service_name": "robot", "bluetooth_service_uuid": "94f39d29-...",
//!  "net_host_address": "localhost", "net_host_port": 8020, "net_protocol": "TCP"}
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::SocketProtocol;

/// File looked up when no bridge file is given.
pub const DEFAULT_BRIDGE_FILE: &str = "bridge.json";

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BridgeConfigError {
    #[error("failed to read bridge file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("{field} '{value}' does not exist")]
    UnknownProtocol { field: &'static str, value: String },
    #[error("{0}")]
    IncompleteService(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetProtocol {
    Tcp,
    Udp,
}

impl NetProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for NetProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            _ => Err(format!("unknown net protocol: {s}")),
        }
    }
}

/// SDP record published for a bridge's listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvert {
    pub name: String,
    pub uuid: String,
}

/// How a connection retries its net side after losing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSpec {
    pub name: String,
    /// `None` lets the worker pick a free port.
    pub bluetooth_port: Option<u16>,
    pub bluetooth_protocol: SocketProtocol,
    pub service: Option<ServiceAdvert>,
    pub net_host: String,
    pub net_port: u16,
    pub net_protocol: NetProtocol,
    pub reconnect: ReconnectPolicy,
}

#[derive(Deserialize)]
struct RawBridge {
    bridge_name: Option<String>,
    bluetooth_port: Option<u16>,
    bluetooth_protocol: Option<String>,
    bluetooth_service_uuid: Option<String>,
    bluetooth_service_name: Option<String>,
    net_host_address: Option<String>,
    net_host_port: Option<u16>,
    net_protocol: Option<String>,
}

impl BridgeSpec {
    /// Parse one bridge definition line.
    pub fn parse_line(line: &str) -> Result<Self, BridgeConfigError> {
        let raw: RawBridge = serde_json::from_str(line)?;

        let name = raw.bridge_name.ok_or(BridgeConfigError::Missing("bridge name"))?;
        let protocol = raw
            .bluetooth_protocol
            .ok_or(BridgeConfigError::Missing("bluetooth protocol"))?;
        let bluetooth_protocol =
            protocol
                .parse()
                .map_err(|_| BridgeConfigError::UnknownProtocol {
                    field: "bluetooth protocol",
                    value: protocol.clone(),
                })?;

        let service = match (raw.bluetooth_service_name, raw.bluetooth_service_uuid) {
            (Some(name), Some(uuid)) => Some(ServiceAdvert { name, uuid }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(BridgeConfigError::IncompleteService(
                    "the uuid of the service cannot be null if the name is specified",
                ));
            }
            (None, Some(_)) => {
                return Err(BridgeConfigError::IncompleteService(
                    "the name of the service cannot be null if the uuid is specified",
                ));
            }
        };

        let net_host = raw
            .net_host_address
            .ok_or(BridgeConfigError::Missing("net host"))?;
        let net_port = raw.net_host_port.ok_or(BridgeConfigError::Missing("net port"))?;
        let protocol = raw
            .net_protocol
            .ok_or(BridgeConfigError::Missing("net protocol"))?;
        let net_protocol = protocol
            .parse()
            .map_err(|_| BridgeConfigError::UnknownProtocol {
                field: "net protocol",
                value: protocol.clone(),
            })?;

        if raw.bluetooth_port.is_none() {
            tracing::warn!(bridge = %name, "Missing bluetooth port, the worker will pick one");
        }

        Ok(Self {
            name,
            bluetooth_port: raw.bluetooth_port,
            bluetooth_protocol,
            service,
            net_host,
            net_port,
            net_protocol,
            reconnect: ReconnectPolicy::default(),
        })
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Parse every line, logging and skipping the invalid ones. A later
/// definition replaces an earlier one with the same name.
pub fn parse_bridges(text: &str) -> IndexMap<String, BridgeSpec> {
    let mut bridges = IndexMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match BridgeSpec::parse_line(line) {
            Ok(spec) => {
                tracing::info!(bridge = %spec.name, line = index + 1, "Loaded bridge");
                if bridges.insert(spec.name.clone(), spec).is_some() {
                    tracing::warn!(line = index + 1, "Bridge redefined, keeping the later one");
                }
            }
            Err(e) => {
                tracing::error!(line = index + 1, error = %e, "Problems with bridge specification, skipped");
            }
        }
    }
    bridges
}

pub fn load_bridges(path: &Path) -> Result<IndexMap<String, BridgeSpec>, BridgeConfigError> {
    let text = std::fs::read_to_string(path)?;
    let bridges = parse_bridges(&text);
    tracing::info!(path = %path.display(), count = bridges.len(), "Bridge file loaded");
    Ok(bridges)
}
