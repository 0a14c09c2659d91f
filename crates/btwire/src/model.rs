//! Typed results decoded from worker replies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Socket transport supported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SocketProtocol {
    Rfcomm,
    L2cap,
}

impl SocketProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rfcomm => "RFCOMM",
            Self::L2cap => "L2CAP",
        }
    }
}

impl fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RFCOMM" => Ok(Self::Rfcomm),
            "L2CAP" => Ok(Self::L2cap),
            other => Err(format!("unsupported socket protocol: {other}")),
        }
    }
}

/// Device found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "classCode", default)]
    pub class_code: u32,
}

/// Protocol of an advertised service. Services may use transports the worker
/// cannot open sockets for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceProtocol {
    Rfcomm,
    L2cap,
    #[serde(other)]
    Unknown,
}

/// `(profile uuid, version)` pair from a service record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, u32)", into = "(String, u32)")]
pub struct ServiceProfile {
    pub uuid: String,
    pub version: u32,
}

impl From<(String, u32)> for ServiceProfile {
    fn from((uuid, version): (String, u32)) -> Self {
        Self { uuid, version }
    }
}

impl From<ServiceProfile> for (String, u32) {
    fn from(p: ServiceProfile) -> Self {
        (p.uuid, p.version)
    }
}

/// Service record returned by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothService {
    pub host: String,
    pub protocol: ServiceProtocol,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(rename = "service-id", default)]
    pub service_id: Option<String>,
    #[serde(rename = "service-classes", default)]
    pub service_classes: Vec<String>,
    #[serde(default)]
    pub profiles: Vec<ServiceProfile>,
}

/// Filter for service discovery. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceQuery {
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub address: Option<String>,
}

impl ServiceQuery {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Outcome of a remote name lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupResult {
    Found { name: String },
    /// The worker reported no name; `reason` carries its error name and arguments.
    NotFound { reason: Option<String> },
}

/// Address and channel/PSM of a socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddress {
    pub address: String,
    pub port: u16,
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.port)
    }
}
