//! Bluetooth-to-network bridges.
//!
//! Bridges are defined in a JSON-lines file (see [`config`]); each one listens
//! on a Bluetooth socket and relays every accepted connection to a TCP endpoint.

mod bridge;
pub mod config;
mod connection;

pub use bridge::{Bridge, start_all};
pub use config::{BridgeConfigError, BridgeSpec, NetProtocol, ReconnectPolicy, ServiceAdvert};
pub use connection::{BridgeState, ConnectionInfo};

use crate::session::SessionError;
use crate::supervisor::SupervisorError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] BridgeConfigError),
}
