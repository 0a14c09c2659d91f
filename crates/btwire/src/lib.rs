//! btwire: async access to a Bluetooth worker process over line-delimited JSON.
//!
//! One worker process is shared by every caller. Its stdout and stderr are
//! demultiplexed by fan-out routers into per-operation and per-socket routes;
//! commands from all of them are merged into stdin by a fan-in router.

pub mod bridge;
pub mod config;
pub mod framer;
pub mod model;
pub mod relay;
pub mod router;
pub mod scope;
pub mod session;
pub mod supervisor;
pub mod wire;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use bridge::protocol::{Command, Reply, SessionId, WorkerState};
pub use config::WorkerConfig;
pub use model::{
    BluetoothDevice, BluetoothService, LookupResult, ServiceProfile, ServiceProtocol, ServiceQuery,
    SocketAddress, SocketProtocol,
};
pub use relay::{Bridge, BridgeSpec, BridgeState, RelayError};
pub use router::{Delivery, FanInRouter, FanOutRouter, RouterError, RouterState};
pub use scope::Scope;
pub use session::{BluetoothSocket, SessionError, SocketReceiver, SocketSender};
pub use supervisor::{SupervisorError, WorkerSupervisor};
pub use wire::{WireError, WireReader, WireWriter};
pub use worker::{PythonSpawner, WorkerArtifact, WorkerSpawner};
