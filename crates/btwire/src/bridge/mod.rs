//! Wire protocol between the host and the Bluetooth worker subprocess.
//!
//! - **protocol**: command names, reply keys, [`protocol::Reply`], [`protocol::WorkerState`]
//! - **codec**: line framing and JSON encode/decode

pub mod codec;
pub mod protocol;
