//! Typed reading and writing over routed worker channels.
//!
//! A [`WireReader`] owns one reply route and one error route; a
//! [`WireWriter`] owns one command route. Top-level operations and every
//! socket session each get their own pair.

mod reader;
mod writer;

pub use reader::WireReader;
pub use writer::{DEFAULT_RECEIVE_SIZE, WireWriter};

use thiserror::Error;

use crate::bridge::protocol::WorkerState;

#[derive(Debug, Error)]
pub enum WireError {
    /// The route behind this reader or writer is gone.
    #[error("channel closed: {0}")]
    Closed(String),

    /// The worker reported an error that did not come from the Bluetooth stack.
    #[error("worker error: {0}")]
    Protocol(String),

    /// The worker reported a Bluetooth stack error.
    #[error("bluetooth i/o error: {0}")]
    WorkerIo(String),

    #[error("unexpected worker state: expected {expected}, got {actual}")]
    UnexpectedState {
        expected: WorkerState,
        actual: WorkerState,
    },

    /// A reply carried the expected key but could not be decoded.
    #[error("malformed reply for {key}: {detail}")]
    MalformedReply { key: String, detail: String },
}

impl WireError {
    pub(crate) fn malformed(key: &str, detail: impl Into<String>) -> Self {
        Self::MalformedReply {
            key: key.to_string(),
            detail: detail.into(),
        }
    }

    /// True when the error means the worker side of this channel is unusable.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}
