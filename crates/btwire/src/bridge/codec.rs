//! Line-JSON encoding for worker communication.
//!
//! Framing is newline-delimited UTF-8 via [`LinesCodec`]; each line carries one
//! JSON object. Lines that are not JSON objects are worker debug output and are
//! dropped by [`decode_reply`] rather than treated as errors.

use serde_json::Value;
use tokio_util::codec::LinesCodec;

use super::protocol::{Command, Reply};

/// Longest line accepted from the worker. Scan and service discovery replies are
/// the largest messages and stay well below this.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Line codec used on every worker stream.
pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

/// Parse one line into a reply. Anything that is not a JSON object yields `None`.
pub fn decode_reply(line: &str) -> Option<Reply> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(Reply::from(map)),
        Ok(other) => {
            tracing::trace!(line = %trimmed, kind = value_kind(&other), "Dropping non-object line");
            None
        }
        Err(_) => {
            tracing::trace!(line = %trimmed, "Dropping non-JSON line");
            None
        }
    }
}

/// Render a command as a single line (no trailing newline).
pub fn encode_command(command: &Command) -> Result<String, serde_json::Error> {
    let line = serde_json::to_string(&command.to_json())?;
    tracing::trace!(cmd = command.name(), len = line.len(), "Encoding command");
    Ok(line)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
