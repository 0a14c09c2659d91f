use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use super::WireError;
use crate::bridge::protocol::{ErrorReport, Reply, SessionId, WorkerState, key};
use crate::model::{BluetoothDevice, BluetoothService, LookupResult, SocketAddress};

/// Reads typed results from one reply route, watching one error route.
///
/// Every read first surfaces any error report already queued, then waits
/// for whichever comes first: a reply carrying the requested key, or a new
/// error report. Replies that lack the key are discarded.
pub struct WireReader {
    name: String,
    replies: mpsc::Receiver<Reply>,
    errors: mpsc::Receiver<Reply>,
    errors_open: bool,
}

impl WireReader {
    pub fn new(
        name: impl Into<String>,
        replies: mpsc::Receiver<Reply>,
        errors: mpsc::Receiver<Reply>,
    ) -> Self {
        Self {
            name: name.into(),
            replies,
            errors,
            errors_open: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail with the first queued error report, if any.
    pub fn check_errors(&mut self) -> Result<(), WireError> {
        match self.errors.try_recv() {
            Ok(report) => Err(report_to_error(&report)),
            Err(_) => Ok(()),
        }
    }

    /// Drain every queued error report.
    pub fn check_all_errors(&mut self) -> Vec<WireError> {
        let mut found = Vec::new();
        while let Ok(report) = self.errors.try_recv() {
            found.push(report_to_error(&report));
        }
        found
    }

    /// Discard every reply already queued. Returns how many were dropped.
    pub fn skip_remaining(&mut self) -> usize {
        let mut skipped = 0;
        while self.replies.try_recv().is_ok() {
            skipped += 1;
        }
        if skipped > 0 {
            tracing::trace!(reader = %self.name, skipped, "Skipped stale replies");
        }
        skipped
    }

    /// Wait for a reply carrying any of `keys` and map it.
    ///
    /// The mapper receives the reply and the key that matched.
    pub async fn read_while_has_any_key<T>(
        &mut self,
        keys: &[&str],
        map: impl FnOnce(&Reply, &str) -> Result<T, WireError>,
    ) -> Result<T, WireError> {
        self.check_errors()?;
        loop {
            tokio::select! {
                reply = self.replies.recv() => match reply {
                    Some(reply) => {
                        if let Some(found) = keys.iter().find(|k| reply.has(k)) {
                            return map(&reply, *found);
                        }
                        tracing::trace!(reader = %self.name, %reply, "Discarding reply without expected key");
                    }
                    None => {
                        self.check_errors()?;
                        return Err(WireError::Closed(self.name.clone()));
                    }
                },
                report = self.errors.recv(), if self.errors_open => match report {
                    Some(report) => return Err(report_to_error(&report)),
                    None => self.errors_open = false,
                },
            }
        }
    }

    pub async fn read_while_has_key<T>(
        &mut self,
        key: &str,
        map: impl FnOnce(&Reply) -> Result<T, WireError>,
    ) -> Result<T, WireError> {
        self.read_while_has_any_key(&[key], |reply, _| map(reply))
            .await
    }

    /// Wait for a reply carrying `key` and ignore its value.
    pub async fn read_ack(&mut self, key: &str) -> Result<(), WireError> {
        self.read_while_has_key(key, |_| Ok(())).await
    }

    pub async fn read_state(&mut self) -> Result<WorkerState, WireError> {
        self.read_while_has_key(key::STATE, |reply| {
            let tag = required_str(reply, key::STATE)?;
            WorkerState::parse(tag)
                .ok_or_else(|| WireError::malformed(key::STATE, format!("unknown state {tag:?}")))
        })
        .await
    }

    /// Read the next state and require it to be `expected`.
    pub async fn ensure_state(&mut self, expected: WorkerState) -> Result<(), WireError> {
        let actual = self.read_state().await?;
        if actual == expected {
            Ok(())
        } else {
            Err(WireError::UnexpectedState { expected, actual })
        }
    }

    /// Like [`ensure_state`](Self::ensure_state), but skips `IDLE` reports
    /// left over from earlier commands.
    pub async fn ensure_busy_state(&mut self, expected: WorkerState) -> Result<(), WireError> {
        loop {
            let actual = self.read_state().await?;
            if actual == expected {
                return Ok(());
            }
            if actual == WorkerState::Idle {
                tracing::trace!(reader = %self.name, %expected, "Skipping stale IDLE");
                continue;
            }
            return Err(WireError::UnexpectedState { expected, actual });
        }
    }

    pub async fn read_scan_result(&mut self) -> Result<Vec<BluetoothDevice>, WireError> {
        self.read_while_has_key(key::SCAN_RES, |reply| decode_field(reply, key::SCAN_RES))
            .await
    }

    pub async fn read_lookup_result(&mut self) -> Result<LookupResult, WireError> {
        self.read_while_has_key(key::LOOKUP_RES, |reply| {
            match reply.get(key::LOOKUP_RES) {
                Some(Value::String(name)) => Ok(LookupResult::Found { name: name.clone() }),
                Some(Value::Null) | None => {
                    let err_name = reply.str(key::LOOKUP_ERR_NAME);
                    let err_args = reply.get(key::LOOKUP_ERR_ARGS).map(render_args);
                    let reason = match (err_name, err_args) {
                        (Some(name), Some(args)) if !args.is_empty() => Some(format!("{name}: {args}")),
                        (Some(name), _) => Some(name.to_string()),
                        (None, args) => args.filter(|a| !a.is_empty()),
                    };
                    Ok(LookupResult::NotFound { reason })
                }
                Some(other) => Err(WireError::malformed(
                    key::LOOKUP_RES,
                    format!("expected string or null, got {other}"),
                )),
            }
        })
        .await
    }

    pub async fn read_find_services_result(&mut self) -> Result<Vec<BluetoothService>, WireError> {
        self.read_while_has_key(key::FIND_SERVICES_RES, |reply| {
            decode_field(reply, key::FIND_SERVICES_RES)
        })
        .await
    }

    pub async fn read_new_socket_uuid(&mut self) -> Result<SessionId, WireError> {
        self.read_while_has_key(key::NEW_SOCKET_UUID, |reply| {
            required_str(reply, key::NEW_SOCKET_UUID).map(SessionId::new)
        })
        .await
    }

    pub async fn read_available_port(&mut self) -> Result<u16, WireError> {
        self.read_while_has_key(key::AVAILABLE_PORT, |reply| {
            required_port(reply, key::AVAILABLE_PORT)
        })
        .await
    }

    /// Names of the worker's live socket actors.
    pub async fn read_active_actors(&mut self) -> Result<Vec<String>, WireError> {
        self.read_while_has_key(key::ACTIVE_ACTORS_RES, |reply| {
            match reply.get(key::ACTIVE_ACTORS_RES) {
                Some(Value::Array(items)) => Ok(items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect()),
                Some(Value::Object(map)) => Ok(map.keys().cloned().collect()),
                Some(Value::Null) | None => Ok(Vec::new()),
                Some(other) => Err(WireError::malformed(
                    key::ACTIVE_ACTORS_RES,
                    format!("expected list, got {other}"),
                )),
            }
        })
        .await
    }

    /// New session id and the peer it is connected to.
    pub async fn read_accept_result(&mut self) -> Result<(SessionId, SocketAddress), WireError> {
        self.read_while_has_key(key::ACCEPT_RES, |reply| {
            let session = SessionId::new(required_str(reply, key::ACCEPT_RES)?);
            let peer = match reply.get(key::ACCEPT_RES_ADDRESS) {
                // Workers may send the (address, port) tuple as a JSON array.
                Some(Value::Array(parts)) => {
                    let address = parts.first().and_then(Value::as_str).ok_or_else(|| {
                        WireError::malformed(key::ACCEPT_RES_ADDRESS, "missing address")
                    })?;
                    let port = parts
                        .get(1)
                        .and_then(Value::as_u64)
                        .and_then(|p| u16::try_from(p).ok())
                        .ok_or_else(|| WireError::malformed(key::ACCEPT_RES_ADDRESS, "missing port"))?;
                    SocketAddress {
                        address: address.to_string(),
                        port,
                    }
                }
                Some(Value::String(address)) => SocketAddress {
                    address: address.clone(),
                    port: required_port(reply, key::ACCEPT_RES_PORT)?,
                },
                _ => {
                    return Err(WireError::malformed(
                        key::ACCEPT_RES_ADDRESS,
                        "missing peer address",
                    ));
                }
            };
            Ok((session, peer))
        })
        .await
    }

    pub async fn read_local_address(&mut self) -> Result<SocketAddress, WireError> {
        self.read_while_has_key(key::SOCK_LOCAL_ADDRESS, |reply| {
            Ok(SocketAddress {
                address: required_str(reply, key::SOCK_LOCAL_ADDRESS)?.to_string(),
                port: required_port(reply, key::SOCK_LOCAL_PORT)?,
            })
        })
        .await
    }

    pub async fn read_remote_address(&mut self) -> Result<SocketAddress, WireError> {
        self.read_while_has_key(key::SOCK_REMOTE_ADDRESS, |reply| {
            Ok(SocketAddress {
                address: required_str(reply, key::SOCK_REMOTE_ADDRESS)?.to_string(),
                port: required_port(reply, key::SOCK_REMOTE_PORT)?,
            })
        })
        .await
    }

    /// Payload of a receive reply, truncated to the reported size.
    ///
    /// The worker counts `size` in characters, so the cut lands on a
    /// character boundary.
    pub async fn read_received(&mut self) -> Result<Vec<u8>, WireError> {
        self.read_while_has_any_key(&[key::RECEIVE_RES, key::RECEIVED_DATA], |reply, found| {
            let mut text = match reply.get(found) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) => String::new(),
                _ => return Err(WireError::malformed(found, "payload is not a string")),
            };
            if let Some(size) = reply.int(key::SIZE)
                && let Ok(size) = usize::try_from(size)
                && let Some((cut, _)) = text.char_indices().nth(size)
            {
                text.truncate(cut);
            }
            Ok(text.into_bytes())
        })
        .await
    }

    /// Give up the reply route, keeping the error route.
    pub(crate) fn into_errors(mut self) -> mpsc::Receiver<Reply> {
        self.replies.close();
        self.errors
    }

    /// Stop accepting messages on both routes. The routers drop them on their next delivery.
    pub fn close(&mut self) {
        self.replies.close();
        self.errors.close();
    }
}

fn report_to_error(reply: &Reply) -> WireError {
    match ErrorReport::from_reply(reply) {
        Some(report) if report.is_native_io() => WireError::WorkerIo(report.to_string()),
        Some(report) => WireError::Protocol(report.to_string()),
        None => WireError::Protocol(format!("unrecognised error report: {reply}")),
    }
}

fn required_str<'a>(reply: &'a Reply, key: &str) -> Result<&'a str, WireError> {
    reply
        .str(key)
        .ok_or_else(|| WireError::malformed(key, "expected a string"))
}

fn required_port(reply: &Reply, key: &str) -> Result<u16, WireError> {
    let raw = reply
        .int(key)
        .ok_or_else(|| WireError::malformed(key, "expected an integer"))?;
    u16::try_from(raw).map_err(|_| WireError::malformed(key, format!("{raw} is not a valid port")))
}

fn decode_field<T: DeserializeOwned>(reply: &Reply, key: &str) -> Result<T, WireError> {
    let value = reply.get(key).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| WireError::malformed(key, e.to_string()))
}

fn render_args(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}
