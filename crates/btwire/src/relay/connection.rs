//! One relayed connection: an accepted Bluetooth session paired with a TCP stream.
//!
//! Three tasks move bytes:
//! - bluetooth reader: `receive` on the session's receive half, into a channel
//! - net pump: owns the TCP stream, writes what the reader produced and reads
//!   what goes back; reconnects when the stream breaks
//! - bluetooth writer: `send` on the session's send half, from a channel
//!
//! The connection ends when either Bluetooth half fails, when reconnection
//! gives up, or when its token is cancelled.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::relay::config::ReconnectPolicy;
use crate::scope::Scope;
use crate::session::{BluetoothSocket, SocketReceiver, SocketSender};
use crate::wire::DEFAULT_RECEIVE_SIZE;

const RELAY_BUFFER: usize = 16;
const NET_READ_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Starting,
    Disconnected,
    Connected,
    Reconnecting,
    Terminated,
}

/// Snapshot of a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: String,
    pub state: BridgeState,
}

pub(crate) struct BridgeConnection {
    id: Uuid,
    peer: String,
    host: String,
    port: u16,
    policy: ReconnectPolicy,
    state: watch::Sender<BridgeState>,
}

impl BridgeConnection {
    pub fn new(peer: impl Into<String>, host: impl Into<String>, port: u16, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(BridgeState::Starting);
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            host: host.into(),
            port,
            policy,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(connection = %self.id, peer = %self.peer, ?state, "Bridge state changed");
        }
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }

    /// Relay until one side is done, then close the session.
    pub async fn run(self, mut session: BluetoothSocket, cancel: CancellationToken, scope: &Scope) {
        let stream = tokio::select! {
            _ = cancel.cancelled() => None,
            connected = self.connect() => match connected {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(connection = %self.id, host = %self.host, port = self.port, error = %e, "Net connection failed");
                    None
                }
            },
        };
        let Some(stream) = stream else {
            self.set_state(BridgeState::Disconnected);
            let _ = session.close().await;
            return;
        };
        tracing::info!(connection = %self.id, peer = %self.peer, host = %self.host, port = self.port, "Created net connection");

        let (receiver, sender) = match session.split().await {
            Ok(halves) => halves,
            Err(e) => {
                tracing::warn!(connection = %self.id, error = %e, "Failed to split session");
                self.set_state(BridgeState::Disconnected);
                return;
            }
        };
        self.set_state(BridgeState::Connected);

        let (to_net, from_bluetooth) = mpsc::channel(RELAY_BUFFER);
        let (to_bluetooth, from_net) = mpsc::channel(RELAY_BUFFER);
        let halt = cancel.child_token();
        let reader = scope.spawn(bluetooth_to_channel(receiver, to_net, halt.clone(), self.id));
        let writer = scope.spawn(channel_to_bluetooth(sender, from_net, self.id));

        self.pump(stream, from_bluetooth, to_bluetooth, &cancel).await;

        halt.cancel();
        if let Ok(mut sender) = writer.await
            && let Err(e) = sender.close().await
        {
            tracing::debug!(connection = %self.id, error = %e, "Session close failed");
        }
        if let Ok(receiver) = reader.await {
            receiver.close().await;
        }

        if *self.state.borrow() != BridgeState::Disconnected {
            self.set_state(BridgeState::Terminated);
        }
        tracing::info!(connection = %self.id, peer = %self.peer, "Bridge connection closed");
    }

    /// Move bytes between the TCP stream and the two session channels.
    async fn pump(
        &self,
        mut stream: TcpStream,
        mut from_bluetooth: mpsc::Receiver<Vec<u8>>,
        to_bluetooth: mpsc::Sender<Vec<u8>>,
        cancel: &CancellationToken,
    ) {
        let mut buf = vec![0u8; NET_READ_SIZE];
        let mut carry = Utf8Carry::default();
        loop {
            let broken = tokio::select! {
                _ = cancel.cancelled() => return,
                data = from_bluetooth.recv() => match data {
                    None => return,
                    Some(data) => {
                        tracing::trace!(connection = %self.id, bytes = data.len(), "Bluetooth to net");
                        stream.write_all(&data).await.err()
                    }
                },
                read = stream.read(&mut buf) => match read {
                    Ok(0) => Some(io::Error::from(io::ErrorKind::UnexpectedEof)),
                    Ok(n) => {
                        tracing::trace!(connection = %self.id, bytes = n, "Net to bluetooth");
                        let chunk = carry.push(&buf[..n]);
                        if !chunk.is_empty() && to_bluetooth.send(chunk).await.is_err() {
                            return;
                        }
                        None
                    }
                    Err(e) => Some(e),
                },
            };

            if let Some(e) = broken {
                let dropped = carry.reset();
                if dropped > 0 {
                    tracing::debug!(connection = %self.id, bytes = dropped, "Dropping partial character");
                }
                tracing::info!(connection = %self.id, error = %e, "Net connection lost, reconnecting");
                match self.reconnect(cancel).await {
                    Some(fresh) => stream = fresh,
                    None => return,
                }
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Option<TcpStream> {
        self.set_state(BridgeState::Reconnecting);
        for attempt in 1..=self.policy.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                connected = self.connect() => match connected {
                    Ok(stream) => {
                        tracing::info!(connection = %self.id, attempt, "Reconnected");
                        self.set_state(BridgeState::Connected);
                        return Some(stream);
                    }
                    Err(e) => tracing::debug!(connection = %self.id, attempt, error = %e, "Reconnect attempt failed"),
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }
        tracing::warn!(connection = %self.id, attempts = self.policy.attempts, "Giving up on net connection");
        self.set_state(BridgeState::Disconnected);
        None
    }
}

/// Holds back a trailing partial UTF-8 character until the rest arrives.
///
/// Payloads cross to the worker as text, so a character split across two
/// reads would otherwise turn into two replacement characters.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Append `chunk` and return everything up to the last complete character.
    fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail(&self.pending);
        let rest = self.pending.split_off(self.pending.len() - keep);
        std::mem::replace(&mut self.pending, rest)
    }

    /// Discard held bytes, returning how many there were.
    fn reset(&mut self) -> usize {
        let held = self.pending.len();
        self.pending.clear();
        held
    }
}

/// Length of an unfinished multi-byte sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

async fn bluetooth_to_channel(
    mut receiver: SocketReceiver,
    out: mpsc::Sender<Vec<u8>>,
    halt: CancellationToken,
    id: Uuid,
) -> SocketReceiver {
    loop {
        let received = tokio::select! {
            _ = halt.cancelled() => break,
            received = receiver.receive(DEFAULT_RECEIVE_SIZE) => received,
        };
        match received {
            Ok(data) if data.is_empty() => {
                tracing::info!(connection = %id, "Bluetooth peer closed");
                break;
            }
            Ok(data) => {
                if out.send(data).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::info!(connection = %id, error = %e, "Bluetooth receive ended");
                break;
            }
        }
    }
    receiver
}

async fn channel_to_bluetooth(
    mut sender: SocketSender,
    mut input: mpsc::Receiver<Vec<u8>>,
    id: Uuid,
) -> SocketSender {
    while let Some(data) = input.recv().await {
        if let Err(e) = sender.send(&data).await {
            tracing::info!(connection = %id, error = %e, "Bluetooth send ended");
            break;
        }
    }
    sender
}
