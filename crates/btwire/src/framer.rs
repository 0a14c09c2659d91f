//! Line framing over byte streams.
//!
//! [`LineFramer`] turns an `AsyncRead` into a sequence of lines delivered
//! through a single-slot channel, so the next line is only read once the
//! previous one has been taken. [`LineWriter`] does the reverse for the
//! worker's stdin.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodecError};

use crate::bridge::codec::line_codec;
use crate::scope::Scope;

/// Lines read from one byte stream.
pub struct LineFramer {
    lines: mpsc::Receiver<String>,
    done: FramerDone,
}

/// Completion signal for a framer or writer task.
#[derive(Debug, Clone)]
pub struct FramerDone(watch::Receiver<bool>);

impl FramerDone {
    pub fn is_done(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the underlying task has exited.
    pub async fn wait(&mut self) {
        // Err means the task dropped its sender, which also means it is gone.
        let _ = self.0.wait_for(|done| *done).await;
    }
}

impl LineFramer {
    /// Start reading `reader` in a task owned by `scope`.
    pub fn spawn<R>(name: impl Into<String>, reader: R, scope: &Scope) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = scope.token();

        scope.spawn(async move {
            let mut framed = FramedRead::new(reader, line_codec());
            let mut count: u64 = 0;
            // FramedRead yields one None after any decode error before it resumes.
            let mut resuming = false;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::trace!(framer = %name, "Framer cancelled");
                        break;
                    }
                    next = framed.next() => next,
                };
                match next {
                    Some(Ok(line)) => {
                        resuming = false;
                        count += 1;
                        if tx.send(line).await.is_err() {
                            tracing::debug!(framer = %name, "Line consumer gone");
                            break;
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        tracing::warn!(framer = %name, "Discarding oversized line");
                        resuming = true;
                    }
                    Some(Err(LinesCodecError::Io(e)))
                        if e.kind() == std::io::ErrorKind::InvalidData =>
                    {
                        tracing::warn!(framer = %name, error = %e, "Discarding non-UTF-8 line");
                        resuming = true;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        tracing::warn!(framer = %name, error = %e, "Stream read failed");
                        break;
                    }
                    None if resuming => {
                        resuming = false;
                    }
                    None => {
                        tracing::debug!(framer = %name, lines = count, "Stream reached EOF");
                        break;
                    }
                }
            }
            let _ = done_tx.send(true);
        });

        Self {
            lines: rx,
            done: FramerDone(done_rx),
        }
    }

    /// Next line, or `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub fn done(&self) -> FramerDone {
        self.done.clone()
    }

    pub fn into_parts(self) -> (mpsc::Receiver<String>, FramerDone) {
        (self.lines, self.done)
    }
}

/// Writes lines to a byte stream, one per message.
pub struct LineWriter;

impl LineWriter {
    /// Start a writer task. Dropping every returned sender flushes and shuts
    /// the stream down; a write failure closes the channel.
    pub fn spawn<W>(
        name: impl Into<String>,
        writer: W,
        capacity: usize,
        scope: &Scope,
    ) -> (mpsc::Sender<String>, FramerDone)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = scope.token();

        scope.spawn(async move {
            let mut framed = FramedWrite::new(writer, line_codec());
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = rx.recv() => line,
                };
                let Some(line) = line else {
                    tracing::debug!(writer = %name, "All line senders dropped");
                    break;
                };
                if let Err(e) = framed.send(line).await {
                    tracing::warn!(writer = %name, error = %e, "Stream write failed");
                    break;
                }
            }
            rx.close();
            if let Err(e) = SinkExt::<String>::close(&mut framed).await {
                tracing::trace!(writer = %name, error = %e, "Stream shutdown failed");
            }
            let _ = done_tx.send(true);
        });

        (tx, FramerDone(done_rx))
    }
}
