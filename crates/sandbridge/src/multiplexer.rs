//! Forwarding of the worker's error stream to a host log channel.
//!
//! The error stream is decoded into lines and each line is appended to an
//! [`OutputChannel`] with the [`STDERR_PREFIX`]. Reading and forwarding run on
//! separate tasks joined by a bounded queue, so a slow channel never stalls
//! the worker. When the queue is full the newest line is dropped and counted.
//!
//! The input and output streams are left on the handle for the transport.

use crate::handle::WorkerHandle;
use bytes::BytesMut;
use futures::StreamExt;
use sandbridge_core::{Error, OutputChannel, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};

/// Prefix of every forwarded error-stream line.
pub const STDERR_PREFIX: &str = "[wasi-stderr] ";

/// Longest line emitted before a forced break.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Lines buffered between the reader and the channel.
pub const QUEUE_CAPACITY: usize = 1024;

/// Splits a byte stream into lines, replacing invalid UTF-8.
///
/// `\n` and `\r\n` both end a line. A partial line is emitted at EOF.
#[derive(Debug, Default)]
pub struct StderrLineCodec {
    // Bytes already scanned for a newline in the current buffer.
    scanned: usize,
}

impl StderrLineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(line: BytesMut) -> String {
        let mut line = &line[..];
        if let Some(stripped) = line.strip_suffix(b"\n") {
            line = stripped;
        }
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        match std::str::from_utf8(line) {
            Ok(text) => text.to_string(),
            Err(e) => {
                let err = Error::StreamDecode(e.to_string());
                tracing::debug!(error = %err, "replacing invalid bytes on error stream");
                String::from_utf8_lossy(line).into_owned()
            }
        }
    }
}

impl Decoder for StderrLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        let limit = src.len().min(MAX_LINE_BYTES);
        if let Some(offset) = src[self.scanned..limit].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset + 1;
            self.scanned = 0;
            return Ok(Some(Self::emit(src.split_to(end))));
        }

        if src.len() >= MAX_LINE_BYTES {
            self.scanned = 0;
            let cut = char_boundary(&src[..], MAX_LINE_BYTES);
            return Ok(Some(Self::emit(src.split_to(cut))));
        }

        self.scanned = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                self.scanned = 0;
                let rest = src.split_to(src.len());
                Ok(Some(Self::emit(rest)))
            }
        }
    }
}

/// Moves `limit` back to the start of a UTF-8 sequence it would split.
fn char_boundary(bytes: &[u8], limit: usize) -> usize {
    for back in 1..=limit.min(3) {
        let start = limit - back;
        let lead = bytes[start];
        if lead & 0xC0 == 0x80 {
            continue;
        }
        let width = match lead {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if start + width > limit { start } else { limit };
    }
    limit
}

/// Running forwarder for one worker's error stream.
pub struct StderrForwarder {
    reader: JoinHandle<()>,
    drain: JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

impl StderrForwarder {
    /// Takes the error stream out of `handle` and starts forwarding it.
    pub fn attach(handle: &mut WorkerHandle, channel: Arc<dyn OutputChannel>) -> Result<Self> {
        let stderr = handle
            .take_stderr()
            .ok_or_else(|| Error::Launch("worker error stream already taken".to_string()))?;
        Ok(Self::spawn(stderr, channel))
    }

    /// Forwards any readable stream, line by line, to `channel`.
    pub fn spawn<R>(stream: R, channel: Arc<dyn OutputChannel>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));

        let reader = tokio::spawn(read_lines(stream, tx, dropped.clone()));
        let drain = tokio::spawn(drain_lines(rx, channel));

        Self {
            reader,
            drain,
            dropped,
        }
    }

    /// Number of lines discarded because the queue was full.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits until the stream hit EOF and every queued line was delivered.
    pub async fn finished(self) {
        let _ = self.reader.await;
        let _ = self.drain.await;
    }

    /// Like [`finished`](Self::finished), but aborts forwarding once `limit`
    /// has passed. Returns the number of dropped lines.
    pub async fn finish_within(mut self, limit: Duration) -> Result<u64> {
        let done = tokio::time::timeout(limit, async {
            let _ = (&mut self.reader).await;
            let _ = (&mut self.drain).await;
        })
        .await;

        if done.is_err() {
            self.abort();
            return Err(Error::Timeout(format!(
                "error stream still open after {limit:?}"
            )));
        }
        Ok(self.dropped_lines())
    }

    /// Stops forwarding immediately. Queued lines are discarded.
    pub fn abort(&self) {
        self.reader.abort();
        self.drain.abort();
    }
}

async fn read_lines<R>(stream: R, tx: mpsc::Sender<String>, dropped: Arc<AtomicU64>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stream, StderrLineCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(error = %e, "error stream closed");
                break;
            }
        };
        match tx.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!("log channel is behind, dropping worker error lines");
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    let total = dropped.load(Ordering::Relaxed);
    if total > 0 {
        tracing::warn!(dropped = total, "worker error lines were dropped");
    }
}

async fn drain_lines(mut rx: mpsc::Receiver<String>, channel: Arc<dyn OutputChannel>) {
    while let Some(line) = rx.recv().await {
        channel.append_line(&format!("{STDERR_PREFIX}{line}"));
    }
}
