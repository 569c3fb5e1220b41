//! Host-side endpoints of a worker's standard streams.
//!
//! Each stream is a bounded in-memory pipe. The worker end is bound to the
//! WASI context, the host end is wrapped in one of the types below. Input is
//! write-only, output and error are read-only.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Buffer size of each pipe. A full pipe applies backpressure to the writer.
pub const PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) fn pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(PIPE_CAPACITY)
}

/// Label used for trace-level logging of stream traffic.
#[derive(Debug, Clone)]
pub(crate) struct TraceTag(Arc<str>);

impl TraceTag {
    pub(crate) fn new(worker: &str, stream: &str) -> Self {
        Self(format!("{worker}/{stream}").into())
    }

    fn record(&self, bytes: &[u8]) {
        tracing::trace!(
            target: "sandbridge::stream",
            stream = %self.0,
            len = bytes.len(),
            data = %String::from_utf8_lossy(bytes),
            "stream chunk"
        );
    }
}

/// Write end of the worker's standard input.
pub struct WorkerInput {
    inner: DuplexStream,
    trace: Option<TraceTag>,
}

impl WorkerInput {
    pub(crate) fn new(inner: DuplexStream, trace: Option<TraceTag>) -> Self {
        Self { inner, trace }
    }
}

impl AsyncWrite for WorkerInput {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let (Poll::Ready(Ok(n)), Some(tag)) = (&poll, &self.trace) {
            tag.record(&buf[..*n]);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read end of one of the worker's output streams.
pub struct WorkerOutput {
    inner: DuplexStream,
    trace: Option<TraceTag>,
}

impl WorkerOutput {
    pub(crate) fn new(inner: DuplexStream, trace: Option<TraceTag>) -> Self {
        Self { inner, trace }
    }
}

impl AsyncRead for WorkerOutput {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let (Poll::Ready(Ok(())), Some(tag)) = (&poll, &self.trace) {
            let chunk = &buf.filled()[before..];
            if !chunk.is_empty() {
                tag.record(chunk);
            }
        }
        poll
    }
}

/// Read end of the worker's standard error.
pub type WorkerErrorStream = WorkerOutput;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn input_delivers_bytes_in_order() {
        let (host, mut worker) = pipe();
        let mut input = WorkerInput::new(host, Some(TraceTag::new("w", "stdin")));

        input.write_all(b"first ").await.unwrap();
        input.write_all(b"second").await.unwrap();
        input.shutdown().await.unwrap();

        let mut received = String::new();
        worker.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "first second");
    }

    #[tokio::test]
    async fn output_reports_eof_when_worker_end_drops() {
        let (host, mut worker) = pipe();
        let mut output = WorkerOutput::new(host, None);

        worker.write_all(b"bye").await.unwrap();
        drop(worker);

        let mut received = Vec::new();
        output.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }
}
