//! Transports a protocol client can connect to a language server through.
//!
//! [`ServerOptions`] covers the three ways a server can be reached: a native
//! subprocess speaking over stdio, a TCP socket, or a sandboxed worker. Each
//! one yields the same [`Transport`], so the client does not care which it
//! got.

use crate::handle::WorkerHandle;
use sandbridge_core::{Error, Result};
use std::net::SocketAddr;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to reach a language server.
pub enum ServerOptions {
    /// Spawn a native executable and talk over its stdin/stdout.
    Executable { command: String, args: Vec<String> },
    /// Connect to a server listening on a TCP socket.
    Socket(SocketAddr),
    /// Use the streams of a sandboxed worker.
    Worker(TransportFactory),
}

impl ServerOptions {
    /// Opens a transport to the server.
    pub async fn connect(&self) -> Result<Transport> {
        match self {
            ServerOptions::Executable { command, args } => spawn_executable(command, args),
            ServerOptions::Socket(addr) => {
                let stream = TcpStream::connect(addr).await?;
                tracing::debug!(%addr, "connected to language server socket");
                let (reader, writer) = stream.into_split();
                Ok(Transport::new(
                    Box::new(reader),
                    Box::new(writer),
                    Peer::Socket,
                ))
            }
            ServerOptions::Worker(factory) => factory.create(),
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerOptions::Executable { command, args } => f
                .debug_struct("Executable")
                .field("command", command)
                .field("args", args)
                .finish(),
            ServerOptions::Socket(addr) => f.debug_tuple("Socket").field(addr).finish(),
            ServerOptions::Worker(factory) => f.debug_tuple("Worker").field(factory).finish(),
        }
    }
}

fn spawn_executable(command: &str, args: &[String]) -> Result<Transport> {
    let path = which::which(command)
        .map_err(|e| Error::Launch(format!("cannot find '{command}': {e}")))?;

    let mut child = Command::new(&path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Launch(format!("failed to spawn {}: {e}", path.display())))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Launch("child stdin is not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Launch("child stdout is not piped".to_string()))?;

    tracing::debug!(command = %path.display(), pid = ?child.id(), "spawned language server");
    Ok(Transport::new(
        Box::new(stdout),
        Box::new(stdin),
        Peer::Process(child),
    ))
}

enum FactoryState {
    Ready(WorkerHandle),
    Consumed,
}

/// Single-use source of a [`Transport`] over a worker's streams.
///
/// The first [`create`](Self::create) moves the worker into the transport;
/// later calls fail with [`Error::TransportConsumed`].
pub struct TransportFactory {
    state: Mutex<FactoryState>,
}

impl TransportFactory {
    pub fn new(handle: WorkerHandle) -> Self {
        Self {
            state: Mutex::new(FactoryState::Ready(handle)),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.state
            .lock()
            .map(|state| matches!(*state, FactoryState::Consumed))
            .unwrap_or(true)
    }

    pub fn create(&self) -> Result<Transport> {
        let previous = {
            let mut state = self.state.lock().map_err(|_| Error::TransportConsumed)?;
            std::mem::replace(&mut *state, FactoryState::Consumed)
        };
        let FactoryState::Ready(mut handle) = previous else {
            return Err(Error::TransportConsumed);
        };

        if !handle.is_running() {
            return Err(Error::NotRunning);
        }
        let input = handle.take_stdin().ok_or(Error::NotRunning)?;
        let output = handle.take_stdout().ok_or(Error::NotRunning)?;

        tracing::debug!(worker = handle.name(), id = %handle.id(), "worker transport created");
        Ok(Transport::new(
            Box::new(output),
            Box::new(input),
            Peer::Worker(handle),
        ))
    }
}

impl std::fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportFactory")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

pub(crate) enum Peer {
    Worker(WorkerHandle),
    Process(Child),
    Socket,
}

/// Byte stream pair connected to a language server.
///
/// Reads yield the server's output; writes go to its input. Owns whatever is
/// on the other end, so dropping the transport also stops a worker or child
/// process.
pub struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    peer: Peer,
}

impl Transport {
    pub(crate) fn new(reader: BoxedReader, writer: BoxedWriter, peer: Peer) -> Self {
        Self {
            reader,
            writer,
            peer,
        }
    }

    /// Borrows the read and write halves at the same time.
    pub fn split_mut(&mut self) -> (&mut BoxedReader, &mut BoxedWriter) {
        (&mut self.reader, &mut self.writer)
    }

    /// The worker behind this transport, if it is a sandboxed one.
    pub fn worker(&self) -> Option<&WorkerHandle> {
        match &self.peer {
            Peer::Worker(handle) => Some(handle),
            _ => None,
        }
    }

    /// Closes the input side and stops the server.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.writer.shutdown().await;
        match self.peer {
            Peer::Worker(handle) => handle.terminate().await,
            Peer::Process(mut child) => {
                if child.try_wait()?.is_none() {
                    child.kill().await?;
                }
                Ok(())
            }
            Peer::Socket => Ok(()),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
