//! Sandboxed language servers for editor hosts.
//!
//! Sandbridge runs a language server compiled to WebAssembly (WASI preview 1)
//! inside an isolated worker, limits what it can see of the host, and bridges
//! its standard streams to a protocol client and a log channel. To the client
//! the worker looks like any other server it could spawn or dial.
//!
//! # Quick Start
//!
//! Everything starts with a [`Bridge`]:
//!
//! ```rust,no_run
//! use sandbridge::{ActivationOptions, Bridge, FileStorage, TracingChannel};
//! use std::sync::Arc;
//!
//! # async fn example() -> sandbridge::Result<()> {
//! let bridge = Bridge::new(
//!     Arc::new(FileStorage::new()),
//!     Arc::new(TracingChannel::new("protolsp")),
//! );
//!
//! let config = bridge
//!     .activate(ActivationOptions::new("./protolsp.wasm", "/home/me/project"))
//!     .await?;
//!
//! let transport = config.server.connect().await?;
//! # drop(transport);
//! # Ok(())
//! # }
//! ```
//!
//! # Pieces
//!
//! The steps [`Bridge::activate`] runs are available on their own:
//! [`SandboxLoader`] compiles modules, [`WorkerLauncher`] starts them under a
//! [`CapabilityScope`], [`StderrForwarder`] drains the error stream and
//! [`TransportFactory`] hands the protocol streams to a client.
//! [`session::relay`] is a minimal client that frames messages and rewrites
//! file URIs with a [`PathTranslator`].

mod activation;
pub mod codec;
mod handle;
mod launcher;
mod loader;
mod multiplexer;
mod runtime;
pub mod session;
mod stream;
mod transport;

// ============================================================================
// Core API
// ============================================================================

pub use activation::{
    ActivationOptions, Bridge, DEFAULT_ENV, DEFAULT_PROCESS_NAME, ServerConfiguration,
};
pub use handle::{TERMINATE_TIMEOUT, WorkerHandle, WorkerStatus};
pub use transport::{BoxedReader, BoxedWriter, ServerOptions, Transport, TransportFactory};

// Loading and launching
pub use launcher::{LaunchOptions, WorkerLauncher};
pub use loader::{CompiledModule, FileStorage, ModuleStorage, SandboxLoader};
pub use runtime::{EPOCH_TICK, SandboxRuntime};

// Streams
pub use multiplexer::{
    MAX_LINE_BYTES, QUEUE_CAPACITY, STDERR_PREFIX, StderrForwarder, StderrLineCodec,
};
pub use stream::{PIPE_CAPACITY, WorkerErrorStream, WorkerInput, WorkerOutput};

// Re-exported from sandbridge-core
pub use sandbridge_core::{
    CapabilityScope, CapabilityScopeBuilder, ClientOptions, DEFAULT_MEMORY_PAGES, Direction,
    DocumentFilter, Error, MAX_WASM32_PAGES, MemoryBudget, MemoryChannel, Mount, MountMode,
    OutputChannel, PathTranslator, Result, ScopePolicy, Stage, TracingChannel, WASM_PAGE_SIZE,
    WORKSPACE_MOUNT,
};
