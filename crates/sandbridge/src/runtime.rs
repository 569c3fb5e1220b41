//! The process-wide sandbox engine.
//!
//! Compiling and running modules both need a [`wasmtime::Engine`]. The engine
//! is configured once (async execution, shared memories, epoch interruption)
//! and reused for every module and worker. A ticker thread advances the
//! engine epoch so that running workers yield to the scheduler regularly and
//! can always be terminated, even on a single-threaded tokio runtime whose
//! only thread is busy running wasm.

use sandbridge_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use wasmtime::{Config, Engine};

/// How often the engine epoch advances.
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

struct Ticker {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Owns the engine and its epoch ticker.
///
/// Call [`shutdown`](Self::shutdown) (or drop it) once no worker uses it
/// anymore. Workers still running at that point are stopped at their next
/// epoch check.
pub struct SandboxRuntime {
    engine: Engine,
    stopped: Arc<AtomicBool>,
    ticker: Mutex<Option<Ticker>>,
}

impl SandboxRuntime {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config
            .async_support(true)
            .wasm_threads(true)
            .epoch_interruption(true);

        let engine = Engine::new(&config)
            .map_err(|e| Error::Launch(format!("failed to create sandbox engine: {e:#}")))?;

        let (stop, stop_rx) = mpsc::channel();
        let ticking = engine.clone();
        let thread = std::thread::Builder::new()
            .name("sandbridge-epoch".to_string())
            .spawn(move || tick_epochs(ticking, stop_rx))
            .map_err(|e| Error::Launch(format!("failed to start epoch ticker: {e}")))?;
        tracing::debug!("sandbox runtime started");

        Ok(Self {
            engine,
            stopped: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(Some(Ticker { stop, thread })),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Flag raised by [`shutdown`](Self::shutdown). Workers check it every
    /// epoch and trap once it is set.
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }

    /// Stops the epoch ticker and every worker still running. Idempotent.
    pub fn shutdown(&self) {
        let ticker = self.ticker.lock().ok().and_then(|mut t| t.take());
        let Some(ticker) = ticker else {
            return;
        };

        self.stopped.store(true, Ordering::Release);
        drop(ticker.stop);
        if ticker.thread.join().is_err() {
            tracing::warn!("epoch ticker panicked");
        }
        // Last tick: every worker reaches its deadline and sees the flag.
        self.engine.increment_epoch();
        tracing::debug!("sandbox runtime stopped");
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| !t.thread.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn tick_epochs(engine: Engine, stop: mpsc::Receiver<()>) {
    loop {
        match stop.recv_timeout(EPOCH_TICK) {
            Err(RecvTimeoutError::Timeout) => engine.increment_epoch(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
