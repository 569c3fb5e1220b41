//! Launching compiled modules as isolated workers.
//!
//! A worker is one module instance with its own store, linear memory and WASI
//! context. Its standard streams are bound to in-memory pipes before the
//! module is instantiated, so nothing it prints during start-up is lost. Its
//! filesystem view and environment come from a [`CapabilityScope`] only.

use crate::handle::{StatusCell, WorkerHandle, WorkerStatus};
use crate::loader::CompiledModule;
use crate::runtime::SandboxRuntime;
use crate::stream::{PIPE_CAPACITY, TraceTag, WorkerInput, WorkerOutput, pipe};
use sandbridge_core::{CapabilityScope, Error, MemoryBudget, MountMode, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::DuplexStream;
use wasmtime::{
    Engine, Extern, ExternType, Linker, Memory, MemoryType, SharedMemory, Store, StoreLimits,
    StoreLimitsBuilder, TypedFunc, UpdateDeadline,
};
use wasmtime_wasi::pipe::{AsyncReadStream, AsyncWriteStream};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{
    AsyncStdinStream, AsyncStdoutStream, DirPerms, FilePerms, I32Exit, WasiCtxBuilder,
};

/// Export the worker starts executing at.
const ENTRY_POINT: &str = "_start";

/// Per-launch metadata that is not part of the capability scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// Log every chunk on the input and output streams at trace level.
    pub trace: bool,
}

struct WorkerState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// Instantiates compiled modules as workers on one runtime.
#[derive(Clone)]
pub struct WorkerLauncher {
    engine: Engine,
    stopped: Arc<AtomicBool>,
}

impl WorkerLauncher {
    pub fn new(runtime: &SandboxRuntime) -> Self {
        Self {
            engine: runtime.engine().clone(),
            stopped: runtime.stop_flag(),
        }
    }

    /// Launches `module` under `scope` with the given memory budget.
    ///
    /// The returned handle is valid once instantiation has completed; the
    /// worker's entry point is already running on its own task by then.
    pub async fn launch(
        &self,
        module: &CompiledModule,
        budget: MemoryBudget,
        scope: &CapabilityScope,
        options: LaunchOptions,
    ) -> Result<WorkerHandle> {
        budget.validate()?;
        let name = scope.process_name().to_string();

        let (stdin_host, stdin_worker) = pipe();
        let (stdout_host, stdout_worker) = pipe();
        let (stderr_host, stderr_worker) = pipe();

        let wasi = build_wasi_ctx(scope, stdin_worker, stdout_worker, stderr_worker)?;
        let limits = StoreLimitsBuilder::new()
            .memory_size(usize::try_from(budget.maximum_bytes()).unwrap_or(usize::MAX))
            .build();

        let mut store = Store::new(&self.engine, WorkerState { wasi, limits });
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);
        let stopped = self.stopped.clone();
        store.epoch_deadline_callback(move |_| {
            if stopped.load(Ordering::Acquire) {
                return Err(wasmtime::Error::msg("sandbox runtime shut down"));
            }
            Ok(UpdateDeadline::Yield(1))
        });

        let mut linker: Linker<WorkerState> = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |state: &mut WorkerState| &mut state.wasi)
            .map_err(|e| Error::Launch(format!("failed to link WASI imports: {e:#}")))?;

        self.provide_memory(&mut linker, &mut store, module, budget)
            .await?;

        let instance = linker
            .instantiate_async(&mut store, module.module())
            .await
            .map_err(|e| Error::Compile(format!("{e:#}")))?;
        let entry = instance
            .get_typed_func::<(), ()>(&mut store, ENTRY_POINT)
            .map_err(|e| Error::Compile(format!("missing '{ENTRY_POINT}' export: {e:#}")))?;

        let status = StatusCell::new();
        let task = tokio::spawn(run_worker(name.clone(), store, entry, status.clone()));

        tracing::info!(
            worker = %name,
            module = module.location(),
            initial_pages = budget.initial_pages,
            maximum_pages = budget.maximum_pages,
            shared = budget.shared,
            mounts = scope.mounts().len(),
            "worker launched"
        );

        let tag = |stream: &str| options.trace.then(|| TraceTag::new(&name, stream));
        Ok(WorkerHandle::new(
            name.clone(),
            options.trace,
            status,
            task,
            WorkerInput::new(stdin_host, tag("stdin")),
            WorkerOutput::new(stdout_host, tag("stdout")),
            WorkerOutput::new(stderr_host, None),
        ))
    }

    /// Defines every memory the module imports, pre-allocated from `budget`.
    ///
    /// A module that defines its own memory keeps its declared sizes; the
    /// budget then only caps growth through the store limits.
    async fn provide_memory(
        &self,
        linker: &mut Linker<WorkerState>,
        store: &mut Store<WorkerState>,
        module: &CompiledModule,
        budget: MemoryBudget,
    ) -> Result<()> {
        let mut imported = 0;
        for import in module.module().imports() {
            let ExternType::Memory(wanted) = import.ty() else {
                continue;
            };

            let (initial, maximum) = fit_budget(&wanted, budget)?;
            let memory: Extern = if wanted.is_shared() {
                if !budget.shared {
                    return Err(Error::Resource(format!(
                        "module imports shared memory '{}::{}' but the budget is not shared",
                        import.module(),
                        import.name()
                    )));
                }
                SharedMemory::new(&self.engine, MemoryType::shared(initial, maximum))
                    .map_err(|e| Error::Resource(format!("{e:#}")))?
                    .into()
            } else {
                Memory::new_async(&mut *store, MemoryType::new(initial, Some(maximum)))
                    .await
                    .map_err(|e| Error::Resource(format!("{e:#}")))?
                    .into()
            };

            linker
                .define(&*store, import.module(), import.name(), memory)
                .map_err(|e| Error::Launch(format!("{e:#}")))?;
            tracing::debug!(
                module = import.module(),
                name = import.name(),
                initial,
                maximum,
                shared = wanted.is_shared(),
                "provided imported memory"
            );
            imported += 1;
        }

        if imported == 0 {
            tracing::debug!(
                module = module.location(),
                maximum_pages = budget.maximum_pages,
                "module defines its own memory, budget applies as a growth cap only"
            );
        }
        Ok(())
    }
}

/// Reconciles an imported memory type with the budget.
///
/// The budget maximum is clamped to what the module declares; the module's
/// own minimum must fit in the budget.
fn fit_budget(wanted: &MemoryType, budget: MemoryBudget) -> Result<(u32, u32)> {
    let maximum = match wanted.maximum() {
        Some(declared) => u64::from(budget.maximum_pages).min(declared),
        None => u64::from(budget.maximum_pages),
    };
    let initial = u64::from(budget.initial_pages).min(maximum);

    if wanted.minimum() > initial {
        return Err(Error::Resource(format!(
            "module needs at least {} pages but the budget grants {}",
            wanted.minimum(),
            initial
        )));
    }

    // Both values are bounded by the budget, which fits in u32.
    Ok((initial as u32, maximum as u32))
}

fn build_wasi_ctx(
    scope: &CapabilityScope,
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
) -> Result<WasiP1Ctx> {
    let mut builder = WasiCtxBuilder::new();
    builder
        .stdin(AsyncStdinStream::new(AsyncReadStream::new(stdin)))
        .stdout(AsyncStdoutStream::new(AsyncWriteStream::new(
            PIPE_CAPACITY,
            stdout,
        )))
        .stderr(AsyncStdoutStream::new(AsyncWriteStream::new(
            PIPE_CAPACITY,
            stderr,
        )))
        .args(scope.args());

    for (key, value) in scope.env() {
        builder.env(key, value);
    }

    for mount in scope.mounts() {
        let (dir_perms, file_perms) = match mount.mode {
            MountMode::ReadOnly => (DirPerms::READ, FilePerms::READ),
            MountMode::ReadWrite => (DirPerms::all(), FilePerms::all()),
        };
        builder
            .preopened_dir(&mount.host_path, &mount.virtual_path, dir_perms, file_perms)
            .map_err(|e| {
                Error::Launch(format!(
                    "cannot mount {:?} at {}: {e:#}",
                    mount.host_path, mount.virtual_path
                ))
            })?;
    }

    Ok(builder.build_p1())
}

async fn run_worker(
    name: String,
    mut store: Store<WorkerState>,
    entry: TypedFunc<(), ()>,
    status: StatusCell,
) {
    let result = entry.call_async(&mut store, ()).await;

    let final_status = match result {
        Ok(()) => WorkerStatus::Exited { exit_code: 0 },
        Err(e) => match e.downcast_ref::<I32Exit>() {
            Some(exit) => WorkerStatus::Exited { exit_code: exit.0 },
            None => WorkerStatus::Failed {
                message: format!("{e:#}"),
            },
        },
    };

    // Dropping the store closes the worker ends of all three pipes.
    drop(store);

    match &final_status {
        WorkerStatus::Failed { message } => {
            tracing::error!(worker = %name, error = %message, "worker failed")
        }
        other => tracing::info!(worker = %name, status = ?other, "worker exited"),
    }
    status.finish(final_status);
}
