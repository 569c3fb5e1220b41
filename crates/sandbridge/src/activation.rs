//! Turning a module location and a workspace into a ready server
//! configuration.
//!
//! [`Bridge::activate`] runs every step in order: start the sandbox runtime,
//! load the module, compute the capability scope, launch the worker, forward
//! its error stream and wrap its protocol streams in a transport factory. A
//! failure at any step is reported once on the output channel and returned.

use crate::handle::WorkerStatus;
use crate::launcher::{LaunchOptions, WorkerLauncher};
use crate::loader::{ModuleStorage, SandboxLoader};
use crate::multiplexer::StderrForwarder;
use crate::runtime::SandboxRuntime;
use crate::transport::{ServerOptions, TransportFactory};
use sandbridge_core::{
    ClientOptions, Error, MemoryBudget, MountMode, OutputChannel, Result, ScopePolicy,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Process name used when none is configured.
pub const DEFAULT_PROCESS_NAME: &str = "protolsp";

/// Environment the protobuf language server is started with by default.
pub const DEFAULT_ENV: &[(&str, &str)] = &[
    ("PROTOLSP_DEBUG", "1"),
    ("RUST_BACKTRACE", "1"),
    ("RUST_LOG", "debug"),
];

/// Everything needed to activate one worker.
#[derive(Debug, Clone)]
pub struct ActivationOptions {
    /// Storage location of the compiled module.
    pub module_location: String,
    /// Host directory mounted at `/workspace`.
    pub workspace_root: PathBuf,
    pub workspace_mode: MountMode,
    pub process_name: String,
    /// Complete environment of the worker. Nothing is inherited.
    pub env: BTreeMap<String, String>,
    pub memory: MemoryBudget,
    /// Log protocol traffic at trace level.
    pub trace: bool,
    /// Document selector handed to the protocol client. The path translator
    /// is filled in during activation.
    pub client: ClientOptions,
}

impl ActivationOptions {
    /// Options for the protobuf language server with the usual defaults.
    pub fn new(module_location: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            module_location: module_location.into(),
            workspace_root: workspace_root.into(),
            workspace_mode: MountMode::ReadWrite,
            process_name: DEFAULT_PROCESS_NAME.to_string(),
            env: DEFAULT_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            memory: MemoryBudget::default(),
            trace: true,
            client: ClientOptions::proto(),
        }
    }
}

/// Result of a successful activation. Consumed once by a protocol client.
pub struct ServerConfiguration {
    pub server: ServerOptions,
    pub client: ClientOptions,
    /// Forwarder attached to the worker's error stream.
    pub stderr: StderrForwarder,
}

impl std::fmt::Debug for ServerConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfiguration")
            .field("server", &self.server)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

/// Entry point shared by every activation in a host process.
///
/// Owns the sandbox runtime, which is started on first use.
pub struct Bridge {
    runtime: OnceCell<SandboxRuntime>,
    storage: Arc<dyn ModuleStorage>,
    channel: Arc<dyn OutputChannel>,
}

impl Bridge {
    pub fn new(storage: Arc<dyn ModuleStorage>, channel: Arc<dyn OutputChannel>) -> Self {
        Self {
            runtime: OnceCell::new(),
            storage,
            channel,
        }
    }

    /// Returns the runtime, starting it if needed.
    pub async fn runtime(&self) -> Result<&SandboxRuntime> {
        self.runtime
            .get_or_try_init(|| async { SandboxRuntime::new() })
            .await
    }

    /// Launches the worker described by `options`.
    pub async fn activate(&self, options: ActivationOptions) -> Result<ServerConfiguration> {
        match self.try_activate(options).await {
            Ok(configuration) => Ok(configuration),
            Err(e) => {
                let stage = e.stage();
                tracing::error!(%stage, error = %e, "activation failed");
                self.channel
                    .append_line(&format!("activation failed during {stage}: {e}"));
                Err(e)
            }
        }
    }

    async fn try_activate(&self, options: ActivationOptions) -> Result<ServerConfiguration> {
        let runtime = self.runtime().await?;

        let module = SandboxLoader::new(runtime.engine().clone())
            .load(self.storage.as_ref(), &options.module_location)
            .await?;

        let scope = ScopePolicy::workspace(options.workspace_root.clone())
            .with_mode(options.workspace_mode)
            .with_env(options.env.clone())
            .scope(options.process_name.clone());

        let mut handle = WorkerLauncher::new(runtime)
            .launch(
                &module,
                options.memory,
                &scope,
                LaunchOptions {
                    trace: options.trace,
                },
            )
            .await?;

        // A worker that dies during start-up has nothing to serve.
        if let WorkerStatus::Failed { message } = handle.status() {
            return Err(Error::Launch(message));
        }

        let stderr = StderrForwarder::attach(&mut handle, self.channel.clone())?;
        let client = options.client.with_path_translator(scope.translator());

        tracing::info!(
            module = %options.module_location,
            workspace = %options.workspace_root.display(),
            worker = %handle.id(),
            "activated language server"
        );

        Ok(ServerConfiguration {
            server: ServerOptions::Worker(TransportFactory::new(handle)),
            client,
            stderr,
        })
    }

    /// Stops the runtime. Workers still running fail at their next epoch
    /// check.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.get() {
            runtime.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_protobuf_server() {
        let options = ActivationOptions::new("protolsp.wasm", "/home/dev/project");
        assert_eq!(options.process_name, "protolsp");
        assert_eq!(options.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(options.env.len(), 3);
        assert_eq!(options.memory, MemoryBudget::default());
        assert!(options.trace);
        assert!(options.client.selects("file", "proto"));
        assert!(options.client.path_translator.is_none());
    }
}
