//! The `serve` command - runs a language server module and relays its
//! protocol traffic over stdin/stdout.

use crate::config::BridgeConfig;
use anyhow::Context;
use clap::Args;
use sandbridge::{Bridge, FileStorage, MAX_WASM32_PAGES, MemoryBudget, TracingChannel, session};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for the last error-stream lines after the session ends.
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Args)]
pub struct ServeArgs {
    /// Path to the language server module (.wasm)
    #[arg(long, short)]
    module: Option<PathBuf>,

    /// Workspace root mounted at /workspace (defaults to the current directory)
    #[arg(long, short)]
    workspace: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Extra environment variables for the worker (format: KEY=VALUE)
    #[arg(long = "env", short = 'e', value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Fixed memory size in 64 KiB pages (1-65536)
    #[arg(long, value_parser = parse_pages)]
    memory_pages: Option<u32>,

    /// Do not log protocol traffic
    #[arg(long)]
    no_trace: bool,
}

pub async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    config.env.extend(args.env);
    if let Some(pages) = args.memory_pages {
        config.memory = MemoryBudget::fixed(pages, config.memory.shared);
    }
    if args.no_trace {
        config.trace = false;
    }

    let module = args
        .module
        .or_else(|| config.module.clone())
        .ok_or_else(|| anyhow::anyhow!("--module is required"))?;
    let workspace = match args.workspace.or_else(|| config.workspace.clone()) {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("workspace not found: {}", workspace.display()))?;

    let bridge = Bridge::new(
        Arc::new(FileStorage::new()),
        Arc::new(TracingChannel::new(config.process_name.clone())),
    );
    let configuration = bridge
        .activate(config.activation_options(&module, &workspace))
        .await?;

    let transport = configuration.server.connect().await?;
    let translator = configuration.client.path_translator.clone().unwrap_or_default();
    let stats = session::relay(
        transport,
        &translator,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;

    match configuration.stderr.finish_within(STDERR_FLUSH_TIMEOUT).await {
        Ok(dropped) => tracing::debug!(dropped, "worker error stream flushed"),
        Err(e) => tracing::warn!(error = %e, "worker error stream did not close"),
    }
    bridge.shutdown();

    tracing::info!(
        to_server = stats.to_server,
        to_client = stats.to_client,
        "served session"
    );
    Ok(())
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("'{s}' is not in KEY=VALUE format"))?;
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_pages(s: &str) -> Result<u32, String> {
    let pages: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if pages == 0 {
        return Err("memory must be at least 1 page".to_string());
    }
    if pages > MAX_WASM32_PAGES {
        return Err(format!("memory cannot exceed {MAX_WASM32_PAGES} pages"));
    }
    Ok(pages)
}
