//! The `check` command - loads and validates a module.

use clap::Args;
use sandbridge::{FileStorage, SandboxLoader, SandboxRuntime};
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the module to check
    module: PathBuf,
}

pub async fn run(args: CheckArgs) -> anyhow::Result<()> {
    let runtime = SandboxRuntime::new()?;
    let location = args.module.to_string_lossy();

    let result = SandboxLoader::new(runtime.engine().clone())
        .load(&FileStorage::new(), &location)
        .await;
    runtime.shutdown();

    let module = result?;
    println!("{}: ok", module.location());
    Ok(())
}
