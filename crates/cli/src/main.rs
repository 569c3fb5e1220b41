use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{check, serve, version};

#[derive(Parser)]
#[command(name = "sandbridge")]
#[command(about = "Run a WASI language server in a sandbox and serve it over stdio")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a language server module over stdin/stdout
    Serve(serve::ServeArgs),

    /// Load and validate a module without running it
    Check(check::CheckArgs),

    /// Show version information
    Version(version::VersionArgs),
}

#[tokio::main]
async fn main() {
    // Stdout carries protocol traffic, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve::run(args).await?,
        Commands::Check(args) => check::run(args).await?,
        Commands::Version(args) => version::run(args),
    }

    Ok(())
}
