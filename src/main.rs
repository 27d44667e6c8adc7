//! casmesh - distributed content-addressable cache coordination
//!
//! CLI entry point that dispatches to subcommands.

use casmesh::cli::{Cli, Commands};
use casmesh::config::ConfigManager;
use casmesh::error::MeshResult;
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> MeshResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // -v = debug, -vv = trace, otherwise the configured level
    let filter = match cli.verbose {
        0 => EnvFilter::new(format!("casmesh={}", config.general.log_level)),
        1 => EnvFilter::new("casmesh=debug"),
        _ => EnvFilter::new("casmesh=trace"),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    debug!("Using config at {}", config_manager.path().display());

    match cli.command {
        Commands::Serve(args) => casmesh::cli::commands::serve(args, &config).await,
        Commands::Monitor(args) => casmesh::cli::commands::monitor(args, &config).await,
        Commands::Checkpoint(args) => casmesh::cli::commands::checkpoint(args, &config).await,
        Commands::Teardown(args) => casmesh::cli::commands::teardown(args, &config).await,
        Commands::Config(args) => {
            casmesh::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
