//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// casmesh - content-addressable cache mesh node
///
/// Runs a cache node that replicates its content location index through
/// checkpoints, and audits checkpoint restore staleness.
#[derive(Parser, Debug)]
#[command(name = "casmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CASMESH_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a cache node until interrupted or torn down
    Serve(ServeArgs),

    /// Audit checkpoint restore staleness from activity telemetry
    Monitor(MonitorArgs),

    /// Inspect published checkpoints
    Checkpoint(CheckpointArgs),

    /// Ask a running node to shut down by service id
    Teardown(TeardownArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Stamp to join (overrides node.stamp)
    #[arg(long)]
    pub stamp: Option<String>,

    /// This machine's location (overrides node.machine)
    #[arg(long)]
    pub machine: Option<PathBuf>,

    /// Service id for teardown requests (defaults to a random id)
    #[arg(long)]
    pub service_id: Option<String>,
}

/// Arguments for the monitor command
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Stamp to audit (defaults to node.stamp)
    #[arg(long)]
    pub stamp: Option<String>,

    /// Trailing window in minutes (overrides monitor.activity_period_minutes)
    #[arg(long)]
    pub period_minutes: Option<u64>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the checkpoint command
#[derive(Parser, Debug)]
pub struct CheckpointArgs {
    /// Subcommand for checkpoint
    #[command(subcommand)]
    pub action: CheckpointAction,
}

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointAction {
    /// Describe the newest checkpoint of a stamp
    Show {
        /// Stamp to inspect (defaults to node.stamp)
        #[arg(long)]
        stamp: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },
}

/// Arguments for the teardown command
#[derive(Parser, Debug)]
pub struct TeardownArgs {
    /// Service id of the node to stop
    pub service_id: String,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
}
