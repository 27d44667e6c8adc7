//! Checkpoint command - inspect published checkpoints

use crate::cli::args::{CheckpointAction, CheckpointArgs, OutputFormat};
use crate::config::Config;
use crate::error::MeshResult;
use crate::location::{Checkpoint, CheckpointStore, FileCheckpointStore, MachineLocation};
use crate::ui;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct CheckpointSummary {
    stamp: String,
    sequence_number: u64,
    created_at: DateTime<Utc>,
    created_by: MachineLocation,
    hashes: usize,
    locations: usize,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            stamp: checkpoint.stamp.clone(),
            sequence_number: checkpoint.sequence_number,
            created_at: checkpoint.created_at,
            created_by: checkpoint.created_by.clone(),
            hashes: checkpoint.state.entries.len(),
            locations: checkpoint.state.location_count(),
        }
    }
}

/// Execute the checkpoint command
pub async fn execute(args: CheckpointArgs, config: &Config) -> MeshResult<()> {
    match args.action {
        CheckpointAction::Show { stamp, format } => {
            let stamp = stamp.unwrap_or_else(|| config.node.stamp.clone());
            show(config, &stamp, format).await
        }
    }
}

async fn show(config: &Config, stamp: &str, format: OutputFormat) -> MeshResult<()> {
    let store =
        FileCheckpointStore::new(config.data_root(), config.checkpoint.retained_checkpoints);

    let summary = match store.latest(stamp).await? {
        Some(reference) => Some(CheckpointSummary::from(&store.fetch(&reference).await?)),
        None => None,
    };

    match (format, summary) {
        (OutputFormat::Json, summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
        (OutputFormat::Table, None) => {
            ui::step_info(&format!("No checkpoint published for stamp {}", stamp));
        }
        (OutputFormat::Table, Some(summary)) => {
            ui::section(&format!("Latest checkpoint for stamp {}", summary.stamp));
            ui::key_value("sequence", &summary.sequence_number.to_string());
            ui::key_value("created at", &summary.created_at.to_rfc3339());
            ui::key_value("created by", summary.created_by.as_str());
            ui::key_value("hashes", &summary.hashes.to_string());
            ui::key_value("locations", &summary.locations.to_string());
        }
    }
    Ok(())
}
