//! Configuration schema for casmesh
//!
//! Configuration is stored at `~/.config/casmesh/config.toml`. Every
//! section falls back to defaults, so a partial file is valid.

use crate::monitor::threshold::ThresholdLadder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Identity of this node
    pub node: NodeConfig,

    /// Checkpoint creation and restore
    pub checkpoint: CheckpointConfig,

    /// Role inference windows
    pub roles: RolesConfig,

    /// Retry policy for peer calls
    pub retry: RetryConfig,

    /// Staleness monitor rule
    pub monitor: MonitorConfig,

    /// Peer transfer timeouts
    pub transfer: TransferConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Minimum log level: "trace", "debug", "info", "warn" or "error"
    pub log_level: String,

    /// Log format: "text" or "json"
    pub log_format: String,

    /// Shared root holding checkpoints, activity telemetry and machine stores
    pub data_root: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            data_root: None,
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This machine's location; defaults to `<data_root>/machines/<host>`
    pub machine: Option<PathBuf>,

    /// Deployment grouping sharing one location index
    pub stamp: String,

    /// Identifier accepted by remote teardown requests
    pub service_id: Option<String>,

    /// Upper bound on graceful shutdown
    pub shutdown_timeout_minutes: u64,

    /// Accept teardown requests addressed to `service_id`
    pub remote_teardown: bool,

    /// Other machine locations reachable from this node
    pub peers: Vec<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            machine: None,
            stamp: "default".to_string(),
            service_id: None,
            shutdown_timeout_minutes: 30,
            remote_teardown: true,
            peers: vec![],
        }
    }
}

/// Checkpoint timers and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Master: seconds between checkpoint creations
    pub create_interval_seconds: u64,

    /// Worker: seconds between restore attempts (also the heartbeat interval)
    pub restore_interval_seconds: u64,

    /// Checkpoint files kept per stamp
    pub retained_checkpoints: usize,

    /// Locations not seen for this long are evicted from the index (0 = never)
    pub eviction_after_minutes: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            create_interval_seconds: 300,
            restore_interval_seconds: 60,
            retained_checkpoints: 10,
            eviction_after_minutes: 24 * 60,
        }
    }
}

/// Windows used to infer the current master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    /// Machines with any activity in this window count as active
    pub activity_window_minutes: u64,

    /// A successful checkpoint creation in this window marks the master
    pub master_activity_window_minutes: u64,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            activity_window_minutes: 60,
            master_activity_window_minutes: 15,
        }
    }
}

/// Retry policy settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Seconds between attempts
    pub interval_seconds: u64,

    /// Attempts including the first
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            max_attempts: 12,
        }
    }
}

/// Staleness monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Trailing window audited by each run
    pub activity_period_minutes: u64,

    /// Restores trailing activity by at least this much are Old
    pub checkpoint_age_error_threshold_minutes: u64,

    /// Ladder for the count of active machines that never restored
    pub missing: ThresholdLadder<usize>,

    /// Ladder for the count of machines with old restores
    pub old: ThresholdLadder<usize>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            activity_period_minutes: 60,
            checkpoint_age_error_threshold_minutes: 45,
            missing: ThresholdLadder::new(1, 3, 5, 10),
            old: ThresholdLadder::new(1, 3, 5, 10),
        }
    }
}

/// Peer transfer timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Budget for one content copy
    pub copy_timeout_seconds: u64,

    /// Budget for one existence check
    pub existence_check_timeout_seconds: u64,

    /// Budget for one peer call attempt (copy request, push, delete)
    pub call_timeout_seconds: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            copy_timeout_seconds: 300,
            existence_check_timeout_seconds: 10,
            call_timeout_seconds: 60,
        }
    }
}

impl Config {
    /// Problems that make this configuration unusable
    pub fn problems(&self) -> Vec<String> {
        let mut problems = vec![];

        let nonzero = [
            ("checkpoint.create_interval_seconds", self.checkpoint.create_interval_seconds),
            ("checkpoint.restore_interval_seconds", self.checkpoint.restore_interval_seconds),
            ("roles.activity_window_minutes", self.roles.activity_window_minutes),
            ("roles.master_activity_window_minutes", self.roles.master_activity_window_minutes),
            ("monitor.activity_period_minutes", self.monitor.activity_period_minutes),
            ("node.shutdown_timeout_minutes", self.node.shutdown_timeout_minutes),
            ("transfer.copy_timeout_seconds", self.transfer.copy_timeout_seconds),
            ("transfer.call_timeout_seconds", self.transfer.call_timeout_seconds),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", key));
            }
        }

        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.checkpoint.retained_checkpoints == 0 {
            problems.push("checkpoint.retained_checkpoints must be at least 1".to_string());
        }
        if !self.monitor.missing.is_ascending() {
            problems.push("monitor.missing thresholds must ascend from info to fatal".to_string());
        }
        if !self.monitor.old.is_ascending() {
            problems.push("monitor.old thresholds must ascend from info to fatal".to_string());
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            problems.push(format!(
                "general.log_format must be \"text\" or \"json\", got \"{}\"",
                self.general.log_format
            ));
        }
        if self.node.stamp.trim().is_empty() {
            problems.push("node.stamp must not be empty".to_string());
        } else if !super::is_plain_name(&self.node.stamp) {
            problems.push(format!(
                "node.stamp \"{}\" must be usable as a directory name",
                self.node.stamp
            ));
        }

        problems
    }
}
