//! Checkpoint restore staleness rule
//!
//! Audits activity telemetry for one stamp over a trailing window. Machines
//! active in the window that never restored are Missing; machines whose
//! last restore trails their last activity by at least the configured age
//! are Old. Each count is graded on its own threshold ladder and yields at
//! most one alert. The rule only reads telemetry and never touches the live
//! index.

use crate::config::schema::MonitorConfig;
use crate::coordination::activity::{ActivityLog, ActivityRecord, Operation};
use crate::error::MeshResult;
use crate::location::hash::MachineLocation;
use crate::monitor::threshold::{Severity, ThresholdLadder};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, info, warn};

/// Maximum machine identifiers quoted in an alert
pub const MAX_ALERT_EXAMPLES: usize = 5;

/// Per-machine restore summary over the window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreStatus {
    pub machine: MachineLocation,
    pub last_activity_time: DateTime<Utc>,
    pub last_restore_time: Option<DateTime<Utc>>,
}

impl RestoreStatus {
    /// `last_activity_time - last_restore_time`, if the machine restored at all
    pub fn age(&self) -> Option<Duration> {
        self.last_restore_time
            .map(|restored| self.last_activity_time - restored)
    }
}

/// Staleness classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StalenessKind {
    Missing,
    Old,
}

impl fmt::Display for StalenessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Old => write!(f, "old"),
        }
    }
}

/// A graded operational alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub stamp: String,
    pub kind: StalenessKind,
    pub severity: Severity,
    pub count: usize,
    pub threshold: usize,
    pub examples: Vec<MachineLocation>,
    pub message: String,
}

/// Outcome of one audit
#[derive(Debug, Clone, Serialize)]
pub struct StalenessReport {
    pub stamp: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub statuses: Vec<RestoreStatus>,
    pub missing: Vec<MachineLocation>,
    pub old: Vec<MachineLocation>,
    pub alerts: Vec<Alert>,
}

/// Settings for the staleness rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessRule {
    pub activity_period: Duration,
    pub age_error_threshold: Duration,
    pub missing: ThresholdLadder<usize>,
    pub old: ThresholdLadder<usize>,
}

impl StalenessRule {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            activity_period: Duration::minutes(config.activity_period_minutes as i64),
            age_error_threshold: Duration::minutes(
                config.checkpoint_age_error_threshold_minutes as i64,
            ),
            missing: config.missing,
            old: config.old,
        }
    }
}

/// Out-of-band auditor of checkpoint restore telemetry
pub struct StalenessMonitor {
    rule: StalenessRule,
}

/// Summarize rows of `stamp` within `[since, until]` per machine
///
/// A successful checkpoint creation counts as a restore: the creator's
/// index is the source of that checkpoint.
pub fn summarize(
    rows: &[ActivityRecord],
    stamp: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<RestoreStatus> {
    let mut by_machine: BTreeMap<&MachineLocation, RestoreStatus> = BTreeMap::new();

    for row in rows.iter().filter(|row| {
        row.stamp == stamp && row.precise_time_stamp >= since && row.precise_time_stamp <= until
    }) {
        let at = row.precise_time_stamp;
        let status = by_machine
            .entry(&row.machine)
            .or_insert_with(|| RestoreStatus {
                machine: row.machine.clone(),
                last_activity_time: at,
                last_restore_time: None,
            });
        status.last_activity_time = status.last_activity_time.max(at);

        let restored = row.is_success()
            && matches!(
                row.operation,
                Operation::RestoreCheckpoint | Operation::CreateCheckpoint
            );
        if restored {
            status.last_restore_time = Some(status.last_restore_time.map_or(at, |t| t.max(at)));
        }
    }

    by_machine.into_values().collect()
}

impl StalenessMonitor {
    pub fn new(rule: StalenessRule) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> &StalenessRule {
        &self.rule
    }

    /// Evaluate rows already in memory as of `now`
    pub fn evaluate(
        &self,
        rows: &[ActivityRecord],
        stamp: &str,
        now: DateTime<Utc>,
    ) -> StalenessReport {
        let window_start = now - self.rule.activity_period;
        let statuses = summarize(rows, stamp, window_start, now);

        let missing: Vec<MachineLocation> = statuses
            .iter()
            .filter(|s| s.last_restore_time.is_none())
            .map(|s| s.machine.clone())
            .collect();
        let old: Vec<MachineLocation> = statuses
            .iter()
            .filter(|s| s.age().is_some_and(|age| age >= self.rule.age_error_threshold))
            .map(|s| s.machine.clone())
            .collect();

        let alerts = [
            self.grade(stamp, StalenessKind::Missing, &missing, &self.rule.missing),
            self.grade(stamp, StalenessKind::Old, &old, &self.rule.old),
        ]
        .into_iter()
        .flatten()
        .collect();

        StalenessReport {
            stamp: stamp.to_string(),
            window_start,
            window_end: now,
            statuses,
            missing,
            old,
            alerts,
        }
    }

    /// Read the activity log and evaluate as of `now`
    pub async fn run(
        &self,
        log: &ActivityLog,
        stamp: &str,
        now: DateTime<Utc>,
    ) -> MeshResult<StalenessReport> {
        let rows = log
            .read_window(stamp, now - self.rule.activity_period, now)
            .await?;
        let report = self.evaluate(&rows, stamp, now);
        for alert in &report.alerts {
            emit(alert);
        }
        Ok(report)
    }

    fn grade(
        &self,
        stamp: &str,
        kind: StalenessKind,
        machines: &[MachineLocation],
        ladder: &ThresholdLadder<usize>,
    ) -> Option<Alert> {
        let count = machines.len();
        let (severity, threshold) = ladder.classify(count)?;
        let examples: Vec<MachineLocation> =
            machines.iter().take(MAX_ALERT_EXAMPLES).cloned().collect();

        let description = match kind {
            StalenessKind::Missing => "active machines have not restored a checkpoint".to_string(),
            StalenessKind::Old => format!(
                "machines restored a checkpoint older than {} minutes",
                self.rule.age_error_threshold.num_minutes()
            ),
        };
        let quoted: Vec<&str> = examples.iter().map(MachineLocation::as_str).collect();
        let message = format!(
            "{} {} in stamp {} (threshold {}). Examples: {}",
            count,
            description,
            stamp,
            threshold,
            quoted.join(", ")
        );

        Some(Alert {
            stamp: stamp.to_string(),
            kind,
            severity,
            count,
            threshold,
            examples,
            message,
        })
    }
}

fn emit(alert: &Alert) {
    match alert.severity {
        Severity::Info => info!(kind = %alert.kind, count = alert.count, "{}", alert.message),
        Severity::Warning => warn!(kind = %alert.kind, count = alert.count, "{}", alert.message),
        Severity::Error | Severity::Fatal => error!(
            kind = %alert.kind,
            severity = %alert.severity,
            count = alert.count,
            "{}",
            alert.message
        ),
    }
}
