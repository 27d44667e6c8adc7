//! Master/worker role inference
//!
//! The master of a stamp is the machine with the most recent successful
//! checkpoint creation inside the master activity window. Every other
//! machine is a worker. Inference is advisory: two machines may briefly
//! both believe they are master, and checkpoint sequence monotonicity keeps
//! the index convergent regardless.

use crate::coordination::activity::{ActivityLog, ActivityRecord, Operation};
use crate::error::MeshResult;
use crate::location::hash::MachineLocation;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Coordinating role of a machine within a stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Infer the master of `stamp` at `now` from activity rows
///
/// Without recent master activity, the lowest ordered machine active within
/// `activity_window` (the local machine counts as active) takes over.
pub fn infer_master(
    rows: &[ActivityRecord],
    stamp: &str,
    local: &MachineLocation,
    now: DateTime<Utc>,
    master_window: Duration,
    activity_window: Duration,
) -> MachineLocation {
    let master_since = now - master_window;
    let latest_creation = rows
        .iter()
        .filter(|row| {
            row.stamp == stamp
                && row.operation == Operation::CreateCheckpoint
                && row.is_success()
                && row.precise_time_stamp >= master_since
                && row.precise_time_stamp <= now
        })
        // Latest timestamp wins; ties go to the lower ordered machine
        .max_by(|a, b| {
            a.precise_time_stamp
                .cmp(&b.precise_time_stamp)
                .then_with(|| b.machine.cmp(&a.machine))
        });

    if let Some(row) = latest_creation {
        return row.machine.clone();
    }

    let active_since = now - activity_window;
    let mut active: BTreeSet<&MachineLocation> = rows
        .iter()
        .filter(|row| {
            row.stamp == stamp
                && row.precise_time_stamp >= active_since
                && row.precise_time_stamp <= now
        })
        .map(|row| &row.machine)
        .collect();
    active.insert(local);

    active
        .into_iter()
        .next()
        .cloned()
        .unwrap_or_else(|| local.clone())
}

/// Periodically re-evaluates this machine's role from the activity log
pub struct RoleCoordinator {
    machine: MachineLocation,
    stamp: String,
    activity: Arc<ActivityLog>,
    master_window: Duration,
    activity_window: Duration,
}

impl RoleCoordinator {
    pub fn new(
        machine: MachineLocation,
        stamp: impl Into<String>,
        activity: Arc<ActivityLog>,
        master_window: Duration,
        activity_window: Duration,
    ) -> Self {
        Self {
            machine,
            stamp: stamp.into(),
            activity,
            master_window,
            activity_window,
        }
    }

    /// Current master of the stamp as seen at `now`
    pub async fn current_master_at(&self, now: DateTime<Utc>) -> MeshResult<MachineLocation> {
        let since = now - self.master_window.max(self.activity_window);
        let rows = self.activity.read_window(&self.stamp, since, now).await?;
        Ok(infer_master(
            &rows,
            &self.stamp,
            &self.machine,
            now,
            self.master_window,
            self.activity_window,
        ))
    }

    /// This machine's role at `now`
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> MeshResult<Role> {
        let master = self.current_master_at(now).await?;
        let role = if master == self.machine {
            Role::Master
        } else {
            Role::Worker
        };
        debug!(stamp = %self.stamp, %master, %role, "Evaluated role");
        Ok(role)
    }

    pub async fn evaluate(&self) -> MeshResult<Role> {
        self.evaluate_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::activity::OperationResult;
    use tempfile::TempDir;

    fn row(machine: &str, op: Operation, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord::at(
            &MachineLocation::new(machine),
            "s1",
            op,
            OperationResult::Success,
            at,
            None,
        )
    }

    #[test]
    fn recent_creator_is_master() {
        let now = Utc::now();
        let rows = vec![
            row("m1", Operation::CreateCheckpoint, now - Duration::minutes(8)),
            row("m2", Operation::CreateCheckpoint, now - Duration::minutes(2)),
        ];
        let master = infer_master(
            &rows,
            "s1",
            &MachineLocation::new("m3"),
            now,
            Duration::minutes(10),
            Duration::hours(1),
        );
        assert_eq!(master, MachineLocation::new("m2"));
    }

    #[test]
    fn quiet_master_is_replaced() {
        let now = Utc::now();
        let rows = vec![
            row("m0", Operation::CreateCheckpoint, now - Duration::minutes(30)),
            row("m2", Operation::Heartbeat, now - Duration::minutes(1)),
            row("m1", Operation::Heartbeat, now - Duration::minutes(1)),
        ];
        let master = infer_master(
            &rows,
            "s1",
            &MachineLocation::new("m3"),
            now,
            Duration::minutes(10),
            Duration::minutes(5),
        );
        assert_eq!(master, MachineLocation::new("m1"));
    }

    #[test]
    fn failed_creation_does_not_count() {
        let now = Utc::now();
        let mut failed = row("m0", Operation::CreateCheckpoint, now);
        failed.result = OperationResult::Failure;
        let master = infer_master(
            &[failed],
            "s1",
            &MachineLocation::new("m5"),
            now,
            Duration::minutes(10),
            Duration::minutes(5),
        );
        // m0 is still active, and orders before m5
        assert_eq!(master, MachineLocation::new("m0"));
    }

    #[test]
    fn lone_machine_becomes_master() {
        let local = MachineLocation::new("solo");
        let master = infer_master(
            &[],
            "s1",
            &local,
            Utc::now(),
            Duration::minutes(10),
            Duration::minutes(5),
        );
        assert_eq!(master, local);
    }

    #[tokio::test]
    async fn coordinator_reads_activity_log() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(ActivityLog::new(dir.path().join("activity")));
        let now = Utc::now();
        log.append(&row("m1", Operation::CreateCheckpoint, now - Duration::minutes(1)))
            .await;

        let worker = RoleCoordinator::new(
            MachineLocation::new("m0"),
            "s1",
            log.clone(),
            Duration::minutes(10),
            Duration::hours(1),
        );
        let master = RoleCoordinator::new(
            MachineLocation::new("m1"),
            "s1",
            log,
            Duration::minutes(10),
            Duration::hours(1),
        );

        assert_eq!(worker.evaluate_at(now).await.unwrap(), Role::Worker);
        assert_eq!(master.evaluate_at(now).await.unwrap(), Role::Master);
    }
}
