//! Operational activity log
//!
//! Append-only JSON lines, one row per `(machine, stamp, operation, result,
//! timestamp)`. Nodes write rows as they create or restore checkpoints and
//! heartbeat; role inference and the staleness monitor only read them.
//! Role election depends on these rows, so writing them cannot be switched off.
//!
//! Rows land in one segment per UTC day, `<dir>/<YYYY-MM-DD>.jsonl`. Readers
//! open only the days their window touches and expired days are removed whole.

use crate::error::{MeshError, MeshResult};
use crate::location::hash::MachineLocation;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SEGMENT_FORMAT: &str = "%Y-%m-%d";

/// Operation recorded in an activity row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    CreateCheckpoint,
    RestoreCheckpoint,
    Heartbeat,
}

/// Result recorded in an activity row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    Success,
    Failure,
}

/// One telemetry row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivityRecord {
    pub machine: MachineLocation,
    pub stamp: String,
    pub operation: Operation,
    pub result: OperationResult,
    pub precise_time_stamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

impl ActivityRecord {
    /// Row stamped with the current time
    pub fn now(
        machine: &MachineLocation,
        stamp: &str,
        operation: Operation,
        result: OperationResult,
        sequence_number: Option<u64>,
    ) -> Self {
        Self::at(machine, stamp, operation, result, Utc::now(), sequence_number)
    }

    pub fn at(
        machine: &MachineLocation,
        stamp: &str,
        operation: Operation,
        result: OperationResult,
        precise_time_stamp: DateTime<Utc>,
        sequence_number: Option<u64>,
    ) -> Self {
        Self {
            machine: machine.clone(),
            stamp: stamp.to_string(),
            operation,
            result,
            precise_time_stamp,
            sequence_number,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == OperationResult::Success
    }
}

/// File-backed activity log
///
/// Rows are split into one file per UTC day, `<dir>/<YYYY-MM-DD>.jsonl`,
/// by their own timestamp. Window reads only open the days they span and
/// whole days are pruned once they fall out of every window.
pub struct ActivityLog {
    dir: PathBuf,
    // Serializes appends from concurrent timers on one node
    write_lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segment holding rows stamped on `day`
    pub fn segment_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", day.format(SEGMENT_FORMAT)))
    }

    /// Append a row
    ///
    /// Drops the row on IO failure; telemetry must never fail the caller.
    pub async fn append(&self, record: &ActivityRecord) {
        let mut line = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize activity row: {}", e);
                return;
            }
        };
        line.push('\n');

        let path = self.segment_path(record.precise_time_stamp.date_naive());
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.write_line(&path, &line).await {
            warn!("Failed to write activity log {}: {}", path.display(), e);
        }
    }

    async fn write_line(&self, path: &Path, line: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Days with a segment on disk, ascending
    async fn segment_days(&self) -> MeshResult<Vec<NaiveDate>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut days = vec![];
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            MeshError::io(format!("reading activity dir {}", self.dir.display()), e)
        })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MeshError::io("reading activity entry", e))?
        {
            if let Some(day) = parse_segment_day(&entry.path()) {
                days.push(day);
            }
        }
        days.sort_unstable();
        Ok(days)
    }

    async fn read_segment(&self, day: NaiveDate) -> MeshResult<Vec<ActivityRecord>> {
        let path = self.segment_path(day);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            // Pruned between listing and reading
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(MeshError::io(
                    format!("reading activity log {}", path.display()),
                    e,
                ))
            }
        };

        let mut rows = vec![];
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ActivityRecord>(line) {
                Ok(row) => rows.push(row),
                Err(e) => debug!(
                    "Skipping malformed activity row {}:{}: {}",
                    path.display(),
                    number + 1,
                    e
                ),
            }
        }
        Ok(rows)
    }

    /// Read every parseable row; malformed lines are skipped
    pub async fn read_all(&self) -> MeshResult<Vec<ActivityRecord>> {
        let mut rows = vec![];
        for day in self.segment_days().await? {
            rows.extend(self.read_segment(day).await?);
        }
        Ok(rows)
    }

    /// Rows for one stamp with `since <= timestamp <= until`
    pub async fn read_window(
        &self,
        stamp: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> MeshResult<Vec<ActivityRecord>> {
        let (first, last) = (since.date_naive(), until.date_naive());
        let mut rows = vec![];
        for day in self.segment_days().await? {
            if day < first || day > last {
                continue;
            }
            rows.extend(self.read_segment(day).await?.into_iter().filter(|row| {
                row.stamp == stamp
                    && row.precise_time_stamp >= since
                    && row.precise_time_stamp <= until
            }));
        }
        Ok(rows)
    }

    /// Delete segments whose whole day lies before `cutoff`; returns how many
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> MeshResult<usize> {
        let keep_from = cutoff.date_naive();
        let mut pruned = 0;
        for day in self.segment_days().await? {
            if day >= keep_from {
                break;
            }
            let path = self.segment_path(day);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => pruned += 1,
                // Another node pruned it first
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(MeshError::io(
                        format!("pruning activity log {}", path.display()),
                        e,
                    ))
                }
            }
        }
        if pruned > 0 {
            debug!(pruned, "Pruned activity segments");
        }
        Ok(pruned)
    }
}

fn parse_segment_day(path: &Path) -> Option<NaiveDate> {
    if path.extension()? != "jsonl" {
        return None;
    }
    NaiveDate::parse_from_str(path.file_stem()?.to_str()?, SEGMENT_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn test_log(dir: &TempDir) -> ActivityLog {
        ActivityLog::new(dir.path().join("telemetry").join("activity"))
    }

    fn heartbeat(machine: &str, stamp: &str, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord::at(
            &MachineLocation::new(machine),
            stamp,
            Operation::Heartbeat,
            OperationResult::Success,
            at,
            None,
        )
    }

    #[tokio::test]
    async fn writes_pascal_case_json_line() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let machine = MachineLocation::new("m1");
        let record = ActivityRecord::now(
            &machine,
            "stamp-a",
            Operation::CreateCheckpoint,
            OperationResult::Success,
            Some(4),
        );
        log.append(&record).await;

        let segment = log.segment_path(record.precise_time_stamp.date_naive());
        let content = tokio::fs::read_to_string(segment).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["Machine"], "m1");
        assert_eq!(parsed["Operation"], "CreateCheckpoint");
        assert_eq!(parsed["Result"], "Success");
        assert_eq!(parsed["SequenceNumber"], 4);
        assert!(parsed["PreciseTimeStamp"].is_string());
    }

    #[tokio::test]
    async fn rows_land_in_their_own_day() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 3, 2, 0, 1, 0).unwrap();
        log.append(&heartbeat("m1", "a", late)).await;
        log.append(&heartbeat("m1", "a", early)).await;

        assert!(log.segment_path(late.date_naive()).exists());
        assert!(log.segment_path(early.date_naive()).exists());
        assert_eq!(log.read_all().await.unwrap().len(), 2);

        let rows = log.read_window("a", late - Duration::minutes(5), early).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn read_window_filters_stamp_and_time() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let now = Utc::now();

        for (stamp, offset) in [("a", 10), ("a", 120), ("b", 10)] {
            log.append(&heartbeat("m1", stamp, now - Duration::minutes(offset))).await;
        }

        let rows = log.read_window("a", now - Duration::hours(1), now).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stamp, "a");
    }

    #[tokio::test]
    async fn read_window_skips_days_outside_window() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let now = Utc::now();
        log.append(&heartbeat("m1", "a", now)).await;

        // An unreadable older segment must not be opened for a recent window
        let old_day = (now - Duration::days(3)).date_naive();
        std::fs::create_dir_all(log.segment_path(old_day)).unwrap();

        let rows = log.read_window("a", now - Duration::hours(1), now).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn prune_removes_whole_days_before_cutoff() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let now = Utc::now();
        for days in [0, 1, 5, 9] {
            log.append(&heartbeat("m1", "a", now - Duration::days(days))).await;
        }

        let pruned = log.prune_before(now - Duration::days(2)).await.unwrap();

        assert_eq!(pruned, 2);
        assert_eq!(log.read_all().await.unwrap().len(), 2);
        assert_eq!(log.prune_before(now - Duration::days(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_dir_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        assert!(log.read_all().await.unwrap().is_empty());
        assert_eq!(log.prune_before(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = test_log(&dir);
        let row = heartbeat("m1", "a", Utc::now());
        log.append(&row).await;

        let segment = log.segment_path(row.precise_time_stamp.date_naive());
        let mut content = tokio::fs::read_to_string(&segment).await.unwrap();
        content.push_str("not json\n");
        tokio::fs::write(&segment, content).await.unwrap();

        assert_eq!(log.read_all().await.unwrap().len(), 1);
    }
}
