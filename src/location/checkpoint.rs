//! Checkpoints of the content location index
//!
//! The master serializes the whole index into a [`Checkpoint`] tagged with
//! the next sequence number of its stamp. Workers compare the newest
//! published sequence with their watermark and merge strictly newer
//! checkpoints into their local index.
//!
//! Creation and restore share one exclusive section, so a restore can never
//! interleave with the snapshot-and-publish of a checkpoint on the same node.

use crate::config::is_plain_name;
use crate::coordination::activity::{ActivityLog, ActivityRecord, Operation, OperationResult};
use crate::error::{MeshError, MeshResult};
use crate::location::hash::MachineLocation;
use crate::location::index::{ContentLocationIndex, IndexState, MergeStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Sequence numbers tried before creation gives up on a contended stamp
const PUBLISH_ATTEMPTS: usize = 5;

/// Versioned snapshot of the content location index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stamp: String,
    pub sequence_number: u64,
    pub created_at: DateTime<Utc>,
    pub created_by: MachineLocation,
    pub state: IndexState,
}

/// Reference to a published checkpoint, cheap to obtain without reading it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRef {
    pub stamp: String,
    pub sequence_number: u64,
}

/// Where checkpoints are published and fetched
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Publish a checkpoint; an existing checkpoint is never overwritten
    async fn publish(&self, checkpoint: &Checkpoint) -> MeshResult<()>;

    /// Newest published checkpoint for a stamp
    async fn latest(&self, stamp: &str) -> MeshResult<Option<CheckpointRef>>;

    /// Read a published checkpoint
    async fn fetch(&self, reference: &CheckpointRef) -> MeshResult<Checkpoint>;
}

/// Checkpoint store backed by a shared directory
///
/// Layout: `<root>/checkpoints/<stamp>/<sequence:020>.json`
pub struct FileCheckpointStore {
    root: PathBuf,
    retained: usize,
}

impl FileCheckpointStore {
    /// Create a store under `root`, keeping at most `retained` checkpoints per stamp
    pub fn new(root: impl Into<PathBuf>, retained: usize) -> Self {
        Self {
            root: root.into(),
            retained: retained.max(1),
        }
    }

    fn stamp_dir(&self, stamp: &str) -> MeshResult<PathBuf> {
        if !is_plain_name(stamp) {
            return Err(MeshError::InvalidStamp(stamp.to_string()));
        }
        Ok(self.root.join("checkpoints").join(stamp))
    }

    fn checkpoint_path(&self, stamp: &str, sequence: u64) -> MeshResult<PathBuf> {
        Ok(self.stamp_dir(stamp)?.join(format!("{:020}.json", sequence)))
    }

    /// Published sequence numbers for a stamp, ascending
    async fn sequences(&self, stamp: &str) -> MeshResult<Vec<u64>> {
        let dir = self.stamp_dir(stamp)?;
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut sequences = vec![];
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| MeshError::io(format!("reading checkpoint dir {}", dir.display()), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MeshError::io("reading checkpoint entry", e))?
        {
            if let Some(sequence) = parse_sequence(&entry.path()) {
                sequences.push(sequence);
            }
        }

        sequences.sort_unstable();
        Ok(sequences)
    }

    async fn prune(&self, stamp: &str) -> MeshResult<()> {
        let sequences = self.sequences(stamp).await?;
        if sequences.len() <= self.retained {
            return Ok(());
        }

        let excess = sequences.len() - self.retained;
        for sequence in &sequences[..excess] {
            let path = self.checkpoint_path(stamp, *sequence)?;
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to prune checkpoint {}: {}", path.display(), e);
            }
        }
        debug!(stamp, pruned = excess, "Pruned old checkpoints");
        Ok(())
    }
}

fn parse_sequence(path: &Path) -> Option<u64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn publish(&self, checkpoint: &Checkpoint) -> MeshResult<()> {
        let dir = self.stamp_dir(&checkpoint.stamp)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| MeshError::io(format!("creating checkpoint dir {}", dir.display()), e))?;

        let path = self.checkpoint_path(&checkpoint.stamp, checkpoint.sequence_number)?;
        let conflict = || MeshError::CheckpointConflict {
            stamp: checkpoint.stamp.clone(),
            sequence: checkpoint.sequence_number,
        };
        if path.exists() {
            return Err(conflict());
        }

        // Each writer stages its own file; the no-clobber link decides who owns the sequence
        let staging = tempfile::Builder::new()
            .prefix(".publish-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| MeshError::io(format!("staging checkpoint in {}", dir.display()), e))?;
        let content = serde_json::to_vec(checkpoint)?;
        fs::write(staging.path(), content).await.map_err(|e| {
            MeshError::io(format!("writing checkpoint {}", staging.path().display()), e)
        })?;
        match staging.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => return Err(conflict()),
            Err(e) => {
                return Err(MeshError::io(
                    format!("publishing checkpoint {}", path.display()),
                    e.error,
                ))
            }
        }

        self.prune(&checkpoint.stamp).await
    }

    async fn latest(&self, stamp: &str) -> MeshResult<Option<CheckpointRef>> {
        Ok(self
            .sequences(stamp)
            .await?
            .last()
            .map(|sequence| CheckpointRef {
                stamp: stamp.to_string(),
                sequence_number: *sequence,
            }))
    }

    async fn fetch(&self, reference: &CheckpointRef) -> MeshResult<Checkpoint> {
        let path = self.checkpoint_path(&reference.stamp, reference.sequence_number)?;
        let content = fs::read(&path)
            .await
            .map_err(|e| MeshError::io(format!("reading checkpoint {}", path.display()), e))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Outcome of applying a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Checkpoint merged; watermark advanced to `sequence_number`
    Applied {
        sequence_number: u64,
        stats: MergeStats,
    },
    /// Checkpoint not newer than the watermark; nothing changed
    Skipped { watermark: u64 },
    /// No checkpoint published for the stamp yet
    NoneAvailable,
}

#[derive(Debug, Default)]
struct CheckpointState {
    /// Highest sequence this node has applied or created
    watermark: Option<u64>,
}

/// Creates checkpoints (master) and restores them (worker) for one stamp
pub struct CheckpointManager {
    stamp: String,
    machine: MachineLocation,
    index: Arc<ContentLocationIndex>,
    store: Arc<dyn CheckpointStore>,
    activity: Arc<ActivityLog>,
    state: Mutex<CheckpointState>,
}

impl CheckpointManager {
    pub fn new(
        stamp: impl Into<String>,
        machine: MachineLocation,
        index: Arc<ContentLocationIndex>,
        store: Arc<dyn CheckpointStore>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            stamp: stamp.into(),
            machine,
            index,
            store,
            activity,
            state: Mutex::new(CheckpointState::default()),
        }
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Highest applied sequence number, if any
    pub async fn watermark(&self) -> Option<u64> {
        self.state.lock().await.watermark
    }

    /// Snapshot the index and publish it under the next sequence number
    pub async fn create_checkpoint(&self) -> MeshResult<Checkpoint> {
        let result = self.create_checkpoint_inner().await;
        let (outcome, sequence) = match &result {
            Ok(checkpoint) => (OperationResult::Success, Some(checkpoint.sequence_number)),
            Err(_) => (OperationResult::Failure, None),
        };
        self.activity
            .append(&ActivityRecord::now(
                &self.machine,
                &self.stamp,
                Operation::CreateCheckpoint,
                outcome,
                sequence,
            ))
            .await;
        result
    }

    async fn create_checkpoint_inner(&self) -> MeshResult<Checkpoint> {
        let mut state = self.state.lock().await;
        let mut floor = state.watermark.unwrap_or(0);

        for _ in 0..PUBLISH_ATTEMPTS {
            let published = self
                .store
                .latest(&self.stamp)
                .await?
                .map(|r| r.sequence_number)
                .unwrap_or(0);
            let sequence_number = published.max(floor) + 1;

            let checkpoint = Checkpoint {
                stamp: self.stamp.clone(),
                sequence_number,
                created_at: Utc::now(),
                created_by: self.machine.clone(),
                state: self.index.snapshot(),
            };
            match self.store.publish(&checkpoint).await {
                Ok(()) => {}
                Err(MeshError::CheckpointConflict { sequence, .. }) => {
                    warn!(
                        stamp = %self.stamp,
                        sequence,
                        "Sequence already published by another machine, retrying"
                    );
                    floor = sequence;
                    continue;
                }
                Err(e) => return Err(e),
            }
            state.watermark = Some(sequence_number);

            info!(
                stamp = %self.stamp,
                sequence = sequence_number,
                hashes = checkpoint.state.entries.len(),
                "Created checkpoint"
            );
            return Ok(checkpoint);
        }

        Err(MeshError::Checkpoint(format!(
            "no free sequence number for stamp {} after {} attempts",
            self.stamp, PUBLISH_ATTEMPTS
        )))
    }

    /// Merge a checkpoint into the local index if it is newer than the watermark
    pub async fn restore_checkpoint(&self, checkpoint: &Checkpoint) -> MeshResult<RestoreOutcome> {
        if checkpoint.stamp != self.stamp {
            return Err(MeshError::Checkpoint(format!(
                "checkpoint belongs to stamp {}, node serves {}",
                checkpoint.stamp, self.stamp
            )));
        }

        let mut state = self.state.lock().await;
        Ok(self.apply_locked(&mut state, checkpoint))
    }

    fn apply_locked(&self, state: &mut CheckpointState, checkpoint: &Checkpoint) -> RestoreOutcome {
        if let Some(watermark) = state.watermark {
            if checkpoint.sequence_number <= watermark {
                debug!(
                    sequence = checkpoint.sequence_number,
                    watermark, "Checkpoint not newer than watermark, skipping"
                );
                return RestoreOutcome::Skipped { watermark };
            }
        }

        let stats = self.index.merge(&checkpoint.state);
        state.watermark = Some(checkpoint.sequence_number);
        info!(
            stamp = %self.stamp,
            sequence = checkpoint.sequence_number,
            added = stats.added,
            refreshed = stats.refreshed,
            "Restored checkpoint"
        );
        RestoreOutcome::Applied {
            sequence_number: checkpoint.sequence_number,
            stats,
        }
    }

    /// Fetch the newest published checkpoint and apply it if newer
    pub async fn restore_latest(&self) -> MeshResult<RestoreOutcome> {
        let result = self.restore_latest_inner().await;
        let record = match &result {
            Ok(RestoreOutcome::Applied {
                sequence_number, ..
            }) => Some((OperationResult::Success, Some(*sequence_number))),
            Ok(_) => None,
            Err(_) => Some((OperationResult::Failure, None)),
        };
        if let Some((outcome, sequence)) = record {
            self.activity
                .append(&ActivityRecord::now(
                    &self.machine,
                    &self.stamp,
                    Operation::RestoreCheckpoint,
                    outcome,
                    sequence,
                ))
                .await;
        }
        result
    }

    async fn restore_latest_inner(&self) -> MeshResult<RestoreOutcome> {
        let mut state = self.state.lock().await;

        let Some(reference) = self.store.latest(&self.stamp).await? else {
            return Ok(RestoreOutcome::NoneAvailable);
        };
        if let Some(watermark) = state.watermark {
            if reference.sequence_number <= watermark {
                return Ok(RestoreOutcome::Skipped { watermark });
            }
        }

        let checkpoint = self.store.fetch(&reference).await?;
        Ok(self.apply_locked(&mut state, &checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::hash::ContentHash;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        store: Arc<FileCheckpointStore>,
        activity: Arc<ActivityLog>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(temp.path(), 3));
        let activity = Arc::new(ActivityLog::new(temp.path().join("activity")));
        Fixture {
            _temp: temp,
            store,
            activity,
        }
    }

    fn manager(f: &Fixture, machine: &str, index: Arc<ContentLocationIndex>) -> CheckpointManager {
        CheckpointManager::new(
            "stamp-a",
            MachineLocation::new(machine),
            index,
            f.store.clone(),
            f.activity.clone(),
        )
    }

    #[tokio::test]
    async fn sequence_numbers_strictly_increase() {
        let f = fixture();
        let master = manager(&f, "m1", Arc::new(ContentLocationIndex::new()));

        let first = master.create_checkpoint().await.unwrap();
        let second = master.create_checkpoint().await.unwrap();
        let third = master.create_checkpoint().await.unwrap();

        assert_eq!(first.sequence_number, 1);
        assert!(second.sequence_number > first.sequence_number);
        assert!(third.sequence_number > second.sequence_number);
    }

    #[tokio::test]
    async fn new_master_continues_published_sequence() {
        let f = fixture();
        let old = manager(&f, "m1", Arc::new(ContentLocationIndex::new()));
        old.create_checkpoint().await.unwrap();
        old.create_checkpoint().await.unwrap();

        let new = manager(&f, "m2", Arc::new(ContentLocationIndex::new()));
        let next = new.create_checkpoint().await.unwrap();
        assert_eq!(next.sequence_number, 3);
    }

    #[tokio::test]
    async fn round_trip_into_empty_index() {
        let f = fixture();
        let source = Arc::new(ContentLocationIndex::new());
        source.record(ContentHash::of(b"a"), MachineLocation::new("m1"));
        source.record(ContentHash::of(b"a"), MachineLocation::new("m2"));
        source.record(ContentHash::of(b"b"), MachineLocation::new("m3"));
        let master = manager(&f, "m1", source.clone());
        let checkpoint = master.create_checkpoint().await.unwrap();

        let target = Arc::new(ContentLocationIndex::new());
        let worker = manager(&f, "w1", target.clone());
        let outcome = worker.restore_checkpoint(&checkpoint).await.unwrap();

        assert!(matches!(outcome, RestoreOutcome::Applied { sequence_number: 1, .. }));
        assert_eq!(target.mapping(), source.mapping());
    }

    #[tokio::test]
    async fn restore_at_or_below_watermark_is_noop() {
        let f = fixture();
        let source = Arc::new(ContentLocationIndex::new());
        source.record(ContentHash::of(b"a"), MachineLocation::new("m1"));
        let master = manager(&f, "m1", source.clone());
        let first = master.create_checkpoint().await.unwrap();
        source.record(ContentHash::of(b"b"), MachineLocation::new("m1"));
        let second = master.create_checkpoint().await.unwrap();

        let target = Arc::new(ContentLocationIndex::new());
        let worker = manager(&f, "w1", target.clone());
        worker.restore_checkpoint(&second).await.unwrap();
        let before = target.mapping();

        let again = worker.restore_checkpoint(&second).await.unwrap();
        let older = worker.restore_checkpoint(&first).await.unwrap();

        assert_eq!(again, RestoreOutcome::Skipped { watermark: 2 });
        assert_eq!(older, RestoreOutcome::Skipped { watermark: 2 });
        assert_eq!(target.mapping(), before);
        assert_eq!(worker.watermark().await, Some(2));
    }

    #[tokio::test]
    async fn restore_does_not_clobber_newer_local_records() {
        let f = fixture();
        let source = Arc::new(ContentLocationIndex::new());
        let hash = ContentHash::of(b"a");
        source.record_at(hash, MachineLocation::new("m1"), Utc::now() - chrono::Duration::hours(1));
        let master = manager(&f, "m1", source);
        let checkpoint = master.create_checkpoint().await.unwrap();

        let target = Arc::new(ContentLocationIndex::new());
        target.record(hash, MachineLocation::new("m1"));
        target.record(hash, MachineLocation::new("w1"));
        let recent = target.lookup_entries(&hash)[0].last_seen;

        let worker = manager(&f, "w1", target.clone());
        worker.restore_checkpoint(&checkpoint).await.unwrap();

        let entries = target.lookup_entries(&hash);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.last_seen >= recent - chrono::Duration::seconds(1)));
    }

    #[tokio::test]
    async fn restore_latest_fetches_newest() {
        let f = fixture();
        let source = Arc::new(ContentLocationIndex::new());
        source.record(ContentHash::of(b"a"), MachineLocation::new("m1"));
        let master = manager(&f, "m1", source.clone());

        let worker = manager(&f, "w1", Arc::new(ContentLocationIndex::new()));
        assert_eq!(worker.restore_latest().await.unwrap(), RestoreOutcome::NoneAvailable);

        master.create_checkpoint().await.unwrap();
        master.create_checkpoint().await.unwrap();

        let outcome = worker.restore_latest().await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::Applied { sequence_number: 2, .. }));
        assert_eq!(
            worker.restore_latest().await.unwrap(),
            RestoreOutcome::Skipped { watermark: 2 }
        );

        let rows = f.activity.read_all().await.unwrap();
        let restores = rows
            .iter()
            .filter(|r| r.operation == Operation::RestoreCheckpoint)
            .count();
        assert_eq!(restores, 1);
    }

    #[tokio::test]
    async fn restore_rejects_foreign_stamp() {
        let f = fixture();
        let worker = manager(&f, "w1", Arc::new(ContentLocationIndex::new()));
        let checkpoint = Checkpoint {
            stamp: "other".to_string(),
            sequence_number: 1,
            created_at: Utc::now(),
            created_by: MachineLocation::new("m9"),
            state: IndexState::default(),
        };
        assert!(worker.restore_checkpoint(&checkpoint).await.is_err());
    }

    #[tokio::test]
    async fn store_prunes_to_retained_count() {
        let f = fixture();
        let master = manager(&f, "m1", Arc::new(ContentLocationIndex::new()));
        for _ in 0..5 {
            master.create_checkpoint().await.unwrap();
        }

        let sequences = f.store.sequences("stamp-a").await.unwrap();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn store_refuses_overwrite() {
        let f = fixture();
        let checkpoint = Checkpoint {
            stamp: "stamp-a".to_string(),
            sequence_number: 7,
            created_at: Utc::now(),
            created_by: MachineLocation::new("m1"),
            state: IndexState::default(),
        };
        f.store.publish(&checkpoint).await.unwrap();
        let err = f.store.publish(&checkpoint).await.unwrap_err();
        assert!(matches!(err, MeshError::CheckpointConflict { sequence: 7, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_masters_never_share_a_sequence() {
        for _ in 0..25 {
            let f = fixture();
            let first = Arc::new(manager(&f, "m1", Arc::new(ContentLocationIndex::new())));
            let second = Arc::new(manager(&f, "m2", Arc::new(ContentLocationIndex::new())));

            let (a, b) = tokio::join!(
                tokio::spawn({
                    let first = first.clone();
                    async move { first.create_checkpoint().await }
                }),
                tokio::spawn({
                    let second = second.clone();
                    async move { second.create_checkpoint().await }
                }),
            );
            let a = a.unwrap().unwrap();
            let b = b.unwrap().unwrap();

            assert_ne!(a.sequence_number, b.sequence_number);
            for published in [&a, &b] {
                let stored = f
                    .store
                    .fetch(&CheckpointRef {
                        stamp: "stamp-a".to_string(),
                        sequence_number: published.sequence_number,
                    })
                    .await
                    .unwrap();
                assert_eq!(stored.created_by, published.created_by);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restore_never_loses_concurrent_local_records() {
        let f = fixture();
        let source = Arc::new(ContentLocationIndex::new());
        for i in 0..200u32 {
            source.record(ContentHash::of(&i.to_le_bytes()), MachineLocation::new("m1"));
        }
        let master = manager(&f, "m1", source);
        let mut checkpoints = vec![];
        for _ in 0..3 {
            checkpoints.push(master.create_checkpoint().await.unwrap());
        }

        let target = Arc::new(ContentLocationIndex::new());
        let worker = Arc::new(manager(&f, "w1", target.clone()));
        let local = MachineLocation::new("w1");

        let recorder = tokio::spawn({
            let target = target.clone();
            let local = local.clone();
            async move {
                for i in 0..200u32 {
                    target.record(ContentHash::of(&i.to_le_bytes()), local.clone());
                    tokio::task::yield_now().await;
                }
            }
        });
        let restorer = tokio::spawn({
            let worker = worker.clone();
            async move {
                for checkpoint in &checkpoints {
                    worker.restore_checkpoint(checkpoint).await.unwrap();
                    tokio::task::yield_now().await;
                }
            }
        });
        recorder.await.unwrap();
        restorer.await.unwrap();

        for i in 0..200u32 {
            let holders = target.lookup(&ContentHash::of(&i.to_le_bytes()));
            assert!(holders.contains(&local), "local record {} lost", i);
            assert!(holders.contains(&MachineLocation::new("m1")));
        }
        assert_eq!(worker.watermark().await, Some(3));
    }

    #[tokio::test]
    async fn stamps_cannot_escape_the_store() {
        let f = fixture();
        for stamp in ["../x", "a/b", ".."] {
            let err = f.store.latest(stamp).await.unwrap_err();
            assert!(matches!(err, MeshError::InvalidStamp(_)));
        }

        let escaping = CheckpointManager::new(
            "../outside",
            MachineLocation::new("m1"),
            Arc::new(ContentLocationIndex::new()),
            f.store.clone(),
            f.activity.clone(),
        );
        assert!(escaping.create_checkpoint().await.is_err());
        assert!(!f._temp.path().join("outside").exists());
    }
}
