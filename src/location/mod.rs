//! Content location tracking
//!
//! The location index answers "which machines hold this hash" and is the
//! unit of replication between machines of a stamp. It is synchronized by
//! periodic checkpoints: the master publishes, workers restore.

pub mod checkpoint;
pub mod hash;
pub mod index;

pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointRef, CheckpointStore, FileCheckpointStore,
    RestoreOutcome,
};
pub use hash::{ContentHash, MachineLocation};
pub use index::{ContentLocationIndex, IndexEntry, IndexState, LocationEntry, MergeStats};
