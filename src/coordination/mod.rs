//! Coordination between machines of a stamp
//!
//! Machines share no memory. They coordinate through the activity log
//! (who created or restored which checkpoint, and when) and the checkpoint
//! store.

pub mod activity;
pub mod role;

pub use activity::{ActivityLog, ActivityRecord, Operation, OperationResult};
pub use role::{infer_master, Role, RoleCoordinator};
