//! Replication staleness monitoring
//!
//! Runs against historical activity telemetry, independent of the live
//! index, and only produces graded alerts.

pub mod staleness;
pub mod threshold;

pub use staleness::{
    summarize, Alert, RestoreStatus, StalenessKind, StalenessMonitor, StalenessReport,
    StalenessRule, MAX_ALERT_EXAMPLES,
};
pub use threshold::{Severity, ThresholdLadder};
