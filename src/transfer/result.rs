//! Typed results of transfer operations
//!
//! Ordinary transfer failures are values. Callers branch on the variant and
//! may pick an alternate location; nothing here is raised as an error.

use crate::lifecycle::ShutdownSignal;
use crate::location::hash::ContentHash;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Options for a streaming copy
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Budget for the whole transfer
    pub timeout: Option<Duration>,
    /// Abandon the transfer once this fires
    pub cancel: Option<ShutdownSignal>,
}

impl CopyOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, signal: ShutdownSignal) -> Self {
        self.cancel = Some(signal);
        self
    }
}

/// Outcome of `copy_to`
///
/// Mid-stream failures carry the number of bytes written before the
/// failure. There is no resume; a retry starts from zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CopyResult {
    Success { bytes_copied: u64 },
    FileNotFound,
    DestinationPathError { bytes_copied: u64, reason: String },
    SourceReadError { bytes_copied: u64, reason: String },
    Timeout { bytes_copied: u64 },
    Cancelled { bytes_copied: u64 },
}

impl CopyResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn bytes_copied(&self) -> u64 {
        match self {
            Self::FileNotFound => 0,
            Self::Success { bytes_copied }
            | Self::DestinationPathError { bytes_copied, .. }
            | Self::SourceReadError { bytes_copied, .. }
            | Self::Timeout { bytes_copied }
            | Self::Cancelled { bytes_copied } => *bytes_copied,
        }
    }
}

impl fmt::Display for CopyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { bytes_copied } => write!(f, "success ({} bytes)", bytes_copied),
            Self::FileNotFound => write!(f, "file not found"),
            Self::DestinationPathError { reason, .. } => write!(f, "destination error: {}", reason),
            Self::SourceReadError { reason, .. } => write!(f, "source read error: {}", reason),
            Self::Timeout { bytes_copied } => write!(f, "timed out after {} bytes", bytes_copied),
            Self::Cancelled { bytes_copied } => write!(f, "cancelled after {} bytes", bytes_copied),
        }
    }
}

/// Outcome of `check_file_exists`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExistenceResult {
    Exists { size: u64 },
    NotExists,
    Error { reason: String },
}

/// Outcome of a push handled by the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PushResult {
    Stored { bytes: u64 },
    AlreadyPresent,
    HashMismatch { actual: ContentHash },
    Rejected { reason: String },
}

impl PushResult {
    /// Whether the target holds the content afterwards
    pub fn target_has_content(&self) -> bool {
        matches!(self, Self::Stored { .. } | Self::AlreadyPresent)
    }
}

/// Options for a delete request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Remove the replica on the target only, without propagating
    pub local_only: bool,
}

impl DeleteOptions {
    pub fn local_only() -> Self {
        Self { local_only: true }
    }

    pub fn global() -> Self {
        Self { local_only: false }
    }
}

/// Outcome of a delete on one machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeleteResult {
    Deleted { bytes: u64 },
    NotFound,
    Failed { reason: String },
}

impl DeleteResult {
    /// Whether the machine no longer holds the content
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Deleted { .. } | Self::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_copied_reports_partial_progress() {
        assert_eq!(CopyResult::Timeout { bytes_copied: 42 }.bytes_copied(), 42);
        assert_eq!(CopyResult::FileNotFound.bytes_copied(), 0);
        assert!(!CopyResult::Cancelled { bytes_copied: 1 }.is_success());
    }

    #[test]
    fn copy_result_serializes_tagged() {
        let json = serde_json::to_value(CopyResult::Success { bytes_copied: 3 }).unwrap();
        assert_eq!(json["result"], "success");
        assert_eq!(json["bytes_copied"], 3);
    }

    #[test]
    fn delete_result_gone() {
        assert!(DeleteResult::NotFound.is_gone());
        assert!(!DeleteResult::Failed { reason: "x".into() }.is_gone());
    }
}
