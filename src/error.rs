//! Error types for casmesh
//!
//! All modules use `MeshResult<T>` as their return type. Expected failure
//! modes of remote calls (not found, timeout, corruption) are modelled as
//! result values in `transfer::result`, not as errors.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for casmesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// All errors that can occur in casmesh
#[derive(Error, Debug)]
pub enum MeshError {
    // Transient errors (retried by RetryPolicy)
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error talking to {peer}: {reason}")]
    Network { peer: String, reason: String },

    // Permanent errors (never retried)
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Request rejected by {peer}: {reason}")]
    Rejected { peer: String, reason: String },

    #[error("Destination path rejected: {0}")]
    DestinationPath(PathBuf),

    #[error("Unknown machine location: {0}")]
    UnknownMachine(String),

    #[error("Invalid content hash '{value}': {reason}")]
    InvalidHash { value: String, reason: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Checkpoint {sequence} for stamp {stamp} is already published")]
    CheckpointConflict { stamp: String, sequence: u64 },

    #[error("Invalid stamp '{0}'")]
    InvalidStamp(String),

    // Fatal errors
    #[error("Startup failed after {elapsed:?}: {reason}")]
    Startup { reason: String, elapsed: Duration },

    #[error("Cannot derive a machine identity: {0}")]
    MachineIdentity(String),

    #[error("Node failed while running: {0}")]
    HostFault(String),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Lifecycle errors
    #[error("Invalid service id '{0}'")]
    InvalidServiceId(String),

    #[error("Service is {state}, cannot {action}")]
    InvalidState { state: String, action: String },

    #[error("Operation cancelled")]
    Cancelled,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a network error for a peer
    pub fn network(peer: impl ToString, reason: impl Into<String>) -> Self {
        Self::Network {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a rejection error for a peer
    pub fn rejected(peer: impl ToString, reason: impl Into<String>) -> Self {
        Self::Rejected {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if the error is transient and the call may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PeerUnavailable(_) | Self::Timeout(_) | Self::Network { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Check the file with: casmesh config show"),
            Self::UnknownMachine(_) => Some("Register the machine's data root as a peer"),
            Self::MachineIdentity(_) => Some("Set node.machine in the config or pass --machine"),
            Self::Startup { .. } => Some("Restart the node once the failing dependency is healthy"),
            _ => None,
        }
    }
}
