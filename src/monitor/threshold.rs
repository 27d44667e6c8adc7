//! Graded threshold ladders

use serde::{Deserialize, Serialize};
use std::fmt;

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    /// All severities, most severe first
    const DESCENDING: [Severity; 4] = [Self::Fatal, Self::Error, Self::Warning, Self::Info];
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Per-severity comparison values over a measured quantity
///
/// Unset levels are skipped. A measurement maps to the most severe level
/// whose threshold it reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThresholdLadder<T> {
    pub info: Option<T>,
    pub warning: Option<T>,
    pub error: Option<T>,
    pub fatal: Option<T>,
}

impl<T: Ord + Copy> ThresholdLadder<T> {
    pub fn new(info: T, warning: T, error: T, fatal: T) -> Self {
        Self {
            info: Some(info),
            warning: Some(warning),
            error: Some(error),
            fatal: Some(fatal),
        }
    }

    pub fn threshold(&self, severity: Severity) -> Option<T> {
        match severity {
            Severity::Info => self.info,
            Severity::Warning => self.warning,
            Severity::Error => self.error,
            Severity::Fatal => self.fatal,
        }
    }

    /// Severity for `value`, or `None` if it is below every configured level
    pub fn classify(&self, value: T) -> Option<(Severity, T)> {
        Severity::DESCENDING.into_iter().find_map(|severity| {
            self.threshold(severity)
                .filter(|threshold| value >= *threshold)
                .map(|threshold| (severity, threshold))
        })
    }

    /// Whether configured levels are strictly ascending with severity
    pub fn is_ascending(&self) -> bool {
        let configured: Vec<T> = Severity::DESCENDING
            .into_iter()
            .rev()
            .filter_map(|severity| self.threshold(severity))
            .collect();
        configured.windows(2).all(|pair| pair[0] < pair[1])
    }
}
