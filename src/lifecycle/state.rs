//! Service state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl ServiceState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, ShuttingDown)
                | (Running, Failed)
                | (ShuttingDown, Stopped)
        )
    }

    /// No transitions leave a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            ServiceState::Created,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::ShuttingDown,
            ServiceState::Stopped,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failure_only_from_starting_or_running() {
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Failed));
        assert!(ServiceState::Running.can_transition_to(ServiceState::Failed));
        assert!(!ServiceState::Created.can_transition_to(ServiceState::Failed));
        assert!(!ServiceState::ShuttingDown.can_transition_to(ServiceState::Failed));
    }

    #[test]
    fn terminal_states_are_final() {
        for next in [ServiceState::Starting, ServiceState::Running, ServiceState::Stopped] {
            assert!(!ServiceState::Stopped.can_transition_to(next));
            assert!(!ServiceState::Failed.can_transition_to(next));
        }
        assert!(ServiceState::Failed.is_terminal());
        assert!(!ServiceState::Running.is_terminal());
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ServiceState::ShuttingDown).unwrap(),
            "\"shutting_down\""
        );
    }
}
