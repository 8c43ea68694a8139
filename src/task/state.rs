//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created by the analyzer, not yet dispatched.
    Pending,
    /// Dispatched to a worker.
    Processing,
    /// The worker returned a result.
    Completed,
    /// The worker returned an error.
    Failed,
    /// Cooperative cancellation was observed.
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending or processing.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Processing.is_active());
    }

    #[test]
    fn status_serde() {
        let json = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let parsed: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TaskStatus::Cancelled);
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }
}
