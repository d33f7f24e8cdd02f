use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse, externally visible lifecycle status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Operation accepted and persisted, no step has run yet
    Pending,
    /// Operation is being driven through its stages
    InProgress,
    /// Operation reached the finished stage
    Succeeded,
    /// Operation was aborted by a non-recoverable error or a stage timeout
    Failed,
}

impl OperationState {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Check if this is an active state (operation still owned by the engine)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Lifecycle is Pending -> InProgress -> {Succeeded | Failed}.
    ///
    /// Re-asserting the current non-terminal state is allowed so drivers can
    /// persist idempotently; nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: OperationState) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Self::Pending, _) => true,
            (Self::InProgress, Self::Pending) => false,
            (Self::InProgress, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid operation state: {s}")),
        }
    }
}

impl Default for OperationState {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_state_terminal_check() {
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(!OperationState::Pending.is_terminal());
        assert!(!OperationState::InProgress.is_terminal());
    }

    #[test]
    fn test_lifecycle_is_monotonic() {
        use OperationState::*;

        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Succeeded));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!InProgress.can_transition_to(Pending));

        for terminal in [Succeeded, Failed] {
            for next in [Pending, InProgress, Succeeded, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(OperationState::InProgress.to_string(), "in_progress");
        assert_eq!(
            "succeeded".parse::<OperationState>().unwrap(),
            OperationState::Succeeded
        );
        assert!("complete".parse::<OperationState>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&OperationState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");

        let state: OperationState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(state, OperationState::Failed);
    }
}
