use autopilot_core::RunStatus;

use crate::error::{ClassifiedError, ErrorCode, Result};

/// Legal run status transitions.
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn validate_transition(from: &RunStatus, to: &RunStatus) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(ClassifiedError::fatal(
                ErrorCode::InvalidState,
                format!(
                    "invalid run status transition from {} to {}",
                    from.as_str(),
                    to.as_str()
                ),
            )
            .with_context("from", from.as_str())
            .with_context("to", to.as_str()))
        }
    }

    fn allowed_transitions(from: &RunStatus) -> Vec<RunStatus> {
        match from {
            RunStatus::Running => vec![RunStatus::Paused, RunStatus::Completed, RunStatus::Error],
            RunStatus::Paused => vec![RunStatus::Running],
            RunStatus::Error => vec![RunStatus::Running],
            RunStatus::Completed => vec![],
        }
    }

    pub fn can_transition(from: &RunStatus, to: &RunStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// Whether `run` may pick up a state in this status.
    pub fn can_run(status: &RunStatus) -> bool {
        matches!(status, RunStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(RunStateMachine::can_transition(
            &RunStatus::Running,
            &RunStatus::Paused
        ));
        assert!(RunStateMachine::can_transition(
            &RunStatus::Running,
            &RunStatus::Completed
        ));
        assert!(RunStateMachine::can_transition(
            &RunStatus::Paused,
            &RunStatus::Running
        ));
        assert!(RunStateMachine::can_transition(
            &RunStatus::Error,
            &RunStatus::Running
        ));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!RunStateMachine::can_transition(
            &RunStatus::Completed,
            &RunStatus::Running
        ));
        assert!(!RunStateMachine::can_transition(
            &RunStatus::Paused,
            &RunStatus::Completed
        ));
        assert!(!RunStateMachine::can_transition(
            &RunStatus::Error,
            &RunStatus::Completed
        ));
    }

    #[test]
    fn test_invalid_transition_is_fatal() {
        let err =
            RunStateMachine::validate_transition(&RunStatus::Completed, &RunStatus::Paused)
                .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code, ErrorCode::InvalidState);
    }
}
