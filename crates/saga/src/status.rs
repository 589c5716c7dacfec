//! Saga status state machine.

use serde::{Deserialize, Serialize};

/// Status of a saga instance.
///
/// Transitions:
/// ```text
/// Pending ──► Running ──► Completed
///    │           │
///    └───────────┴──► Failed ──► Compensating ──► Compensated
///                       │ ▲            │
///         (admin retry) ▼ │            ▼ (compensation failed)
///                     Pending        Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Created, workflow not yet launched.
    Pending,

    /// Workflow in flight.
    Running,

    /// All steps completed. Terminal.
    Completed,

    /// A step or the workflow itself failed. Compensation or an admin
    /// retry may follow.
    Failed,

    /// Compensation in flight.
    Compensating,

    /// Compensation concluded. Terminal.
    Compensated,
}

impl SagaStatus {
    /// Whether a transition to `next` is allowed. Admin operations are
    /// bound by the same table: `Failed -> Pending` is the manual retry,
    /// and `Pending | Running | Compensating -> Failed` the manual
    /// cancel/mark-failed.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Compensating)
                | (Failed, Pending)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Compensated)
    }

    /// The status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SagaStatus::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
    }

    #[test]
    fn compensation_chain() {
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Compensating));
        assert!(Compensating.can_transition_to(Compensated));
    }

    #[test]
    fn admin_retry_reopens_a_failed_saga() {
        assert!(Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Compensated.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for next in [Pending, Running, Completed, Failed, Compensating, Compensated] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Compensated.can_transition_to(next));
        }
    }

    #[test]
    fn no_skipping_states() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Compensated));
        assert!(!Failed.can_transition_to(Completed));
    }
}
