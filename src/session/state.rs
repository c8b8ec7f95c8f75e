//! CallSession state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for its scheduled time and an open window.
    Scheduled,
    /// A worker is driving the flow over a channel.
    InProgress,
    /// Administratively held. Any live attempt keeps running but nothing is retried.
    Paused,
    /// The flow reached its end.
    Completed,
    /// Attempts exhausted.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl SessionStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;

        matches!(
            (self, target),
            // From Scheduled
            (Scheduled, InProgress) | (Scheduled, Paused) | (Scheduled, Cancelled) |
            // From InProgress
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, Scheduled) |
            (InProgress, Paused) | (InProgress, Cancelled) |
            // From Paused (the live attempt may still finish)
            (Paused, InProgress) | (Paused, Scheduled) | (Paused, Completed) |
            (Paused, Failed) | (Paused, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const ALL: [SessionStatus; 6] = [
        Self::Scheduled,
        Self::InProgress,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown session status: {s}"))
    }
}

/// A state transition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Longest transition history kept per session.
pub const MAX_TRANSITIONS: usize = 200;

/// Append a transition, dropping the oldest entries beyond the cap.
pub fn push_transition(history: &mut Vec<StateTransition>, transition: StateTransition) {
    history.push(transition);
    if history.len() > MAX_TRANSITIONS {
        let drain_count = history.len() - MAX_TRANSITIONS;
        history.drain(..drain_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        use SessionStatus::*;
        assert!(Scheduled.can_transition_to(InProgress));
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Scheduled));
        assert!(InProgress.can_transition_to(Paused));
        assert!(Paused.can_transition_to(InProgress));
        assert!(Paused.can_transition_to(Completed));
    }

    #[test]
    fn terminal_states_go_nowhere() {
        for from in [SessionStatus::Completed, SessionStatus::Failed, SessionStatus::Cancelled] {
            assert!(from.is_terminal());
            for to in SessionStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn scheduled_cannot_complete_directly() {
        assert!(!SessionStatus::Scheduled.can_transition_to(SessionStatus::Completed));
        assert!(!SessionStatus::Scheduled.can_transition_to(SessionStatus::Failed));
    }

    #[test]
    fn display_and_parse_agree() {
        for status in SessionStatus::ALL {
            assert_eq!(status.to_string().parse::<SessionStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&SessionStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!("stuck".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn transition_history_capped() {
        let mut history = Vec::new();
        for i in 0..250 {
            push_transition(
                &mut history,
                StateTransition {
                    from: SessionStatus::Scheduled,
                    to: SessionStatus::InProgress,
                    timestamp: Utc::now(),
                    reason: Some(format!("attempt {i}")),
                },
            );
        }
        assert_eq!(history.len(), MAX_TRANSITIONS);
        assert_eq!(history[0].reason.as_deref(), Some("attempt 50"));
    }
}
