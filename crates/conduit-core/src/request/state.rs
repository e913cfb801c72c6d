//! Frontend request lifecycle.
//!
//! ```text
//! Created -> Submitted -> Pending <-> (PendingUpdate)
//!    |           |           |
//!    +-----------+-----------+--> Resolved | Rejected | TimedOut | Cancelled
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle state of one outstanding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    Submitted,
    Pending,
    Resolved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Resolved
                | RequestState::Rejected
                | RequestState::TimedOut
                | RequestState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// A fulfillment may overtake the `Submitted` bookkeeping when the backend
    /// answers before the sender returns, so every non-terminal state may move
    /// straight to any terminal state.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RequestState::Created => false,
            RequestState::Submitted => self == RequestState::Created,
            RequestState::Pending => {
                matches!(self, RequestState::Submitted | RequestState::Pending)
            }
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::Submitted => "submitted",
            RequestState::Pending => "pending",
            RequestState::Resolved => "resolved",
            RequestState::Rejected => "rejected",
            RequestState::TimedOut => "timed_out",
            RequestState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RequestState; 7] = [
        RequestState::Created,
        RequestState::Submitted,
        RequestState::Pending,
        RequestState::Resolved,
        RequestState::Rejected,
        RequestState::TimedOut,
        RequestState::Cancelled,
    ];

    #[test]
    fn test_terminal_states_are_final() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_forward_path() {
        assert!(RequestState::Created.can_transition_to(RequestState::Submitted));
        assert!(RequestState::Submitted.can_transition_to(RequestState::Pending));
        assert!(RequestState::Pending.can_transition_to(RequestState::Pending));
        assert!(RequestState::Pending.can_transition_to(RequestState::Resolved));
    }

    #[test]
    fn test_no_backwards_moves() {
        assert!(!RequestState::Pending.can_transition_to(RequestState::Submitted));
        assert!(!RequestState::Submitted.can_transition_to(RequestState::Created));
        assert!(!RequestState::Created.can_transition_to(RequestState::Pending));
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for from in ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(RequestState::Cancelled));
            assert!(from.can_transition_to(RequestState::TimedOut));
        }
    }
}
