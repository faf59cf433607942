//! Session lifecycle states and validated transitions

use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

/// Session lifecycle
///
/// ```text
/// Idle ─┬─▶ Connecting ─┬─▶ MetadataExchanged ─▶ Streaming ─▶ Draining ─▶ Closed
///       └─▶ Listening ──┘
/// ```
/// Any state may jump to `Closed` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    MetadataExchanged,
    Streaming,
    Draining,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Listening)
                | (Connecting, MetadataExchanged)
                | (Listening, MetadataExchanged)
                | (MetadataExchanged, Streaming)
                | (Streaming, Draining)
                | (_, Closed)
        ) && self != Closed
    }

    /// Validated transition
    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::MetadataExchanged => "metadata_exchanged",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_sender_path() {
        let mut state = Idle;
        for next in [Connecting, MetadataExchanged, Streaming, Draining, Closed] {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, Closed);
    }

    #[test]
    fn test_abort_from_anywhere() {
        assert!(Listening.can_transition_to(Closed));
        assert!(Streaming.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(Idle.transition(Streaming).is_err());
        assert!(Connecting.transition(Listening).is_err());
        assert!(Draining.transition(Streaming).is_err());
        assert!(matches!(
            Closed.transition(Idle),
            Err(Error::InvalidTransition { .. })
        ));
    }
}
