//! Process-wide session state shared by the supervisor, the session and
//! the health endpoint

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Nothing started yet (initial state)
    Idle = 0,
    /// Pre-flight connectivity/auth check running
    Probing = 1,
    /// Probe succeeded, stream not yet subscribed
    Connected = 2,
    /// Subscribed and dispatching messages
    Streaming = 3,
    /// Interrupt received, finishing in-flight work
    Draining = 4,
    /// Final state
    Terminated = 5,
}

impl From<u8> for SessionState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Probing,
            2 => Self::Connected,
            3 => Self::Streaming,
            4 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

impl SessionState {
    /// Whether `self -> next` is part of the lifecycle
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Probing)
                | (Probing, Connected)
                | (Probing, Terminated)
                | (Connected, Streaming)
                | (Connected, Terminated)
                | (Streaming, Draining)
                | (Streaming, Terminated)
                // reconnect after a transport drop
                | (Streaming, Probing)
                | (Connected, Probing)
                | (Draining, Terminated)
                // interrupt before streaming started
                | (Idle, Terminated)
                | (Probing, Draining)
                | (Connected, Draining)
        )
    }

    /// Lower-case label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Probing => "probing",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }
}

/// Cloneable handle to the single process-wide state cell
#[derive(Debug, Clone)]
pub struct StateHandle {
    state: Arc<AtomicU8>,
}

impl StateHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(SessionState::Idle as u8)),
        }
    }

    /// Get current state
    pub fn get(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`. Transitions outside the lifecycle are still applied
    /// and logged at warn level.
    pub fn set(&self, next: SessionState) {
        let previous = SessionState::from(self.state.swap(next as u8, Ordering::AcqRel));
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            warn!(
                from = previous.as_str(),
                to = next.as_str(),
                "unexpected session state transition"
            );
        } else {
            debug!(from = previous.as_str(), to = next.as_str(), "session state changed");
        }
        crate::metrics::metrics().session_state.set(next as i64);
    }

    pub fn is_streaming(&self) -> bool {
        self.get() == SessionState::Streaming
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_conversion() {
        assert_eq!(SessionState::from(0), SessionState::Idle);
        assert_eq!(SessionState::from(3), SessionState::Streaming);
        assert_eq!(SessionState::from(5), SessionState::Terminated);
        assert_eq!(SessionState::from(200), SessionState::Terminated);
    }

    #[test]
    fn test_lifecycle_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Probing));
        assert!(Probing.can_transition_to(Terminated));
        assert!(Streaming.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Terminated));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Terminated.can_transition_to(Streaming));
        assert!(!Draining.can_transition_to(Streaming));
    }

    #[test]
    fn test_handle_is_shared_between_clones() {
        let handle = StateHandle::new();
        let observer = handle.clone();
        assert_eq!(observer.get(), SessionState::Idle);

        handle.set(SessionState::Probing);
        handle.set(SessionState::Connected);
        handle.set(SessionState::Streaming);
        assert!(observer.is_streaming());

        handle.set(SessionState::Draining);
        handle.set(SessionState::Terminated);
        assert_eq!(observer.get(), SessionState::Terminated);
    }
}
