//! Lifecycle state shared by producer and consumer sessions

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Created but not yet started
    Configured,
    Running,
    Stopping,
    Stopped,
    /// Failed to connect or its loop ended on a fatal error; stays until removed
    Inert,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Inert => "inert",
        };
        f.write_str(s)
    }
}

/// State cell readable from the owning session and written by its background task
#[derive(Clone)]
pub(crate) struct StateCell(Arc<Mutex<SessionState>>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(SessionState::Configured)))
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: SessionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Moves to `next` only when currently `expected`
    pub(crate) fn transition(&self, expected: SessionState, next: SessionState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == expected {
            *state = next;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_requires_expected_state() {
        let cell = StateCell::new();
        assert!(!cell.transition(SessionState::Running, SessionState::Stopping));
        assert!(cell.transition(SessionState::Configured, SessionState::Running));
        assert_eq!(cell.get(), SessionState::Running);
        assert_eq!(cell.get().to_string(), "running");
    }
}
