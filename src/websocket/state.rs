//! WebSocket session lifecycle state.

/// WebSocket session state.
///
/// Transitions are monotonic: a session only ever moves forward through
/// `Connecting → Open → Closing → Closed`, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[non_exhaustive]
pub enum SessionState {
    /// Handshake in progress.
    #[default]
    Connecting,
    /// Handshake complete; framed I/O is available.
    Open,
    /// Close initiated, waiting for the peer's close frame.
    Closing,
    /// Session is fully closed.
    Closed,
}

impl SessionState {
    /// Advance to `next` if it is a forward transition.
    ///
    /// Returns `true` if the state changed. Backward transitions are
    /// ignored, which keeps the lifecycle monotonic even when close paths
    /// race.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    /// Check if framed sends are allowed in this state.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    /// Check if incoming frames are still processed in this state.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Closing)
    }

    /// Check if the session has fully closed.
    #[must_use]
    #[inline]
    pub const fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Open => write!(f, "Open"),
            SessionState::Closing => write!(f, "Closing"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert_eq!(SessionState::default(), SessionState::Connecting);
    }

    #[test]
    fn test_forward_transitions() {
        let mut state = SessionState::Connecting;
        assert!(state.advance(SessionState::Open));
        assert!(state.advance(SessionState::Closing));
        assert!(state.advance(SessionState::Closed));
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_backward_transitions_ignored() {
        let mut state = SessionState::Closed;
        assert!(!state.advance(SessionState::Open));
        assert!(!state.advance(SessionState::Connecting));
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_skip_transitions_allowed() {
        // A failed handshake goes straight from Connecting to Closed.
        let mut state = SessionState::Connecting;
        assert!(state.advance(SessionState::Closed));
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_can_send_in_each_state() {
        assert!(!SessionState::Connecting.can_send());
        assert!(SessionState::Open.can_send());
        assert!(!SessionState::Closing.can_send());
        assert!(!SessionState::Closed.can_send());
    }

    #[test]
    fn test_can_receive_in_each_state() {
        assert!(!SessionState::Connecting.can_receive());
        assert!(SessionState::Open.can_receive());
        assert!(SessionState::Closing.can_receive());
        assert!(!SessionState::Closed.can_receive());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Connecting.to_string(), "Connecting");
        assert_eq!(SessionState::Closed.to_string(), "Closed");
    }
}
