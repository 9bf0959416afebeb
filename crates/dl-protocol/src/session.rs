//! Session identifier type

use std::fmt;

/// Unique identifier for one multiplexed session on the tunnel.
///
/// Identifiers are allocated by the client, monotonically, and never
/// reused within one transport connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Session ID for control frames not bound to a session (Ping/Pong)
    pub const CONTROL: SessionId = SessionId(0);
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display() {
        assert_eq!(format!("{}", SessionId::new(7)), "session-7");
    }

    #[test]
    fn test_control_id_is_zero() {
        assert_eq!(SessionId::CONTROL.as_u32(), 0);
    }
}
