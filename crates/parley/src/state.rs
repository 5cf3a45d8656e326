//! Lifecycle states of a room link.

/// Where a room link is in its lifecycle.
///
/// ```text
/// Idle ──connect()──▶ Connecting ──join──▶ Connected ◀──resume── Reconnecting
///                         │                  │  ▲                    │
///                         └─error/timeout─▶ Failed ◀──budget spent───┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport open
    #[default]
    Idle,
    /// Transport opening, a connect request is outstanding
    Connecting,
    /// Joined, heartbeat armed
    Connected,
    /// The transport is resuming after a drop it did not ask for
    Reconnecting,
    /// The last attempt failed; `connect()` starts over
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    /// Connected or on its way back to connected without caller action.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
