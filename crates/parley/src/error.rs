//! Error taxonomy for session connections.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("transport is closed")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("{0}")]
    Other(String),
}

/// Flat classification of [`SessionError`] for callers that only branch
/// on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionTimeout,
    TransportError,
    ReconnectExhausted,
    InvalidInput,
    Cancelled,
    NotConnected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ReconnectExhausted => "reconnect_exhausted",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotConnected => "not_connected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors surfaced to callers of the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no connection to room {room_id} within {timeout:?}")]
    ConnectionTimeout { room_id: String, timeout: Duration },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("room id must not be empty")]
    InvalidRoomId,

    #[error("connection request cancelled: {0}")]
    Cancelled(&'static str),

    #[error("link is not connected")]
    NotConnected,

    #[error("outbound backlog is full ({0} messages)")]
    BacklogFull(usize),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            SessionError::Transport(_) => ErrorKind::TransportError,
            SessionError::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            SessionError::InvalidRoomId => ErrorKind::InvalidInput,
            SessionError::Cancelled(_) => ErrorKind::Cancelled,
            SessionError::NotConnected | SessionError::BacklogFull(_) => ErrorKind::NotConnected,
        }
    }
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
