//! The realtime transport capability the session manager drives.
//!
//! A transport owns one network-level connection and its own automatic
//! reconnection loop. It reports what happens through a stream of
//! [`TransportEvent`]s and accepts named outbound messages.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::OutboundMessage;
use crate::policy::{Endpoint, ReconnectPolicy};

/// Why the transport lost its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server kicked us (`io server disconnect`)
    ServerDisconnect,
    /// We closed it ourselves (`io client disconnect`)
    ClientDisconnect,
    /// No server ping within the negotiated window
    PingTimeout,
    /// The underlying socket closed (`transport close`)
    TransportClose,
    /// The underlying socket errored (`transport error`)
    TransportError,
    /// The server sent something we could not decode
    ParseError,
    Other(String),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::ServerDisconnect => "io server disconnect",
            DisconnectReason::ClientDisconnect => "io client disconnect",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::ParseError => "parse error",
            DisconnectReason::Other(reason) => reason,
        }
    }

    /// Only a local, intentional close is not followed by reconnection.
    pub fn is_voluntary(&self) -> bool {
        matches!(self, DisconnectReason::ClientDisconnect)
    }

    /// The transport will not resume on its own after a server kick;
    /// it has to be asked to.
    pub fn needs_resume_request(&self) -> bool {
        matches!(self, DisconnectReason::ServerDisconnect)
    }
}

impl From<&str> for DisconnectReason {
    fn from(reason: &str) -> Self {
        match reason {
            "io server disconnect" => DisconnectReason::ServerDisconnect,
            "io client disconnect" => DisconnectReason::ClientDisconnect,
            "ping timeout" => DisconnectReason::PingTimeout,
            "transport close" => DisconnectReason::TransportClose,
            "transport error" => DisconnectReason::TransportError,
            "parse error" => DisconnectReason::ParseError,
            other => DisconnectReason::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed (first connect or any resume)
    Connect,
    /// The first handshake failed
    ConnectError(TransportError),
    /// The connection went away
    Disconnect(DisconnectReason),
    /// Resumed after `n` attempts
    Reconnect(u32),
    /// About to make resume attempt `n`
    ReconnectAttempt(u32),
    /// A resume attempt failed
    ReconnectError(TransportError),
    /// The reconnection budget is spent
    ReconnectFailed,
    /// The server pushed a named event
    Message { event: String, payload: Value },
}

/// A live transport handle.
///
/// All methods are non-blocking: `emit` queues a frame for the transport's
/// writer, `reconnect` and `close` signal its driver.
pub trait Transport: Send + Sync + 'static {
    fn emit(&self, message: OutboundMessage) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Resume with the transport's own reconnection machinery.
    fn reconnect(&self);

    /// Close for good. Idempotent.
    fn close(&self);
}

/// An opened transport and the stream of what happens to it.
pub struct TransportLink {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transports. The handshake runs in the background; `open` only
/// fails if the transport cannot even be started.
pub trait TransportFactory: Send + Sync + 'static {
    fn open(
        &self,
        endpoint: &Endpoint,
        policy: &ReconnectPolicy,
    ) -> Result<TransportLink, TransportError>;
}
