//! Named messages exchanged with the interview room.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Event name of the room join message.
pub const JOIN_EVENT: &str = "joinInterview";
/// Event name of the keep-alive message.
pub const PING_EVENT: &str = "ping";
/// Event name the server answers keep-alives with.
pub const PONG_EVENT: &str = "pong";

/// A named message headed to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// `joinInterview {"roomId": ...}`
    Join { room_id: String },
    /// `ping {"timestamp": <ms since epoch>}`
    Ping { timestamp: i64 },
    /// Anything else the caller wants to say in the room
    Event { name: String, payload: Value },
}

impl OutboundMessage {
    pub fn join(room_id: impl Into<String>) -> Self {
        OutboundMessage::Join {
            room_id: room_id.into(),
        }
    }

    pub fn ping_now() -> Self {
        OutboundMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        OutboundMessage::Event {
            name: name.into(),
            payload,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OutboundMessage::Join { .. } => JOIN_EVENT,
            OutboundMessage::Ping { .. } => PING_EVENT,
            OutboundMessage::Event { name, .. } => name,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundMessage::Join { room_id } => json!({ "roomId": room_id }),
            OutboundMessage::Ping { timestamp } => json!({ "timestamp": timestamp }),
            OutboundMessage::Event { payload, .. } => payload.clone(),
        }
    }
}

/// A named message pushed by the server into the room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub name: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl RoomEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn is_pong(&self) -> bool {
        self.name == PONG_EVENT
    }

    /// JSON line for logs and the CLI.
    pub fn to_json(&self) -> Value {
        json!({
            "event": self.name,
            "payload": self.payload,
            "received_at": self.received_at.to_rfc3339(),
        })
    }
}
