//! parley - realtime connections to interview rooms
//!
//! A [`SessionConnectionManager`] owns at most one link to the realtime
//! backend. It connects, joins the requested room, keeps the link alive
//! with periodic pings, follows the transport through drops and
//! reconnections, and tears everything down on request.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Connecting -> Connected <-> Reconnecting
//!            |                            |
//!            +---------> Failed <---------+
//! ```
//!
//! The join message is sent on every transition into `Connected`, so a
//! resumed link is always back in its room before anything else goes out.
//!
//! ## Transports
//!
//! The manager drives any [`TransportFactory`]. [`SocketIoFactory`] speaks
//! Socket.IO over a WebSocket; tests script their own.

pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod message;
pub mod policy;
pub mod socketio;
pub mod state;
pub mod transport;

pub use error::{ErrorKind, Result, SessionError, TransportError};
pub use heartbeat::Heartbeat;
pub use manager::{Connection, SessionConnectionManager};
pub use message::{OutboundMessage, RoomEvent, JOIN_EVENT, PING_EVENT, PONG_EVENT};
pub use policy::{Endpoint, ReconnectPolicy, SessionSettings};
pub use socketio::{SocketIoFactory, SocketIoTransport};
pub use state::ConnectionState;
pub use transport::{DisconnectReason, Transport, TransportEvent, TransportFactory, TransportLink};
