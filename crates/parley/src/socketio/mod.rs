//! Socket.IO realtime transport.

mod client;
pub mod packet;

pub use client::{websocket_url, SocketIoFactory, SocketIoTransport};
pub use packet::{EnginePacket, Handshake, PacketError, SocketPacket};
