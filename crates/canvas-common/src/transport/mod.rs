//! Real-time transport layer for a canvas room.
//!
//! - `TransportChannel`: the contract the sync core relies on (deliver and
//!   receive opaque bytes, report connection status)
//! - `CollabMessage`: wire protocol for document updates, sync handshake and
//!   awareness
//! - `MemoryHub`: an in-process room broker, used by tests and the simulator
//! - presence types shared by every replica in a room

mod memory;
mod messages;
mod presence;

use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::mpsc::UnboundedReceiver;

pub use memory::{MemoryChannel, MemoryHub};
pub use messages::CollabMessage;
pub use presence::{
    AwarenessState, COLLABORATOR_COLORS, CursorKind, CursorState, UserInfo, Viewport,
    color_from_index, color_from_user_id,
};

use crate::error::TransportError;

/// Identity of one connected replica.
///
/// Doubles as the CRDT peer id, the undo scope and the presence key. A fresh
/// one is drawn for every connection and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u64);

impl ActorId {
    pub fn random() -> Self {
        ActorId(rand::random())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Name of one shared document room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub SmolStr);

impl RoomId {
    pub fn new(name: impl AsRef<str>) -> Self {
        RoomId(SmolStr::new(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable 32-byte topic derived from the room name.
    pub fn topic(&self) -> [u8; 32] {
        *blake3::hash(self.0.as_bytes()).as_bytes()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection status reported by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events emitted by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StatusChanged(ConnectionStatus),
    /// Opaque bytes from a peer.
    Received(Vec<u8>),
    /// The channel finished (or lost) its initial handshake.
    Synced(bool),
}

/// Stream of events for one channel handle.
pub type TransportEvents = UnboundedReceiver<TransportEvent>;

/// A reconnecting real-time connection to one room.
///
/// The channel owns retry timing; the sync core only sends bytes, reads
/// status and pokes [`TransportChannel::reconnect`] after the host resumes.
pub trait TransportChannel: Send + Sync {
    fn room(&self) -> &RoomId;

    fn status(&self) -> ConnectionStatus;

    /// Send opaque bytes to every other member of the room.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Re-establish a dropped connection. No-op when already connected.
    fn reconnect(&self);

    /// Tear the connection down for good.
    fn destroy(&self);

    fn is_connected(&self) -> bool {
        self.status().is_connected()
    }
}

/// Opens channels: `connect(roomId, authToken) -> handle`.
pub trait TransportConnector {
    type Channel: TransportChannel + 'static;

    fn connect(&self, room: &RoomId, token: &str) -> (Self::Channel, TransportEvents);
}
