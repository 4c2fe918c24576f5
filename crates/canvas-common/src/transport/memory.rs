//! In-process room broker.
//!
//! Each [`MemoryChannel`] is one replica's connection. Bytes sent on a
//! connected channel are delivered to every other connected channel in the
//! same room; disconnected channels miss them, just like a dropped socket.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedSender};

use super::{ConnectionStatus, RoomId, TransportChannel, TransportConnector, TransportEvent, TransportEvents};
use crate::error::TransportError;

struct Member {
    conn: u64,
    token: String,
    status: ConnectionStatus,
    tx: UnboundedSender<TransportEvent>,
}

impl Member {
    fn emit(&self, event: TransportEvent) {
        // receiver gone means the replica is shutting down
        let _ = self.tx.send(event);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.emit(TransportEvent::StatusChanged(status));
        }
    }
}

#[derive(Default)]
struct HubState {
    next_conn: u64,
    rooms: HashMap<RoomId, Vec<Member>>,
    /// Rooms with an access list. Rooms absent here are open.
    grants: HashMap<RoomId, HashSet<String>>,
}

impl HubState {
    fn allowed(&self, room: &RoomId, token: &str) -> bool {
        self.grants
            .get(room)
            .is_none_or(|tokens| tokens.contains(token))
    }

    fn member_mut(&mut self, room: &RoomId, conn: u64) -> Option<&mut Member> {
        self.rooms
            .get_mut(room)
            .and_then(|members| members.iter_mut().find(|m| m.conn == conn))
    }

    /// Run the connect handshake for a member.
    fn open(&mut self, room: &RoomId, conn: u64) {
        let allowed = match self.member_mut(room, conn) {
            Some(member) => member.token.clone(),
            None => return,
        };
        let allowed = self.allowed(room, &allowed);
        if let Some(member) = self.member_mut(room, conn) {
            member.set_status(ConnectionStatus::Connecting);
            if allowed {
                member.set_status(ConnectionStatus::Connected);
                member.emit(TransportEvent::Synced(true));
            } else {
                tracing::warn!(%room, conn, "room access denied");
                member.set_status(ConnectionStatus::Error);
            }
        }
    }
}

/// Broker shared by every channel created from it.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Restrict a room to holders of the given token. Call once per token.
    pub fn grant(&self, room: &RoomId, token: impl Into<String>) {
        self.lock()
            .grants
            .entry(room.clone())
            .or_default()
            .insert(token.into());
    }

    /// Number of channels currently connected to `room`.
    pub fn connected_count(&self, room: &RoomId) -> usize {
        self.lock()
            .rooms
            .get(room)
            .map(|members| members.iter().filter(|m| m.status.is_connected()).count())
            .unwrap_or(0)
    }
}

impl TransportConnector for MemoryHub {
    type Channel = MemoryChannel;

    fn connect(&self, room: &RoomId, token: &str) -> (MemoryChannel, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let conn = state.next_conn;
        state.next_conn += 1;
        state.rooms.entry(room.clone()).or_default().push(Member {
            conn,
            token: token.to_owned(),
            status: ConnectionStatus::Disconnected,
            tx,
        });
        state.open(room, conn);
        drop(state);

        tracing::debug!(%room, conn, "memory channel opened");
        let channel = MemoryChannel {
            hub: self.clone(),
            room: room.clone(),
            conn,
        };
        (channel, rx)
    }
}

/// One replica's connection to a [`MemoryHub`] room.
pub struct MemoryChannel {
    hub: MemoryHub,
    room: RoomId,
    conn: u64,
}

impl MemoryChannel {
    /// Drop the connection without the replica asking for it, the way a
    /// backgrounded mobile app loses its socket.
    pub fn drop_connection(&self) {
        let mut state = self.hub.lock();
        if let Some(member) = state.member_mut(&self.room, self.conn) {
            if member.status.is_connected() {
                member.emit(TransportEvent::Synced(false));
            }
            member.set_status(ConnectionStatus::Disconnected);
        }
    }
}

impl TransportChannel for MemoryChannel {
    fn room(&self) -> &RoomId {
        &self.room
    }

    fn status(&self) -> ConnectionStatus {
        let mut state = self.hub.lock();
        state
            .member_mut(&self.room, self.conn)
            .map(|m| m.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = self.hub.lock();
        let members = state.rooms.get(&self.room).ok_or(TransportError::Destroyed)?;
        let sender = members
            .iter()
            .find(|m| m.conn == self.conn)
            .ok_or(TransportError::Destroyed)?;
        if !sender.status.is_connected() {
            return Err(TransportError::NotConnected);
        }
        for member in members
            .iter()
            .filter(|m| m.conn != self.conn && m.status.is_connected())
        {
            member.emit(TransportEvent::Received(bytes.clone()));
        }
        Ok(())
    }

    fn reconnect(&self) {
        let mut state = self.hub.lock();
        let status = match state.member_mut(&self.room, self.conn) {
            Some(member) => member.status,
            None => return,
        };
        if status.is_connected() || status == ConnectionStatus::Connecting {
            return;
        }
        tracing::debug!(room = %self.room, conn = self.conn, "memory channel reconnecting");
        state.open(&self.room, self.conn);
    }

    fn destroy(&self) {
        let mut state = self.hub.lock();
        if let Some(members) = state.rooms.get_mut(&self.room) {
            if let Some(pos) = members.iter().position(|m| m.conn == self.conn) {
                let mut member = members.remove(pos);
                member.set_status(ConnectionStatus::Disconnected);
            }
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}
