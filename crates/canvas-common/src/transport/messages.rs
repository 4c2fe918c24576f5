//! Wire protocol for room messages.

use serde::{Deserialize, Serialize};

use super::{ActorId, AwarenessState};

/// Messages exchanged between replicas over a room channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollabMessage {
    /// Incremental document update produced by a local commit.
    DocUpdate {
        /// Encoded CRDT update bytes
        data: Vec<u8>,
    },

    /// Request the updates we are missing (sent on every connect).
    SyncRequest {
        /// Encoded version vector of what we already have
        have_version: Vec<u8>,
    },

    /// Answer to a sync request.
    SyncResponse {
        /// Encoded CRDT updates since the requester's version
        data: Vec<u8>,
    },

    /// Ephemeral presence. `state: None` means the actor has left.
    Awareness {
        actor: ActorId,
        /// Per-actor counter; higher wins.
        clock: u64,
        state: Option<AwarenessState>,
    },
}

impl CollabMessage {
    /// Serialize message to postcard bytes for wire transmission.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    /// Deserialize message from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabMessage::DocUpdate { .. } => "doc_update",
            CollabMessage::SyncRequest { .. } => "sync_request",
            CollabMessage::SyncResponse { .. } => "sync_response",
            CollabMessage::Awareness { .. } => "awareness",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CursorKind, CursorState, UserInfo};

    #[test]
    fn test_awareness_message_survives_the_wire() {
        let mut state = AwarenessState::new(UserInfo::new("7", "Ada"), 1_000);
        state.cursor = Some(CursorState {
            x: 12.5,
            y: -3.0,
            kind: CursorKind::Grab,
            rotation: 0.0,
        });
        state.selection = vec!["shape:1".into()];
        let msg = CollabMessage::Awareness {
            actor: ActorId(9),
            clock: 3,
            state: Some(state),
        };

        let bytes = msg.to_bytes().unwrap();
        assert_eq!(CollabMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(CollabMessage::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }
}
