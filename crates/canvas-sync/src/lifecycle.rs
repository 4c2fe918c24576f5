//! Host lifecycle handling.
//!
//! Mobile hosts suspend the app in the background and the socket dies with
//! it. The only reaction to coming back is to poke the channel if it is not
//! connected; retry timing stays with the channel.

use std::sync::Arc;

use canvas_common::TransportChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// App state became active.
    Foregrounded,
    /// Explicit resume event.
    Resumed,
    Backgrounded,
}

pub struct LifecycleController {
    channel: Arc<dyn TransportChannel>,
}

impl LifecycleController {
    pub fn new(channel: Arc<dyn TransportChannel>) -> Self {
        Self { channel }
    }

    /// Returns whether a reconnect was requested.
    pub fn on_signal(&self, signal: LifecycleSignal) -> bool {
        match signal {
            LifecycleSignal::Backgrounded => {
                tracing::debug!(room = %self.channel.room(), "app backgrounded");
                false
            }
            LifecycleSignal::Foregrounded | LifecycleSignal::Resumed => {
                if self.channel.is_connected() {
                    return false;
                }
                tracing::info!(room = %self.channel.room(), ?signal, "app resumed, reconnecting");
                self.channel.reconnect();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_common::RoomId;
    use canvas_common::transport::{MemoryHub, TransportConnector};

    #[test]
    fn test_resume_reconnects_only_when_dropped() {
        let hub = MemoryHub::new();
        let room = RoomId::new("board");
        let (channel, _events) = hub.connect(&room, "t");
        let channel = Arc::new(channel);
        let lifecycle = LifecycleController::new(channel.clone());

        assert!(!lifecycle.on_signal(LifecycleSignal::Resumed));

        channel.drop_connection();
        assert!(!lifecycle.on_signal(LifecycleSignal::Backgrounded));
        assert!(!channel.is_connected());

        assert!(lifecycle.on_signal(LifecycleSignal::Foregrounded));
        assert!(channel.is_connected());
        assert!(!lifecycle.on_signal(LifecycleSignal::Resumed));
    }
}
