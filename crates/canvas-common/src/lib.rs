//! Shared types for the collaborative canvas sync core.
//!
//! Holds the pieces every other crate leans on: the wire protocol, the
//! transport channel contract, presence state, configuration, clocks and
//! the small observer registry used for change subscriptions.

pub mod clock;
pub mod config;
pub mod error;
pub mod subscription;
#[cfg(feature = "telemetry")]
pub mod telemetry;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{ConfigError, TransportError};
pub use subscription::{Subscribers, Subscription};
pub use transport::{
    ActorId, AwarenessState, CollabMessage, ConnectionStatus, RoomId, TransportChannel,
    TransportEvent,
};
