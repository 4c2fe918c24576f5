//! Session orchestration for the collaborative canvas.
//!
//! Sits on top of `canvas-crdt` and wires a replica to the outside world:
//! - `Session`: connects a document and record store to a room channel,
//!   replays offline edits and rotates the actor on reconnect
//! - `AwarenessBroadcaster`: throttled presence with idle and leave handling
//! - `TaskReconciler` / `ReconcilerDriver`: mirrors todo cards to the task
//!   REST backend, creating each backend task exactly once
//! - `LifecycleController` and `ConnectionIndicator`: host resume handling
//!   and the user-facing connection banner

pub mod awareness;
pub mod backend;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod presence;
pub mod reconciler;
pub mod session;

pub use awareness::{AwarenessBroadcaster, AwarenessUpdate};
pub use backend::{
    HttpTaskBackend, ListId, NewTask, NotificationKind, TaskBackend, TaskEntity, TaskId,
    TaskNotification, TaskUpdate,
};
pub use connection::{ConnectionIndicator, IndicatorState};
pub use error::{SyncError, TaskApiError};
pub use lifecycle::{LifecycleController, LifecycleSignal};
pub use presence::{
    ActivityTier, FollowState, PeerMap, PresenceDiff, PresenceWatcher, ThrottleDecision,
    activity_tier, is_idle, throttle_decision,
};
pub use reconciler::{BackendCall, BackendSignal, ReconcilerDriver, StorePatch, TaskReconciler};
pub use session::Session;
