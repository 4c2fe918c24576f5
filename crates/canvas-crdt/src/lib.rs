//! Replicated canvas document and the machinery that keeps the editor's
//! record store in step with it.
//!
//! This crate provides:
//! - `ReplicatedDoc`: Loro-backed document of keyed records with actor-tagged
//!   transactions
//! - `Record`: typed record schema with validation at the replication boundary
//! - `DocumentStore` / `MemoryStore`: the application-facing record store
//! - `SyncBridge`: two-way reconciler between the store and the document
//! - `ActorUndoManager`: undo/redo scoped to one actor's own edits

mod bridge;
mod document;
mod error;
mod record;
mod store;
mod undo;
mod value;

pub use bridge::{ReconcileStats, SyncBridge};
pub use document::{
    FieldChange, Materialized, RECORDS_CONTAINER, RecordChange, ReplicatedDoc, Transaction,
    TransactionEvent, TxnKind, TxnOrigin,
};
pub use error::{CrdtError, StoreError};
pub use record::{
    DrawProps, Fields, GeoKind, GeoProps, LocalState, NoteProps, Point, Priority, Record,
    RecordId, Shape, TextProps, TodoProps,
};
pub use store::{ChangeBatch, ChangeSource, DocumentStore, MemoryStore, SourceFilter};
pub use undo::ActorUndoManager;

// Re-export Loro types that consumers need
pub use loro::VersionVector;
