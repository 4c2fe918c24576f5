//! Error types for document and store operations.

use miette::Diagnostic;
use thiserror::Error;

/// Errors from the replicated document and the sync bridge.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum CrdtError {
    /// Failed to import CRDT data.
    #[error("failed to import CRDT data: {0}")]
    #[diagnostic(code(canvas::crdt::import))]
    Import(String),

    /// Failed to export CRDT data.
    #[error("failed to export CRDT data: {0}")]
    #[diagnostic(code(canvas::crdt::export))]
    Export(String),

    /// Loro rejected an operation.
    #[error("loro error: {0}")]
    #[diagnostic(code(canvas::crdt::loro))]
    Loro(String),

    /// A record failed schema validation.
    #[error("invalid record {id}: {message}")]
    #[diagnostic(code(canvas::crdt::schema))]
    InvalidRecord { id: String, message: String },

    /// A change batch reached a local-only entry point with the wrong origin.
    #[error("change batch is not user-originated")]
    #[diagnostic(
        code(canvas::crdt::origin),
        help("reconciliation writes must never be fed back as local changes")
    )]
    NotLocal,

    /// The local store refused a write.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

impl From<loro::LoroError> for CrdtError {
    fn from(e: loro::LoroError) -> Self {
        CrdtError::Loro(e.to_string())
    }
}

impl From<loro::LoroEncodeError> for CrdtError {
    fn from(e: loro::LoroEncodeError) -> Self {
        CrdtError::Export(e.to_string())
    }
}

/// Errors from a [`DocumentStore`](crate::DocumentStore).
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store rejected record {id}: {reason}")]
    #[diagnostic(code(canvas::store::rejected))]
    Rejected { id: String, reason: String },
}
