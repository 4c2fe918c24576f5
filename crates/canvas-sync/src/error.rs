use canvas_common::TransportError;
use canvas_crdt::CrdtError;
use miette::Diagnostic;

/// Errors surfaced by a [`Session`](crate::Session).
#[derive(Debug, thiserror::Error, Diagnostic)]
#[non_exhaustive]
pub enum SyncError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("session has been closed")]
    #[diagnostic(code(canvas::sync::closed))]
    Closed,
}

/// A failed call to the task REST API.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(canvas::sync::task_api))]
pub struct TaskApiError {
    /// HTTP status, or `None` when no response arrived.
    pub status: Option<u16>,
    pub message: String,
    /// Structured `detail` from the error body, when there was one.
    pub detail: Option<serde_json::Value>,
}

impl TaskApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            detail: None,
        }
    }

    /// Build from an error status and its (possibly absent) JSON body.
    ///
    /// The message is taken from `detail`, then `message`, falling back to a
    /// generic one naming the status.
    pub fn from_body(status: u16, body: Option<&serde_json::Value>) -> Self {
        let detail = body.and_then(|b| b.get("detail")).cloned();
        let message = body
            .and_then(|b| {
                b.get("detail")
                    .and_then(|d| d.as_str())
                    .or_else(|| b.get("message").and_then(|m| m.as_str()))
            })
            .filter(|m| !m.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("Request failed with status {status}"));
        Self {
            status: Some(status),
            message,
            detail,
        }
    }

    /// The request never produced a response.
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self {
            status: None,
            message: err.to_string(),
            detail: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl From<reqwest::Error> for TaskApiError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TaskApiError::new(status.as_u16(), err.to_string()),
            None => TaskApiError::network(err),
        }
    }
}
