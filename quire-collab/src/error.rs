use thiserror::Error;
use uuid::Uuid;

use crate::model::Permission;
use crate::storage::LogError;

/// Errors surfaced by the collaboration engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollabError {
    /// Decoding or validation failed; nothing was queued.
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    /// The log moved under an append. Retried internally; only surfaces
    /// from the log layer.
    #[error("version conflict: expected {expected}, log is at {current}")]
    VersionConflict { expected: u64, current: u64 },

    /// The client claims a version the server never produced.
    #[error("base version {base} is ahead of current version {current}")]
    FutureVersion { base: u64, current: u64 },

    #[error("user {user} needs {required} permission on document {document}")]
    PermissionDenied {
        document: Uuid,
        user: Uuid,
        required: Permission,
    },

    /// Appending to the version log failed; the operation was not logged.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("no session for user {user} on document {document}")]
    SessionNotFound { document: Uuid, user: Uuid },

    #[error("comment not found: {0}")]
    CommentNotFound(Uuid),

    #[error("anchor {start}..{end} is outside a {len}-character document")]
    InvalidAnchor { start: usize, end: usize, len: usize },

    #[error("engine is shutting down")]
    Shutdown,
}

impl CollabError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedOperation(reason.into())
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageFailure(reason.into())
    }

    /// Whether resubmitting the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollabError::VersionConflict { .. })
    }

    /// Whether the client must catch up via `entries_since` before continuing.
    pub fn requires_resync(&self) -> bool {
        matches!(self, CollabError::FutureVersion { .. })
    }
}

impl From<quire_ot::OtError> for CollabError {
    fn from(e: quire_ot::OtError) -> Self {
        CollabError::MalformedOperation(e.to_string())
    }
}

impl From<LogError> for CollabError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::VersionConflict { expected, current } => {
                CollabError::VersionConflict { expected, current }
            }
            LogError::DocumentNotFound(id) => CollabError::DocumentNotFound(id),
            LogError::LengthMismatch { .. } => CollabError::MalformedOperation(e.to_string()),
            LogError::DocumentExists(_) | LogError::Store(_) => {
                CollabError::StorageFailure(e.to_string())
            }
        }
    }
}
