// Error taxonomy for checklist mutations
// Validation and NotFound are reported to the originating caller only and
// never broadcast; Conflict signals a lost compare-and-swap race.

use thiserror::Error;

/// Errors surfaced by checklist operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Input rejected before any state change (bad name length, bad field).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown checklist or item id. The mutation is skipped and no event
    /// is emitted; the caller still gets this error.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Caller is not whitelisted, or a non-admin attempted an admin
    /// operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The checklist revision changed between read and write. No automatic
    /// retry; the caller resubmits.
    #[error("checklist {id} was modified concurrently")]
    Conflict { id: String },

    /// The store did not become available within the request timeout.
    #[error("store unavailable")]
    StoreUnavailable,

    /// Persistence failure from the underlying database.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A stored document failed to (de)serialize.
    #[error("corrupt document: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl SyncError {
    /// Stable machine-readable code used in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::NotFound { .. } => "not_found",
            SyncError::Unauthorized(_) => "unauthorized",
            SyncError::Conflict { .. } => "conflict",
            SyncError::StoreUnavailable => "store_unavailable",
            SyncError::Store(_) => "store_error",
            SyncError::Corrupt(_) => "corrupt_document",
        }
    }
}

/// Convenience alias used across the library.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
