//! Shared error taxonomy for every storage backend
//!
//! Backend-specific errors (SQLite, Redis, JSON decoding) are translated into
//! [`StorageError`] at the adapter boundary. Nothing here is retried; retry and
//! backoff belong to the caller.

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Kind of entity a point lookup was looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Item,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => f.write_str("user"),
            EntityKind::Item => f.write_str("item"),
        }
    }
}

/// Errors surfaced by the storage core
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed input, rejected before any I/O
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{id}: {kind} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Connectivity failure or a closed handle
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Duplicate feedback key inserted without overwrite permission
    #[error("conflict: {0}")]
    Conflict(String),

    /// Stored data that no longer decodes
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        StorageError::InvalidArgument(msg.into())
    }

    pub fn user_not_found(id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: EntityKind::User,
            id: id.into(),
        }
    }

    pub fn item_not_found(id: impl Into<String>) -> Self {
        StorageError::NotFound {
            kind: EntityKind::Item,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

/// Reject empty identifiers before touching the backend
pub(crate) fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StorageError::invalid(format!("{kind} id must not be empty")));
    }
    Ok(())
}

pub(crate) fn require_page_size(n: usize) -> Result<()> {
    if n == 0 {
        return Err(StorageError::invalid("page size must be positive"));
    }
    Ok(())
}
