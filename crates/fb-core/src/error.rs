//! Error types for store-backed coordination operations

use rusqlite::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the heartbeat registry and the message outbox
#[derive(Error, Debug)]
pub enum CoordError {
    /// Payload could not be serialized for storage
    #[error("Invalid object: {message}")]
    InvalidObject {
        message: String,
        source: serde_json::Error,
    },

    /// A store constraint was violated while running `operation`
    #[error("Integrity violation during {operation}: {source}")]
    Integrity {
        operation: &'static str,
        source: rusqlite::Error,
    },

    /// Any other store failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A configured delivery service is not in the known enumeration
    #[error("Unknown delivery service: {0}")]
    UnknownService(String),

    /// Partition index is outside of `0..count`, or count is zero
    #[error("Invalid partition {index}/{count}")]
    InvalidPartition { index: u32, count: u32 },

    /// A stored row could not be decoded
    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, CoordError>;

impl CoordError {
    /// Wrap a store error, promoting constraint violations to [`CoordError::Integrity`].
    pub(crate) fn from_store(operation: &'static str, source: rusqlite::Error) -> Self {
        if is_constraint_violation(&source) {
            Self::Integrity { operation, source }
        } else {
            Self::Database(source)
        }
    }

    /// Attribute a store error to `operation`; other variants pass through.
    pub(crate) fn in_operation(self, operation: &'static str) -> Self {
        match self {
            Self::Database(source) => Self::from_store(operation, source),
            other => other,
        }
    }

    /// `true` for errors raised by the store itself (the family `sanity_check` swallows).
    pub fn is_database(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Integrity { .. })
    }
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
