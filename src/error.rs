//! Error kinds surfaced by the stores and the engines built on them.
//!
//! Every variant names the operation that failed so callers can log a
//! failure without inspecting a backtrace. Nothing here is retried
//! internally; retry policy belongs to the caller.

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown record or blob id, or a sweep with nothing to remove.
    #[error("{op}: {what} {id} not found")]
    NotFound {
        op: &'static str,
        what: &'static str,
        id: String,
    },

    /// Malformed identifier or argument.
    #[error("{op}: invalid argument: {message}")]
    InvalidArgument { op: &'static str, message: String },

    /// Stream read/write failure against the blob medium.
    #[error("{op}: I/O error on {id}: {source}")]
    Io {
        op: &'static str,
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// Backend unavailable or write rejected.
    #[error("{op}: storage error on {id}: {source}")]
    Storage {
        op: &'static str,
        id: String,
        #[source]
        source: BoxError,
    },

    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },
}

/// Coarse classification of [`StoreError`], handy for matching in callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Io,
    Storage,
    Cancelled,
}

impl StoreError {
    pub fn not_found(op: &'static str, what: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            op,
            what,
            id: id.into(),
        }
    }

    pub fn invalid(op: &'static str, message: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            op,
            message: message.into(),
        }
    }

    pub fn io(op: &'static str, id: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            op,
            id: id.into(),
            source,
        }
    }

    pub fn storage(
        op: &'static str,
        id: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        StoreError::Storage {
            op,
            id: id.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::Storage { .. } => ErrorKind::Storage,
            StoreError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Name of the operation that produced this error.
    pub fn op(&self) -> &'static str {
        match self {
            StoreError::NotFound { op, .. }
            | StoreError::InvalidArgument { op, .. }
            | StoreError::Io { op, .. }
            | StoreError::Storage { op, .. }
            | StoreError::Cancelled { op } => op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_operation_and_id() {
        let err = StoreError::not_found("find_by_id", "record", "0123456789abcdef01234567");
        assert_eq!(
            err.to_string(),
            "find_by_id: record 0123456789abcdef01234567 not found"
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.op(), "find_by_id");
    }

    #[test]
    fn test_storage_accepts_plain_messages() {
        let err = StoreError::storage("insert", "connection", "lock poisoned");
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(
            err.to_string(),
            "insert: storage error on connection: lock poisoned"
        );
    }
}
