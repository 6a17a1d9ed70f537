/*
    errors.rs - Error types for the store subsystem

    Every store operation fails with one of three kinds:
    - InvalidArgument: a required identifier was missing
    - NotFound: the key, its index entry or the entity it points at is absent
    - Internal: I/O, serialization or transaction failure
*/

use std::sync::PoisonError;
use thiserror::Error;

/// Errors that can occur in the store subsystem
#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing or malformed argument, nothing was changed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying storage failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Discriminator for matching on the error class without the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Internal,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn account_not_found(account_id: &str) -> Self {
        StoreError::NotFound(format!("account {} not found", account_id))
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Helper to convert poison errors into StoreError
pub(crate) fn handle_poison<T>(_err: PoisonError<T>) -> StoreError {
    StoreError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Internal(format!("I/O: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Internal(format!("JSON: {}", err))
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Internal(format!("bincode: {}", err))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::NotFound("query returned no rows".to_string())
            }
            other => StoreError::Internal(format!("sqlite: {}", other)),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Internal(format!("connection pool: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("account acc1".to_string());
        assert_eq!(err.to_string(), "Not found: account acc1");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_io_error_is_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_no_rows_is_not_found() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.is_not_found());
    }
}
