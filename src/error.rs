//! Typed errors for the storage engine (spec.md §7).

use thiserror::Error;

/// Every fallible operation in this crate resolves to this error type.
///
/// Variants mirror the taxonomy in spec.md §7: each carries a short,
/// human-readable message plus whatever structured detail the call site
/// has (a driver error, a path, an I/O error).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to open local storage: {message}")]
    StorageOpen {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("local storage operation failed: {message}")]
    StorageOperation {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("schema migration failed: {0}")]
    MigrationFailure(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("operation canceled")]
    Canceled,

    #[error("filesystem error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::StorageOperation {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl StorageError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            message: message.into(),
            source,
        }
    }

    pub fn storage_open(message: impl Into<String>) -> Self {
        StorageError::StorageOpen {
            message: message.into(),
            source: None,
        }
    }
}
