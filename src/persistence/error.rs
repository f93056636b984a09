//! Error types for persistence operations.

use thiserror::Error;

/// Errors raised by blob storage backends.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// I/O error (file operations, disk I/O)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found (blob, manifest)
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Key is not a valid relative blob path
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error (manifest JSON)
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(format!("json error: {}", e))
    }
}

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;
