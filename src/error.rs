//! Error types for canopy.

use crate::persistence::PersistenceError;
use thiserror::Error;

/// Errors that can occur while building, persisting, or querying a forest.
#[derive(Debug, Error)]
pub enum ForestError {
    /// No usable vectors were supplied to the builder.
    #[error("input is empty: no entities with a usable vector")]
    EmptyInput,

    /// A vector's length differs from the forest dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Entity id is not present in the identifier table.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// The same entity id was supplied twice to one build.
    #[error("duplicate entity: {0}")]
    DuplicateEntity(String),

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Serialized artifact is structurally inconsistent.
    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// Writing an artifact or the manifest failed.
    #[error("storage write failed: {0}")]
    StorageWrite(#[source] PersistenceError),

    /// Reading an artifact or the manifest failed.
    #[error("storage read failed: {0}")]
    StorageRead(#[source] PersistenceError),

    /// The namespace has no manifest yet.
    #[error("no forest version has been published")]
    NoPublishedVersion,

    /// The requested version has no artifact.
    #[error("forest version {0} not found")]
    VersionNotFound(u64),
}

impl ForestError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        ForestError::CorruptArtifact(msg.into())
    }

    /// Whether the error was caused by the caller's input.
    ///
    /// Input errors are never worth retrying.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ForestError::EmptyInput
                | ForestError::DimensionMismatch { .. }
                | ForestError::UnknownEntity(_)
                | ForestError::DuplicateEntity(_)
                | ForestError::InvalidParameter(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForestError>;
