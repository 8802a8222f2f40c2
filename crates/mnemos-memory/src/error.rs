//! Error taxonomy shared by every memory component.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can arise from store, index, and retrieval operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Record already exists: {0}")]
    DuplicateId(Uuid),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid query parameters: {0}")]
    InvalidThreshold(String),
    #[error("Importance score must be within [0, 1], got {0}")]
    InvalidImportance(f32),
    #[error("Record content must not be empty")]
    EmptyContent,
    #[error("Similarity index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    pub(crate) fn dimension(expected: usize, actual: usize) -> Self {
        MemoryError::DimensionMismatch { expected, actual }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
