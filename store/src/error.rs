//! Error types for the vector store.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in the vector store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A table, column or metric name failed validation.
    #[error("invalid {what} identifier: {value:?}")]
    InvalidIdentifier { what: String, value: String },

    /// Unsupported distance metric.
    #[error("unknown metric '{0}' (expected cosine, ip or l2)")]
    UnknownMetric(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Stored vector bytes are not a whole number of f32 values.
    #[error("corrupt vector blob of {0} bytes")]
    CorruptVector(usize),

    /// Vector math failed (dimension mismatch).
    #[error("vector error: {0}")]
    Vector(#[from] sift_embeddings::EmbeddingError),

    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
