//! Error types for the retrieval layer.

use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors that can occur while indexing or retrieving.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Chunking error.
    #[error("chunking error: {0}")]
    Chunking(#[from] sift_chunking::ChunkingError),

    /// Embedding error.
    #[error("embedding error: {0}")]
    Embedding(#[from] sift_embeddings::EmbeddingError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] sift_store::StoreError),

    /// Invalid request or configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError {
    /// Whether the error was caused by the caller's input rather than a
    /// backend failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RetrievalError::Validation(_)
                | RetrievalError::Store(sift_store::StoreError::InvalidIdentifier { .. })
                | RetrievalError::Store(sift_store::StoreError::Validation(_))
                | RetrievalError::Embedding(sift_embeddings::EmbeddingError::Validation(_))
                | RetrievalError::Chunking(sift_chunking::ChunkingError::InvalidConfig(_))
                | RetrievalError::Chunking(sift_chunking::ChunkingError::InvalidPattern { .. })
        )
    }
}
