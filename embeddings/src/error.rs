//! Error types for the embeddings system.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// No provider could be resolved from the given settings.
    #[error("embedding provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// Provider name is neither canonical nor a known alias.
    #[error("unknown embedding provider '{name}' (available: {available})")]
    UnknownProvider { name: String, available: String },

    /// Invalid configuration or input, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Quality metrics need at least two embeddings.
    #[error("need at least 2 embeddings for quality assessment, got {0}")]
    InsufficientEmbeddings(usize),

    /// Checkpoint file could not be written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbeddingError {
    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EmbeddingError::Validation(_)
                | EmbeddingError::ProviderNotConfigured(_)
                | EmbeddingError::UnknownProvider { .. }
        )
    }
}
