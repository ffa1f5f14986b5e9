//! Error types for text preprocessing and chunking.

use thiserror::Error;

/// Result type alias for chunking operations.
pub type Result<T> = std::result::Result<T, ChunkingError>;

/// Errors that can occur while configuring or running the chunker.
#[derive(Error, Debug)]
pub enum ChunkingError {
    /// Configuration rejected before any work was done.
    #[error("invalid chunker config: {0}")]
    InvalidConfig(String),

    /// A user-supplied sentence or bullet pattern failed to compile.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The requested tokenizer could not be loaded.
    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),
}
