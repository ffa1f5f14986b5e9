//! Pluggable token counters.
//!
//! The chunker only needs to know how many tokens a piece of text costs.
//! Two counters are provided: an exact cl100k_base counter backed by
//! `tiktoken-rs`, and a whitespace approximation (one token per word) that
//! needs no model data.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::error::{ChunkingError, Result};

/// Counts text in token units.
pub trait Tokenizer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Split `text` into token pieces.
    fn encode(&self, text: &str) -> Vec<String>;

    /// Number of tokens in `text`.
    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// One token per whitespace-separated word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn name(&self) -> &str {
        "whitespace"
    }

    fn encode(&self, text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Exact OpenAI cl100k_base token counter.
pub struct TiktokenTokenizer {
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    /// Load the cl100k_base encoding.
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().map_err(|e| ChunkingError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn name(&self) -> &str {
        "cl100k_base"
    }

    fn encode(&self, text: &str) -> Vec<String> {
        self.bpe.split_by_token_ordinary(text).unwrap_or_default()
    }

    fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// Which tokenizer a chunker should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    /// Approximate: one token per word.
    Whitespace,
    /// Exact cl100k_base counts.
    #[default]
    Tiktoken,
}

impl TokenizerKind {
    /// Build the tokenizer, failing if its model data cannot be loaded.
    pub fn build(self) -> Result<Arc<dyn Tokenizer>> {
        match self {
            TokenizerKind::Whitespace => Ok(Arc::new(WhitespaceTokenizer)),
            TokenizerKind::Tiktoken => Ok(Arc::new(TiktokenTokenizer::cl100k()?)),
        }
    }

    /// Build the tokenizer, degrading to whitespace counting when the exact
    /// tokenizer is unavailable.
    pub fn build_or_whitespace(self) -> Arc<dyn Tokenizer> {
        match self.build() {
            Ok(tokenizer) => tokenizer,
            Err(e) => {
                warn!("Falling back to whitespace tokenizer: {e}");
                Arc::new(WhitespaceTokenizer)
            }
        }
    }
}
