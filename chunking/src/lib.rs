//! # Chunking
//!
//! Turns raw extracted text into token-bounded, overlapping chunks ready
//! for embedding.
//!
//! ## Features
//!
//! - **Preprocessing**: unicode, whitespace, hyphenation and header/footer cleanup
//! - **Sentence chunking**: greedy packing under a token budget with overlap
//! - **Pluggable tokenizers**: exact cl100k_base counts or a word approximation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Chunking Pipeline                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  raw text ──► TextPreprocessor ──► SentenceChunker ──► Chunk[]  │
//! │                                          │                      │
//! │                                          ▼                      │
//! │                               Tokenizer (tiktoken/words)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod chunker;
pub mod error;
pub mod preprocessor;
pub mod tokenizer;

pub use chunker::{
    Chunk, DEFAULT_BULLET_LINE, DEFAULT_SENTENCE_SPLIT, SentenceChunker, SentenceChunkerConfig,
};
pub use error::{ChunkingError, Result};
pub use preprocessor::{TextPreprocessor, TextPreprocessorConfig};
pub use tokenizer::{TiktokenTokenizer, Tokenizer, TokenizerKind, WhitespaceTokenizer};
