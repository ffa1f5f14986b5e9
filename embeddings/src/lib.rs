//! # Embeddings
//!
//! Embedding providers and the batch pipeline that feeds them.
//!
//! ## Features
//!
//! - **Providers**: OpenAI-compatible HTTP endpoints and an offline hashing embedder
//! - **Registry**: canonical names with aliases, plus a caller-owned provider cache
//! - **Batch embedding**: retry with capped exponential backoff and JSONL checkpoints
//! - **Vector math**: cosine, dot, L2, top-k and quality metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ProviderSettings ──► ProviderRegistry ──► EmbeddingProvider    │
//! │                            │                      │             │
//! │                            ▼                      ▼             │
//! │                      ProviderCache          BatchEmbedder       │
//! │                                                   │             │
//! │                                                   ▼             │
//! │                                         vectors + checkpoint    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod batch;
pub mod cache;
pub mod error;
pub mod provider;
pub mod quality;
pub mod registry;
pub mod similarity;

pub use batch::{BatchEmbedder, BatchEmbedderConfig, CheckpointRecord, backoff_delay};
pub use cache::ProviderCache;
pub use error::{EmbeddingError, Result};
pub use provider::{EmbeddingProvider, HashingProvider, OpenAIProvider};
pub use quality::{QualityAssessor, QualityMetrics};
pub use registry::{ProviderFactory, ProviderRegistry, ProviderSettings, default_dimension};
pub use similarity::{
    SimilarityResult, average, cosine_similarity, cosine_to_unit, dot_product, euclidean_distance,
    find_top_k, normalize,
};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
