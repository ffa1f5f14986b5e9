//! # Retrieval
//!
//! Read and write paths of the sift engine over a [`sift_store::VectorStore`].
//!
//! ## Features
//!
//! - **Similarity search**: nearest neighbours with lazy index registration
//! - **Hybrid search**: vector and keyword scores fused in one query
//! - **Push-down filters**: metadata, date, content and length predicates
//!   bound into the search itself
//! - **Conversation context**: window, session and full-history modes
//! - **Query engine**: classification, expansion and routing
//! - **Indexing**: preprocess, chunk, embed and upsert documents
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          QueryEngine                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  QueryClassifier ──► expand_query ──► route                     │
//! │                                         │                       │
//! │           ┌─────────────────────────────┼──────────────┐        │
//! │           ▼                             ▼              ▼        │
//! │  ┌──────────────────┐   ┌──────────────────┐  ┌──────────────┐  │
//! │  │ ContextRetriever │──►│ HybridRetriever  │─►│  Similarity  │  │
//! │  │  (messages)      │   │  + Ranker        │  │  Searcher    │  │
//! │  └──────────────────┘   └──────────────────┘  └──────────────┘  │
//! │           ▲                     ▲                    ▲          │
//! │           └──────── FilterEngine predicates ─────────┘          │
//! └─────────────────────────────────────────────────────────────────┘
//!
//!   DocumentIndexer: TextPreprocessor ─► SentenceChunker ─►
//!                    BatchEmbedder ─► VectorStore::insert_records
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sift_retrieval::{QueryEngine, QueryRequest, RetrievalConfig};
//!
//! let config = RetrievalConfig::load("sift.json")?;
//! let engine = QueryEngine::from_config(store, provider, &config)?;
//! let results = engine
//!     .process_query(&QueryRequest::new("How does tokio schedule tasks?"))
//!     .await;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod hybrid;
pub mod indexer;
pub mod logging;
pub mod query;
pub mod score;
pub mod similarity;

pub use config::{
    ContextMode, ContextRetrieverConfig, FilterEngineConfig, HybridConfig, IndexerConfig,
    QueryEngineConfig, RetrievalConfig, SearchConfig,
};
pub use context::{ContextMessage, ContextRequest, ContextRetriever, HISTORY_SOURCE, context_relevance, expand_query};
pub use error::{Result, RetrievalError};
pub use filter::{
    ContentFilter, DateRange, FilterEngine, FilterSet, FilterTarget, FilterValue, Predicate, QualityFilter,
};
pub use hybrid::{HybridQuery, HybridResult, HybridRetriever, Ranker, SimpleRanker};
pub use indexer::{Document, DocumentIndexer, chunk_id, content_id};
pub use query::{QueryClassifier, QueryEngine, QueryRequest, QueryType, extract_key_terms};
pub use score::{combine_scores, distance_to_similarity, min_max_map, normalize_scores};
pub use similarity::{ScoredResult, SearchHit, SearchRequest, SimilaritySearcher};
