//! # Store
//!
//! Vector storage behind the [`VectorStore`] trait, with a SQLite backend.
//!
//! ## Features
//!
//! - **Typed parameters**: every value binds through [`SqlValue`]; only
//!   validated identifiers are interpolated
//! - **Similarity search**: cosine, inner-product and L2 distances in SQL
//! - **Keyword rank**: a `ts_rank`-style scalar function for hybrid queries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Vector Store                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  VectorStore (trait) ◄── SqliteVectorStore                      │
//! │       │                       │                                 │
//! │       ▼                       ▼                                 │
//! │  SimilarityQuery       vec_distance / keyword_rank              │
//! │  StoredRecord          sift_vector_indexes registry             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod sqlite;
pub mod store;
pub mod value;

pub use error::{Result, StoreError};
pub use sqlite::{INDEX_REGISTRY_TABLE, SqliteVectorStore, keyword_rank};
pub use store::{RECORD_COLUMNS, SimilarityQuery, StoredRecord, VectorStore};
pub use value::{
    MAX_IDENTIFIER_LEN, Metric, Row, SqlValue, decode_vector, encode_vector, validate_column_type,
    validate_identifier,
};
