//! The vector store interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::value::{Metric, Row, SqlValue, validate_identifier};

/// Column layout used by [`VectorStore::insert_records`] tables.
pub const RECORD_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT PRIMARY KEY"),
    ("doc_id", "TEXT"),
    ("chunk_index", "INTEGER"),
    ("content", "TEXT"),
    ("metadata", "TEXT"),
    ("embedding", "BLOB"),
    ("created_at", "TEXT"),
];

/// A chunk vector with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Unique record id.
    pub id: String,

    /// Embedding vector.
    pub vector: Vec<f32>,

    /// Free-form metadata. Keys matching a table column are also written to
    /// that column.
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Owning document, if any.
    pub doc_id: Option<String>,

    /// Position of the chunk within its document.
    pub chunk_index: Option<usize>,
}

impl StoredRecord {
    /// Create a record with empty metadata.
    pub fn new(id: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            vector,
            metadata: serde_json::Map::new(),
            doc_id: None,
            chunk_index: None,
        }
    }

    /// Attach a metadata field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach the owning document and chunk position.
    pub fn with_document(mut self, doc_id: impl Into<String>, chunk_index: usize) -> Self {
        self.doc_id = Some(doc_id.into());
        self.chunk_index = Some(chunk_index);
        self
    }
}

/// A nearest-neighbour query.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityQuery {
    /// Table to search.
    pub table: String,

    /// Query vector.
    pub vector: Vec<f32>,

    /// Number of rows to return.
    pub k: usize,

    /// Vector column.
    pub column: String,

    /// Distance metric.
    pub metric: Metric,

    /// Column returned as `id`.
    pub id_col: String,

    /// Extra columns to return; empty returns every non-vector column.
    pub meta_cols: Vec<String>,

    /// Optional SQL predicate using `?` placeholders.
    pub where_clause: Option<String>,

    /// Values bound to the predicate placeholders, in order.
    pub where_params: Vec<SqlValue>,
}

impl SimilarityQuery {
    /// Query `table` with defaults: `embedding` column, cosine metric, `id`
    /// id column, every column returned.
    pub fn new(table: impl Into<String>, vector: Vec<f32>, k: usize) -> Self {
        Self {
            table: table.into(),
            vector,
            k,
            column: "embedding".to_string(),
            metric: Metric::Cosine,
            id_col: "id".to_string(),
            meta_cols: Vec::new(),
            where_clause: None,
            where_params: Vec::new(),
        }
    }

    /// Set the vector column.
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Set the metric.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Set the id column.
    pub fn with_id_col(mut self, id_col: impl Into<String>) -> Self {
        self.id_col = id_col.into();
        self
    }

    /// Restrict the returned columns.
    pub fn with_meta_cols<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta_cols = cols.into_iter().map(Into::into).collect();
        self
    }

    /// Add a predicate with bound values.
    pub fn with_where(mut self, clause: impl Into<String>, params: Vec<SqlValue>) -> Self {
        self.where_clause = Some(clause.into());
        self.where_params = params;
        self
    }

    /// Validate every identifier the query interpolates.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.table, "table")?;
        validate_identifier(&self.column, "column")?;
        validate_identifier(&self.id_col, "id column")?;
        for col in &self.meta_cols {
            validate_identifier(col, "metadata column")?;
        }
        if self.vector.is_empty() {
            return Err(StoreError::Validation("query vector is empty".to_string()));
        }
        Ok(())
    }
}

/// Storage backend for vectors and their metadata.
///
/// Identifiers are validated before interpolation; values are always bound
/// as `?` parameters.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Execute a statement, returning the number of rows affected.
    async fn exec_sql(&self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    /// Run a query and return every row.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Nearest rows to `query.vector`, ascending by `distance`. Each row
    /// carries `id`, the requested columns and `distance`.
    async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<Row>>;

    /// Create `name` with the given `(column, type)` pairs if it does not
    /// exist.
    async fn create_table(&self, name: &str, columns: &[(&str, &str)]) -> Result<()>;

    /// Make sure an ANN index for `(table, column, metric)` exists.
    /// Idempotent.
    async fn ensure_vector_index(&self, table: &str, column: &str, metric: Metric) -> Result<()>;

    /// Upsert records into a table laid out like [`RECORD_COLUMNS`].
    /// Returns the number of records written.
    async fn insert_records(&self, table: &str, records: &[StoredRecord]) -> Result<usize>;

    /// Delete every row of `doc_id` and insert `records` as one atomic
    /// write. Returns `(removed, written)`; on error nothing changes.
    async fn replace_document(&self, table: &str, doc_id: &str, records: &[StoredRecord]) -> Result<(usize, usize)>;
}
