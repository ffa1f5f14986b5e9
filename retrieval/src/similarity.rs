//! Nearest-neighbour search over a [`VectorStore`] table.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sift_embeddings::EmbeddingProvider;
use sift_store::{Metric, Row, SimilarityQuery, SqlValue, VectorStore, validate_identifier};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::SearchConfig;
use crate::error::{Result, RetrievalError};
use crate::filter::Predicate;
use crate::score::distance_to_similarity;

/// A similarity search request. Exactly one of `query` or `query_vector`
/// must be supplied; a vector wins when both are.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub table: String,
    pub k: usize,
    pub query: Option<String>,
    pub query_vector: Option<Vec<f32>>,
    /// Vector column; the searcher default when `None`.
    pub column: Option<String>,
    /// Metric; the searcher default when `None`.
    pub metric: Option<Metric>,
    pub where_clause: Option<String>,
    pub where_params: Vec<SqlValue>,
    /// Id column; the searcher default when `None`.
    pub id_col: Option<String>,
    /// Columns returned as metadata; every non-vector column when empty.
    pub meta_cols: Vec<String>,
}

impl SearchRequest {
    /// Search `table` with a text query.
    pub fn text(table: impl Into<String>, query: impl Into<String>, k: usize) -> Self {
        Self {
            table: table.into(),
            k,
            query: Some(query.into()),
            ..Self::default()
        }
    }

    /// Search `table` with a precomputed vector.
    pub fn vector(table: impl Into<String>, vector: Vec<f32>, k: usize) -> Self {
        Self {
            table: table.into(),
            k,
            query_vector: Some(vector),
            ..Self::default()
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_id_col(mut self, id_col: impl Into<String>) -> Self {
        self.id_col = Some(id_col.into());
        self
    }

    pub fn with_meta_cols<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta_cols = cols.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict matches with a raw predicate using `?` placeholders.
    pub fn with_where(mut self, clause: impl Into<String>, params: Vec<SqlValue>) -> Self {
        self.where_clause = Some(clause.into());
        self.where_params = params;
        self
    }

    /// Restrict matches with a filter predicate.
    pub fn with_predicate(self, predicate: Option<Predicate>) -> Self {
        match predicate {
            Some(p) => self.with_where(p.sql, p.params),
            None => self,
        }
    }
}

/// One nearest neighbour, closest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    /// Metric distance; smaller is closer.
    pub distance: f64,
    pub metadata: Row,
}

/// A result scored so that higher is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub id: String,
    pub score: f64,
    pub metadata: Row,
}

impl From<SearchHit> for ScoredResult {
    fn from(hit: SearchHit) -> Self {
        Self {
            id: hit.id,
            score: distance_to_similarity(hit.distance),
            metadata: hit.metadata,
        }
    }
}

/// Render an id cell as a string.
pub(crate) fn id_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn a result row into metadata: drop the bookkeeping columns and lift
/// the fields of a JSON `metadata` column to the top level. Real columns
/// win over lifted fields.
pub(crate) fn row_metadata(mut row: Row, drop: &[&str]) -> Row {
    for key in drop {
        row.remove(*key);
    }
    if let Some(JsonValue::String(raw)) = row.get("metadata")
        && let Ok(JsonValue::Object(fields)) = serde_json::from_str::<JsonValue>(raw)
    {
        row.remove("metadata");
        for (key, value) in fields {
            row.entry(key).or_insert(value);
        }
    }
    row
}

/// Vector search with lazy index creation and query embedding.
pub struct SimilaritySearcher {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: SearchConfig,
    ensured: Mutex<HashSet<(String, String, Metric)>>,
}

impl SimilaritySearcher {
    /// Create a searcher with default settings.
    pub fn new(store: Arc<dyn VectorStore>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_config(store, provider, SearchConfig::default())
    }

    /// Create a searcher with explicit settings.
    pub fn with_config(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Embed a query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.provider.embed_query(text).await?)
    }

    /// Create the index for `(table, column, metric)` once per searcher.
    pub async fn ensure_index(&self, table: &str, column: &str, metric: Metric) -> Result<()> {
        let key = (table.to_string(), column.to_string(), metric);
        if self.ensured.lock().await.contains(&key) {
            return Ok(());
        }
        self.store.ensure_vector_index(table, column, metric).await?;
        self.ensured.lock().await.insert(key);
        Ok(())
    }

    /// Top-`k` rows by ascending distance.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let column = request.column.as_deref().unwrap_or(&self.config.column);
        let id_col = request.id_col.as_deref().unwrap_or(&self.config.id_col);
        let metric = request.metric.unwrap_or(self.config.metric);

        validate_identifier(&request.table, "table")?;
        validate_identifier(column, "column")?;
        validate_identifier(id_col, "id column")?;
        for col in &request.meta_cols {
            validate_identifier(col, "metadata column")?;
        }

        let vector = match (&request.query_vector, request.query.as_deref()) {
            (Some(v), _) => v.clone(),
            (None, Some(q)) if !q.trim().is_empty() => self.embed_query(q).await?,
            _ => {
                return Err(RetrievalError::Validation(
                    "provide either query text or query_vector".to_string(),
                ));
            }
        };

        self.ensure_index(&request.table, column, metric).await?;

        let mut query = SimilarityQuery::new(&request.table, vector, request.k)
            .with_column(column)
            .with_metric(metric)
            .with_id_col(id_col)
            .with_meta_cols(request.meta_cols.iter().cloned());
        if let Some(clause) = &request.where_clause {
            query = query.with_where(clause.clone(), request.where_params.clone());
        }

        let rows = self.store.similarity_search(&query).await?;
        debug!("Similarity search on {} returned {} rows", request.table, rows.len());

        Ok(rows
            .into_iter()
            .map(|row| {
                let id = row.get("id").map(id_string).unwrap_or_default();
                let distance = row.get("distance").and_then(JsonValue::as_f64).unwrap_or(f64::INFINITY);
                SearchHit {
                    id,
                    distance,
                    metadata: row_metadata(row, &["id", "distance"]),
                }
            })
            .collect())
    }

    /// Like [`search`](Self::search) with `score = 1 / (1 + distance)`.
    pub async fn search_scored(&self, request: &SearchRequest) -> Result<Vec<ScoredResult>> {
        let hits = self.search(request).await?;
        Ok(hits.into_iter().map(ScoredResult::from).collect())
    }

    /// Text query with default columns.
    pub async fn search_by_text(&self, table: &str, query: &str, k: usize) -> Result<Vec<ScoredResult>> {
        self.search_scored(&SearchRequest::text(table, query, k)).await
    }

    /// Vector query with default columns.
    pub async fn search_by_vector(&self, table: &str, vector: Vec<f32>, k: usize) -> Result<Vec<ScoredResult>> {
        self.search_scored(&SearchRequest::vector(table, vector, k)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sift_embeddings::HashingProvider;
    use sift_store::{RECORD_COLUMNS, SqliteVectorStore, StoredRecord};

    async fn searcher() -> SimilaritySearcher {
        let provider = Arc::new(HashingProvider::new(64));
        let store = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
        store.create_table("docs", RECORD_COLUMNS).await.unwrap();

        let texts = ["rust borrow checker", "python garbage collector", "rust async runtime"];
        let records: Vec<StoredRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                StoredRecord::new(format!("d{i}"), provider.embed_text(text))
                    .with_field("content", *text)
                    .with_field("lang", if text.starts_with("rust") { "rust" } else { "python" })
            })
            .collect();
        store.insert_records("docs", &records).await.unwrap();

        SimilaritySearcher::new(store, provider)
    }

    #[tokio::test]
    async fn test_search_by_text_ranks_exact_match_first() {
        let searcher = searcher().await;

        let results = searcher.search_by_text("docs", "python garbage collector", 2).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "d1");
        assert!((results[0].score - 1.0).abs() < 1e-5);
        assert!(results[0].score >= results[1].score);
        assert_eq!(results[0].metadata["content"], json!("python garbage collector"));
        assert_eq!(results[0].metadata["lang"], json!("python"));
        assert!(!results[0].metadata.contains_key("embedding"));
    }

    #[tokio::test]
    async fn test_search_ascending_with_where() {
        let searcher = searcher().await;
        let request = SearchRequest::text("docs", "rust", 5)
            .with_where("content LIKE ?", vec![SqlValue::from("rust%")])
            .with_meta_cols(["content"]);

        let hits = searcher.search(&request).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert!(hits[0].distance <= hits[1].distance);
        assert!(hits.iter().all(|h| h.id != "d1"));
    }

    #[tokio::test]
    async fn test_search_requires_query_or_vector() {
        let searcher = searcher().await;
        let request = SearchRequest {
            table: "docs".to_string(),
            k: 3,
            ..SearchRequest::default()
        };
        assert!(matches!(searcher.search(&request).await, Err(RetrievalError::Validation(_))));
        let blank = SearchRequest::text("docs", "   ", 3);
        assert!(searcher.search(&blank).await.is_err());
    }

    #[tokio::test]
    async fn test_search_rejects_bad_identifiers() {
        let searcher = searcher().await;
        let request = SearchRequest::text("docs;DROP TABLE docs", "rust", 3);
        let err = searcher.search(&request).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_index_is_ensured_once_per_metric() {
        let store = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
        store.create_table("docs", RECORD_COLUMNS).await.unwrap();
        let searcher = SimilaritySearcher::new(store.clone(), Arc::new(HashingProvider::new(8)));

        searcher.search_by_vector("docs", vec![1.0; 8], 1).await.unwrap();
        searcher.search_by_vector("docs", vec![1.0; 8], 1).await.unwrap();
        searcher
            .search(&SearchRequest::vector("docs", vec![1.0; 8], 1).with_metric(Metric::L2))
            .await
            .unwrap();

        let indexes = store.vector_indexes().await.unwrap();
        assert_eq!(indexes.len(), 2);
    }

    #[test]
    fn test_row_metadata_lifts_json_fields() {
        let mut row = Row::new();
        row.insert("id".to_string(), json!("x"));
        row.insert("content".to_string(), json!("column wins"));
        row.insert(
            "metadata".to_string(),
            json!(r#"{"content": "lifted", "source": "pdf"}"#),
        );

        let meta = row_metadata(row, &["id"]);
        assert_eq!(meta["content"], json!("column wins"));
        assert_eq!(meta["source"], json!("pdf"));
        assert!(!meta.contains_key("metadata"));
        assert!(!meta.contains_key("id"));
    }
}
