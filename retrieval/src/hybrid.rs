//! Hybrid retrieval: vector similarity fused with keyword relevance.
//!
//! The primary path is a single query. Each side contributes its top
//! `candidates_each` rows, the union is min-max normalized per score
//! column and the columns are fused as `vector_weight * vnorm +
//! keyword_weight * tnorm`. A column whose range is below `1e-9` passes
//! through unnormalized.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sift_store::{Row, SqlValue, VectorStore, validate_identifier};
use tracing::{debug, error, warn};

use crate::config::HybridConfig;
use crate::error::Result;
use crate::filter::Predicate;
use crate::score::{FLAT_RANGE, distance_to_similarity, min_max_map};
use crate::similarity::{ScoredResult, SearchRequest, SimilaritySearcher, id_string, row_metadata};

/// One fused result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridResult {
    pub id: String,
    /// Fused score; higher is better.
    pub score: f64,
    /// Normalized vector score.
    pub vec_score: f64,
    /// Normalized keyword score.
    pub text_score: f64,
    pub metadata: Row,
}

impl From<HybridResult> for ScoredResult {
    fn from(result: HybridResult) -> Self {
        Self {
            id: result.id,
            score: result.score,
            metadata: result.metadata,
        }
    }
}

/// Final filtering and ordering of fused results.
pub trait Ranker: Send + Sync {
    fn rank(&self, items: Vec<HybridResult>, query: &str) -> Vec<HybridResult>;
}

/// Keeps results at or above a threshold, highest score first. Equal
/// scores keep their input order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleRanker {
    pub threshold: f64,
}

impl SimpleRanker {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Ranker for SimpleRanker {
    fn rank(&self, items: Vec<HybridResult>, _query: &str) -> Vec<HybridResult> {
        let mut kept: Vec<HybridResult> = items.into_iter().filter(|r| r.score >= self.threshold).collect();
        kept.sort_by_key(|r| Reverse(OrderedFloat(r.score)));
        kept
    }
}

/// A hybrid search request.
#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub table: String,
    pub query_text: String,
    pub k: usize,
    /// Per-side candidates; the retriever default when `None`.
    pub candidates_each: Option<usize>,
    pub where_clause: Option<String>,
    pub where_params: Vec<SqlValue>,
    pub id_col: String,
    /// Returned as `title` when set.
    pub title_col: Option<String>,
    /// Returned as `content`.
    pub content_col: String,
    pub embedding_col: String,
    /// Column ranked for keyword relevance.
    pub text_col: String,
}

impl HybridQuery {
    pub fn new(table: impl Into<String>, query_text: impl Into<String>, k: usize) -> Self {
        Self {
            table: table.into(),
            query_text: query_text.into(),
            k,
            candidates_each: None,
            where_clause: None,
            where_params: Vec::new(),
            id_col: "id".to_string(),
            title_col: None,
            content_col: "content".to_string(),
            embedding_col: "embedding".to_string(),
            text_col: "content".to_string(),
        }
    }

    pub fn with_candidates_each(mut self, candidates_each: usize) -> Self {
        self.candidates_each = Some(candidates_each);
        self
    }

    pub fn with_where(mut self, clause: impl Into<String>, params: Vec<SqlValue>) -> Self {
        self.where_clause = Some(clause.into());
        self.where_params = params;
        self
    }

    pub fn with_predicate(self, predicate: Option<Predicate>) -> Self {
        match predicate {
            Some(p) => self.with_where(p.sql, p.params),
            None => self,
        }
    }

    pub fn with_title_col(mut self, column: impl Into<String>) -> Self {
        self.title_col = Some(column.into());
        self
    }

    /// Use one column for both the returned content and keyword ranking.
    pub fn with_text_col(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        self.content_col = column.clone();
        self.text_col = column;
        self
    }

    pub fn with_embedding_col(mut self, column: impl Into<String>) -> Self {
        self.embedding_col = column.into();
        self
    }

    fn validate(&self) -> Result<()> {
        validate_identifier(&self.table, "table")?;
        validate_identifier(&self.id_col, "id column")?;
        validate_identifier(&self.content_col, "content column")?;
        validate_identifier(&self.embedding_col, "embedding column")?;
        validate_identifier(&self.text_col, "text column")?;
        if let Some(title) = &self.title_col {
            validate_identifier(title, "title column")?;
        }
        Ok(())
    }

    fn and_where(&self) -> String {
        self.where_clause
            .as_deref()
            .map(|w| format!(" AND ({w})"))
            .unwrap_or_default()
    }
}

/// Vector + keyword retrieval with pluggable ranking.
pub struct HybridRetriever {
    searcher: Arc<SimilaritySearcher>,
    config: HybridConfig,
    ranker: Arc<dyn Ranker>,
}

impl HybridRetriever {
    pub fn new(searcher: Arc<SimilaritySearcher>) -> Self {
        Self::with_config(searcher, HybridConfig::default())
    }

    /// Weights that do not sum to one are used as given.
    pub fn with_config(searcher: Arc<SimilaritySearcher>, config: HybridConfig) -> Self {
        if !config.weights_sum_to_one() {
            warn!(
                "vector_weight + keyword_weight = {}, using the weights as given",
                config.vector_weight + config.keyword_weight
            );
        }
        let ranker = Arc::new(SimpleRanker::new(config.threshold));
        Self {
            searcher,
            config,
            ranker,
        }
    }

    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    pub fn searcher(&self) -> &Arc<SimilaritySearcher> {
        &self.searcher
    }

    pub fn set_ranker(&mut self, ranker: Arc<dyn Ranker>) {
        self.ranker = ranker;
    }

    pub fn ranker(&self) -> &Arc<dyn Ranker> {
        &self.ranker
    }

    fn hybrid_sql(&self, query: &HybridQuery) -> String {
        let HybridQuery {
            table,
            id_col: id,
            embedding_col: emb,
            text_col: text,
            content_col: content,
            ..
        } = query;
        let and_where = query.and_where();
        let title = query
            .title_col
            .as_deref()
            .map(|t| format!("d.{t} AS title, "))
            .unwrap_or_default();

        format!(
            "WITH vec AS (
                SELECT t.{id} AS id,
                       1.0 - vec_distance(t.{emb}, ?, ?) AS vscore,
                       NULL AS tscore
                FROM {table} AS t
                WHERE t.{emb} IS NOT NULL{and_where}
                ORDER BY vscore DESC
                LIMIT ?
            ),
            txt AS (
                SELECT t.{id} AS id,
                       NULL AS vscore,
                       keyword_rank(t.{text}, ?) AS tscore
                FROM {table} AS t
                WHERE keyword_rank(t.{text}, ?) > 0{and_where}
                ORDER BY tscore DESC
                LIMIT ?
            ),
            u AS (
                SELECT id,
                       COALESCE(MAX(vscore), 0) AS vscore,
                       COALESCE(MAX(tscore), 0) AS tscore
                FROM (SELECT id, vscore, tscore FROM vec
                      UNION ALL
                      SELECT id, vscore, tscore FROM txt)
                GROUP BY id
            ),
            stats AS (
                SELECT MIN(vscore) AS vmin, MAX(vscore) AS vmax,
                       MIN(tscore) AS tmin, MAX(tscore) AS tmax
                FROM u
            ),
            norm AS (
                SELECT u.id AS id,
                       CASE WHEN (stats.vmax - stats.vmin) > {FLAT_RANGE:e}
                            THEN (u.vscore - stats.vmin) / (stats.vmax - stats.vmin)
                            ELSE u.vscore END AS vnorm,
                       CASE WHEN (stats.tmax - stats.tmin) > {FLAT_RANGE:e}
                            THEN (u.tscore - stats.tmin) / (stats.tmax - stats.tmin)
                            ELSE u.tscore END AS tnorm
                FROM u, stats
            )
            SELECT d.*,
                   {title}d.{content} AS content,
                   norm.id AS id,
                   norm.vnorm AS vec_score,
                   norm.tnorm AS text_score,
                   (? * norm.vnorm + ? * norm.tnorm) AS hybrid_score
            FROM norm
            JOIN {table} AS d ON d.{id} = norm.id
            ORDER BY hybrid_score DESC
            LIMIT ?"
        )
    }

    /// Single-query hybrid search, ranked and truncated to `k`.
    pub async fn hybrid_search(&self, query: &HybridQuery) -> Result<Vec<HybridResult>> {
        query.validate()?;
        let candidates = query.candidates_each.unwrap_or(self.config.candidates_each);
        let metric = self.searcher.config().metric;

        self.searcher.ensure_index(&query.table, &query.embedding_col, metric).await?;
        let vector = self.searcher.embed_query(&query.query_text).await?;

        let mut params = vec![SqlValue::Vector(vector), SqlValue::from(metric.as_str())];
        params.extend(query.where_params.iter().cloned());
        params.push(SqlValue::from(candidates));
        params.push(SqlValue::from(query.query_text.as_str()));
        params.push(SqlValue::from(query.query_text.as_str()));
        params.extend(query.where_params.iter().cloned());
        params.push(SqlValue::from(candidates));
        params.push(SqlValue::from(self.config.vector_weight));
        params.push(SqlValue::from(self.config.keyword_weight));
        params.push(SqlValue::from(query.k));

        let rows = self.searcher.store().query(&self.hybrid_sql(query), &params).await?;
        debug!("Hybrid search on {} fused {} rows", query.table, rows.len());

        let results = rows
            .into_iter()
            .map(|row| {
                let number = |key: &str| row.get(key).and_then(JsonValue::as_f64).unwrap_or(0.0);
                let id = row.get("id").map(id_string).unwrap_or_default();
                let score = number("hybrid_score");
                let vec_score = number("vec_score");
                let text_score = number("text_score");
                let drop = ["id", "hybrid_score", "vec_score", "text_score", query.embedding_col.as_str()];
                HybridResult {
                    id,
                    score,
                    vec_score,
                    text_score,
                    metadata: row_metadata(row, &drop),
                }
            })
            .collect();

        let mut ranked = self.ranker.rank(results, &query.query_text);
        ranked.truncate(query.k);
        Ok(ranked)
    }

    /// Two-step hybrid search: a similarity search and a keyword query run
    /// separately and are fused in memory. Failures yield an empty list.
    pub async fn fallback_hybrid(&self, query: &HybridQuery) -> Vec<HybridResult> {
        match self.try_fallback(query).await {
            Ok(results) => results,
            Err(e) => {
                error!("fallback_hybrid failed: {e}");
                Vec::new()
            }
        }
    }

    async fn try_fallback(&self, query: &HybridQuery) -> Result<Vec<HybridResult>> {
        query.validate()?;
        let candidates = query.candidates_each.unwrap_or(self.config.candidates_each);
        let HybridQuery {
            table,
            id_col: id,
            text_col: text,
            ..
        } = query;

        let mut request = SearchRequest::text(table, &query.query_text, candidates)
            .with_column(&query.embedding_col)
            .with_id_col(id)
            .with_meta_cols([query.content_col.as_str()]);
        if let Some(clause) = &query.where_clause {
            request = request.with_where(clause.clone(), query.where_params.clone());
        }
        let hits = self.searcher.search(&request).await?;

        let keyword_sql = format!(
            "SELECT t.{id} AS id, keyword_rank(t.{text}, ?) AS tscore \
             FROM {table} AS t \
             WHERE keyword_rank(t.{text}, ?) > 0{} \
             ORDER BY tscore DESC \
             LIMIT ?",
            query.and_where()
        );
        let mut params = vec![
            SqlValue::from(query.query_text.as_str()),
            SqlValue::from(query.query_text.as_str()),
        ];
        params.extend(query.where_params.iter().cloned());
        params.push(SqlValue::from(candidates));
        let keyword_rows = self.searcher.store().query(&keyword_sql, &params).await?;

        let mut order: Vec<String> = Vec::new();
        let mut vec_raw = HashMap::new();
        for hit in &hits {
            if vec_raw.insert(hit.id.clone(), distance_to_similarity(hit.distance)).is_none() {
                order.push(hit.id.clone());
            }
        }
        let mut text_raw = HashMap::new();
        for row in &keyword_rows {
            let Some(row_id) = row.get("id").map(id_string) else {
                continue;
            };
            let score = row.get("tscore").and_then(JsonValue::as_f64).unwrap_or(0.0);
            if !vec_raw.contains_key(&row_id) && !text_raw.contains_key(&row_id) {
                order.push(row_id.clone());
            }
            text_raw.insert(row_id, score);
        }
        let vec_norm = min_max_map(&vec_raw);
        let text_norm = min_max_map(&text_raw);

        let metadata = self.fetch_metadata(query, &order).await?;

        let fused = order
            .into_iter()
            .map(|item_id| {
                let vec_score = vec_norm.get(&item_id).copied().unwrap_or(0.0);
                let text_score = text_norm.get(&item_id).copied().unwrap_or(0.0);
                HybridResult {
                    score: self.config.vector_weight * vec_score + self.config.keyword_weight * text_score,
                    vec_score,
                    text_score,
                    metadata: metadata.get(&item_id).cloned().unwrap_or_default(),
                    id: item_id,
                }
            })
            .collect();

        let mut ranked = self.ranker.rank(fused, &query.query_text);
        ranked.truncate(query.k);
        Ok(ranked)
    }

    /// Metadata for every id in one `IN` lookup.
    async fn fetch_metadata(&self, query: &HybridQuery, ids: &[String]) -> Result<HashMap<String, Row>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM {table} WHERE {id} IN ({placeholders})",
            table = query.table,
            id = query.id_col
        );
        let params: Vec<SqlValue> = ids.iter().map(|i| SqlValue::from(i.as_str())).collect();
        let rows = self.searcher.store().query(&sql, &params).await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(row_id) = row.get(&query.id_col).map(id_string) else {
                continue;
            };
            let drop = [query.id_col.as_str(), query.embedding_col.as_str()];
            out.insert(row_id, row_metadata(row, &drop));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sift_embeddings::HashingProvider;
    use sift_store::{RECORD_COLUMNS, SqliteVectorStore, StoredRecord, VectorStore};

    const DIM: usize = 64;

    /// B shares the query's vector, A points the other way but is the only
    /// row containing the query keyword, C is orthogonal-ish noise.
    async fn retriever(config: HybridConfig) -> HybridRetriever {
        let provider = Arc::new(HashingProvider::new(DIM));
        let query_vector = provider.embed_text("zebra");
        let opposite: Vec<f32> = query_vector.iter().map(|x| -x).collect();

        let store = Arc::new(SqliteVectorStore::open_in_memory().unwrap());
        store.create_table("docs", RECORD_COLUMNS).await.unwrap();
        store
            .insert_records(
                "docs",
                &[
                    StoredRecord::new("A", opposite).with_field("content", "the zebra crossing"),
                    StoredRecord::new("B", query_vector).with_field("content", "striped animals"),
                    StoredRecord::new("C", provider.embed_text("unrelated words here"))
                        .with_field("content", "unrelated words here"),
                ],
            )
            .await
            .unwrap();

        let searcher = Arc::new(SimilaritySearcher::new(store, provider));
        HybridRetriever::with_config(searcher, config)
    }

    fn by_id(results: &[HybridResult]) -> HashMap<&str, &HybridResult> {
        results.iter().map(|r| (r.id.as_str(), r)).collect()
    }

    #[tokio::test]
    async fn test_keyword_only_and_vector_only_rows_both_surface() {
        let retriever = retriever(HybridConfig::default()).await;

        let results = retriever.hybrid_search(&HybridQuery::new("docs", "zebra", 3)).await.unwrap();
        let map = by_id(&results);

        let a = map["A"];
        assert!((a.text_score - 1.0).abs() < 1e-9);
        assert!(a.vec_score.abs() < 1e-9);
        assert!((a.score - 0.4).abs() < 1e-6);

        let b = map["B"];
        assert!((b.vec_score - 1.0).abs() < 1e-6);
        assert!(b.text_score.abs() < 1e-9);
        assert!((b.score - 0.6).abs() < 1e-6);

        assert_eq!(results[0].id, "B");
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(a.metadata["content"], json!("the zebra crossing"));
        assert!(!a.metadata.contains_key("embedding"));
    }

    #[tokio::test]
    async fn test_scores_stay_in_unit_range() {
        let retriever = retriever(HybridConfig::default()).await;
        let results = retriever.hybrid_search(&HybridQuery::new("docs", "zebra words", 3)).await.unwrap();
        for r in &results {
            assert!((0.0..=1.0 + 1e-9).contains(&r.score), "{}: {}", r.id, r.score);
        }
    }

    #[tokio::test]
    async fn test_unbalanced_weights_are_used_as_given() {
        let retriever = retriever(HybridConfig::default().with_weights(1.0, 1.0)).await;
        let results = retriever.hybrid_search(&HybridQuery::new("docs", "zebra", 3)).await.unwrap();
        let map = by_id(&results);
        assert!((map["A"].score - 1.0).abs() < 1e-6);
        assert!((map["B"].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_where_clause_applies_to_both_sides() {
        let retriever = retriever(HybridConfig::default()).await;
        let query = HybridQuery::new("docs", "zebra", 3).with_where("t.id <> ?", vec![SqlValue::from("A")]);
        let results = retriever.hybrid_search(&query).await.unwrap();
        assert!(results.iter().all(|r| r.id != "A"));
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn test_ranker_threshold_and_swap() {
        let mut retriever = retriever(HybridConfig::default()).await;
        retriever.set_ranker(Arc::new(SimpleRanker::new(0.5)));
        let results = retriever.hybrid_search(&HybridQuery::new("docs", "zebra", 3)).await.unwrap();
        assert!(results.iter().all(|r| r.score >= 0.5));
        assert_eq!(results[0].id, "B");
    }

    #[test]
    fn test_simple_ranker_is_stable() {
        let item = |id: &str, score: f64| HybridResult {
            id: id.to_string(),
            score,
            vec_score: 0.0,
            text_score: 0.0,
            metadata: Row::new(),
        };
        let ranked = SimpleRanker::new(0.1).rank(
            vec![item("x", 0.5), item("y", 0.9), item("z", 0.5), item("w", 0.05)],
            "q",
        );
        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["y", "x", "z"]);
    }

    #[tokio::test]
    async fn test_fallback_matches_primary_ordering() {
        let retriever = retriever(HybridConfig::default()).await;
        let results = retriever.fallback_hybrid(&HybridQuery::new("docs", "zebra", 3)).await;
        let map = by_id(&results);

        // Only A matches the keyword, so its flat text score passes through raw.
        assert!(map["A"].text_score > 0.0);
        assert!(map["A"].vec_score.abs() < 1e-9);
        assert!((map["B"].vec_score - 1.0).abs() < 1e-6);
        assert!(map["B"].text_score.abs() < 1e-9);
        assert_eq!(results[0].id, "B");
        assert_eq!(map["A"].metadata["content"], json!("the zebra crossing"));
    }

    #[tokio::test]
    async fn test_errors() {
        let retriever = retriever(HybridConfig::default()).await;
        let bad = HybridQuery::new("docs; DROP TABLE docs", "zebra", 3);
        assert!(retriever.hybrid_search(&bad).await.unwrap_err().is_validation());
        assert!(retriever.fallback_hybrid(&bad).await.is_empty());
        assert!(retriever.fallback_hybrid(&HybridQuery::new("missing", "zebra", 3)).await.is_empty());
        assert!(retriever.hybrid_search(&HybridQuery::new("missing", "zebra", 3)).await.is_err());
    }
}
