//! Push-down filtering.
//!
//! Every filter category compiles to a [`Predicate`]: SQL text built only
//! from validated identifiers, plus the bound values. A predicate either
//! restricts a plain `SELECT` or rides along as the `where` clause of a
//! similarity search, so filtering and vector search run as one query.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sift_embeddings::{EmbeddingProvider, cosine_similarity, cosine_to_unit};
use sift_store::{Metric, Row, SimilarityQuery, SqlValue, VectorStore, validate_identifier};
use tracing::{debug, error};

use crate::config::FilterEngineConfig;
use crate::error::{Result, RetrievalError};
use crate::similarity::ScoredResult;

/// A SQL boolean expression with its bound values, in placeholder order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Predicate {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// AND the predicates together; `None` when there are none.
    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Option<Predicate> {
        let mut parts = Vec::new();
        let mut params = Vec::new();
        for p in predicates {
            parts.push(format!("({})", p.sql));
            params.extend(p.params);
        }
        if parts.is_empty() {
            None
        } else {
            Some(Predicate::new(parts.join(" AND "), params))
        }
    }
}

/// Condition on one metadata field.
///
/// In JSON: `{"min": a, "max": b}` is a range, an object with any of
/// `gt`/`gte`/`lt`/`lte` is a comparison, an array is a membership test and
/// anything else is an exact match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum FilterValue {
    Exact(JsonValue),
    Range {
        min: JsonValue,
        max: JsonValue,
    },
    Compare {
        gt: Option<JsonValue>,
        gte: Option<JsonValue>,
        lt: Option<JsonValue>,
        lte: Option<JsonValue>,
    },
    In(Vec<JsonValue>),
}

impl From<JsonValue> for FilterValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => FilterValue::In(items),
            JsonValue::Object(mut map) => {
                if map.contains_key("min") && map.contains_key("max") {
                    FilterValue::Range {
                        min: map.remove("min").unwrap_or_default(),
                        max: map.remove("max").unwrap_or_default(),
                    }
                } else if ["gt", "gte", "lt", "lte"].iter().any(|k| map.contains_key(*k)) {
                    FilterValue::Compare {
                        gt: map.remove("gt"),
                        gte: map.remove("gte"),
                        lt: map.remove("lt"),
                        lte: map.remove("lte"),
                    }
                } else {
                    FilterValue::Exact(JsonValue::Object(map))
                }
            }
            other => FilterValue::Exact(other),
        }
    }
}

impl From<FilterValue> for JsonValue {
    fn from(value: FilterValue) -> Self {
        match value {
            FilterValue::Exact(v) => v,
            FilterValue::Range { min, max } => serde_json::json!({ "min": min, "max": max }),
            FilterValue::Compare { gt, gte, lt, lte } => {
                let mut map = serde_json::Map::new();
                for (key, bound) in [("gt", gt), ("gte", gte), ("lt", lt), ("lte", lte)] {
                    if let Some(bound) = bound {
                        map.insert(key.to_string(), bound);
                    }
                }
                JsonValue::Object(map)
            }
            FilterValue::In(items) => JsonValue::Array(items),
        }
    }
}

/// Inclusive date bounds on a timestamp field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default = "default_date_field")]
    pub field: String,
}

fn default_date_field() -> String {
    "created_at".to_string()
}

fn default_text_field() -> String {
    "content".to_string()
}

impl DateRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start,
            end,
            field: default_date_field(),
        }
    }
}

/// Keyword include/exclude lists on a text field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilter {
    /// Every keyword must occur.
    pub include: Vec<String>,
    /// No keyword may occur.
    pub exclude: Vec<String>,
    pub case_sensitive: bool,
    /// Text field; `content` when empty.
    pub field: String,
}

impl ContentFilter {
    pub fn including<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: keywords.into_iter().map(Into::into).collect(),
            field: default_text_field(),
            ..Self::default()
        }
    }

    pub fn excluding<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}

/// Length bounds on a text field, in characters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityFilter {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    /// Text field; `content` when empty.
    pub field: String,
}

/// Every active filter category; categories are ANDed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSet {
    pub metadata: BTreeMap<String, FilterValue>,
    pub date_range: Option<DateRange>,
    pub content: Option<ContentFilter>,
    pub quality: Option<QualityFilter>,
}

impl FilterSet {
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.metadata.insert(field.into(), value.into());
        self
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_content(mut self, content: ContentFilter) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_quality(mut self, quality: QualityFilter) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
            && self.date_range.is_none()
            && self.content.is_none()
            && self.quality.is_none()
    }
}

/// Where filtered rows come from.
#[derive(Debug, Clone)]
pub struct FilterTarget {
    pub table: String,
    /// When set, rows are the nearest neighbours of this vector.
    pub query_vector: Option<Vec<f32>>,
    /// Row limit; the engine default when `None`.
    pub limit: Option<usize>,
    pub column: String,
    pub metric: Metric,
    pub id_col: String,
}

impl FilterTarget {
    /// Plain filtered query over `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            query_vector: None,
            limit: None,
            column: "embedding".to_string(),
            metric: Metric::Cosine,
            id_col: "id".to_string(),
        }
    }

    /// Filtered nearest-neighbour search.
    pub fn nearest(table: impl Into<String>, vector: Vec<f32>, k: usize) -> Self {
        Self {
            query_vector: Some(vector),
            limit: Some(k),
            ..Self::table(table)
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

fn text_field(field: &str) -> &str {
    if field.is_empty() { "content" } else { field }
}

fn escape_like(keyword: &str) -> String {
    let mut out = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Builds predicates and runs filtered queries.
pub struct FilterEngine {
    store: Arc<dyn VectorStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    config: FilterEngineConfig,
}

impl FilterEngine {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self::with_config(store, FilterEngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn VectorStore>, config: FilterEngineConfig) -> Self {
        Self {
            store,
            provider: None,
            config,
        }
    }

    /// Provider used by [`semantic_filter`](Self::semantic_filter).
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &FilterEngineConfig {
        &self.config
    }

    /// SQL expression reading `field`, and the values it binds.
    fn field_expr(&self, field: &str) -> Result<(String, Vec<SqlValue>)> {
        validate_identifier(field, "filter field")?;
        match &self.config.metadata_column {
            Some(column) => {
                validate_identifier(column, "metadata column")?;
                Ok((
                    format!("json_extract({column}, ?)"),
                    vec![SqlValue::from(format!("$.{field}"))],
                ))
            }
            None => Ok((field.to_string(), Vec::new())),
        }
    }

    /// `expr <op> ?` with the expression's own values first.
    fn compare(&self, field: &str, op: &str, value: SqlValue) -> Result<Predicate> {
        let (expr, mut params) = self.field_expr(field)?;
        params.push(value);
        Ok(Predicate::new(format!("{expr} {op} ?"), params))
    }

    /// Predicate for metadata conditions.
    pub fn metadata_predicate(&self, filters: &BTreeMap<String, FilterValue>) -> Result<Option<Predicate>> {
        let mut parts = Vec::new();
        for (field, value) in filters {
            match value {
                FilterValue::Exact(JsonValue::Null) => {
                    let (expr, params) = self.field_expr(field)?;
                    parts.push(Predicate::new(format!("{expr} IS NULL"), params));
                }
                FilterValue::Exact(v) => parts.push(self.compare(field, "=", SqlValue::from(v))?),
                FilterValue::Range { min, max } => {
                    let (expr, mut params) = self.field_expr(field)?;
                    params.push(SqlValue::from(min));
                    params.push(SqlValue::from(max));
                    parts.push(Predicate::new(format!("{expr} BETWEEN ? AND ?"), params));
                }
                FilterValue::Compare { gt, gte, lt, lte } => {
                    let bounds = [(">", gt), (">=", gte), ("<", lt), ("<=", lte)];
                    let mut any = false;
                    for (op, bound) in bounds {
                        if let Some(bound) = bound {
                            parts.push(self.compare(field, op, SqlValue::from(bound))?);
                            any = true;
                        }
                    }
                    if !any {
                        return Err(RetrievalError::Validation(format!(
                            "comparison filter on {field} has no bounds"
                        )));
                    }
                }
                FilterValue::In(items) => {
                    let (expr, mut params) = self.field_expr(field)?;
                    if items.is_empty() {
                        // Nothing can be a member of the empty set.
                        parts.push(Predicate::new("0 = 1", Vec::new()));
                        continue;
                    }
                    let placeholders = vec!["?"; items.len()].join(", ");
                    params.extend(items.iter().map(SqlValue::from));
                    parts.push(Predicate::new(format!("{expr} IN ({placeholders})"), params));
                }
            }
        }
        Ok(Predicate::all(parts))
    }

    /// Predicate for inclusive date bounds. Timestamps are compared through
    /// SQLite's `datetime()` so offsets and separators are normalized.
    pub fn date_predicate(&self, range: &DateRange) -> Result<Option<Predicate>> {
        let mut parts = Vec::new();
        for (op, bound) in [(">=", range.start), ("<=", range.end)] {
            if let Some(bound) = bound {
                let (expr, mut params) = self.field_expr(&range.field)?;
                params.push(SqlValue::from(bound.to_rfc3339()));
                parts.push(Predicate::new(format!("datetime({expr}) {op} datetime(?)"), params));
            }
        }
        Ok(Predicate::all(parts))
    }

    /// Predicate for keyword inclusion and exclusion. Case-insensitive
    /// matching uses `LOWER(..) LIKE`; case-sensitive matching uses `instr`
    /// because SQLite's `LIKE` ignores ASCII case.
    pub fn content_predicate(&self, content: &ContentFilter) -> Result<Option<Predicate>> {
        let field = text_field(&content.field);
        let mut parts = Vec::new();
        let keywords = content
            .include
            .iter()
            .map(|k| (k, true))
            .chain(content.exclude.iter().map(|k| (k, false)));

        for (keyword, include) in keywords {
            let (expr, mut params) = self.field_expr(field)?;
            let sql = if content.case_sensitive {
                params.push(SqlValue::from(keyword.as_str()));
                let op = if include { ">" } else { "=" };
                format!("instr({expr}, ?) {op} 0")
            } else {
                params.push(SqlValue::from(format!("%{}%", escape_like(&keyword.to_lowercase()))));
                let op = if include { "LIKE" } else { "NOT LIKE" };
                format!("LOWER({expr}) {op} ? ESCAPE '\\'")
            };
            parts.push(Predicate::new(sql, params));
        }
        Ok(Predicate::all(parts))
    }

    /// Predicate bounding the character length of a text field.
    pub fn quality_predicate(&self, quality: &QualityFilter) -> Result<Option<Predicate>> {
        let field = text_field(&quality.field);
        let mut parts = Vec::new();
        for (op, bound) in [(">=", quality.min_length), ("<=", quality.max_length)] {
            if let Some(bound) = bound {
                let (expr, mut params) = self.field_expr(field)?;
                params.push(SqlValue::from(bound));
                parts.push(Predicate::new(format!("length({expr}) {op} ?"), params));
            }
        }
        Ok(Predicate::all(parts))
    }

    /// Predicate ANDing every active category of `filters`.
    pub fn predicate(&self, filters: &FilterSet) -> Result<Option<Predicate>> {
        let mut parts = Vec::new();
        parts.extend(self.metadata_predicate(&filters.metadata)?);
        if let Some(range) = &filters.date_range {
            parts.extend(self.date_predicate(range)?);
        }
        if let Some(content) = &filters.content {
            parts.extend(self.content_predicate(content)?);
        }
        if let Some(quality) = &filters.quality {
            parts.extend(self.quality_predicate(quality)?);
        }
        Ok(Predicate::all(parts))
    }

    /// Run `predicate` against the target: as the `where` of a similarity
    /// search when the target has a vector, otherwise as a plain query.
    pub async fn fetch(&self, target: &FilterTarget, predicate: Option<Predicate>) -> Result<Vec<Row>> {
        validate_identifier(&target.table, "table")?;
        let limit = target.limit.unwrap_or(self.config.default_limit);

        let mut rows = match &target.query_vector {
            Some(vector) => {
                let mut query = SimilarityQuery::new(&target.table, vector.clone(), limit)
                    .with_column(&target.column)
                    .with_metric(target.metric)
                    .with_id_col(&target.id_col);
                if let Some(p) = predicate {
                    query = query.with_where(p.sql, p.params);
                }
                self.store.similarity_search(&query).await?
            }
            None => {
                let (clause, mut params) = match predicate {
                    Some(p) => (format!(" WHERE {}", p.sql), p.params),
                    None => (String::new(), Vec::new()),
                };
                params.push(SqlValue::from(limit));
                let sql = format!("SELECT * FROM {}{clause} LIMIT ?", target.table);
                self.store.query(&sql, &params).await?
            }
        };

        for row in &mut rows {
            row.remove(&target.column);
        }
        debug!("Filter on {} returned {} rows", target.table, rows.len());
        Ok(rows)
    }

    async fn fetch_or_empty(&self, target: &FilterTarget, predicate: Result<Option<Predicate>>) -> Vec<Row> {
        let result = match predicate {
            Ok(predicate) => self.fetch(target, predicate).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            error!("Filtering {} failed: {e}", target.table);
            Vec::new()
        })
    }

    /// Rows whose metadata satisfy every condition.
    pub async fn filter_by_metadata(
        &self,
        target: &FilterTarget,
        filters: &BTreeMap<String, FilterValue>,
    ) -> Vec<Row> {
        self.fetch_or_empty(target, self.metadata_predicate(filters)).await
    }

    /// Rows whose timestamp falls in the range.
    pub async fn filter_by_date_range(&self, target: &FilterTarget, range: &DateRange) -> Vec<Row> {
        self.fetch_or_empty(target, self.date_predicate(range)).await
    }

    /// Rows matching the keyword lists.
    pub async fn filter_by_content(&self, target: &FilterTarget, content: &ContentFilter) -> Vec<Row> {
        self.fetch_or_empty(target, self.content_predicate(content)).await
    }

    /// Rows whose text length is within bounds.
    pub async fn filter_by_quality(&self, target: &FilterTarget, quality: &QualityFilter) -> Vec<Row> {
        self.fetch_or_empty(target, self.quality_predicate(quality)).await
    }

    /// Rows satisfying every active filter category.
    pub async fn apply_multiple_filters(&self, target: &FilterTarget, filters: &FilterSet) -> Vec<Row> {
        self.fetch_or_empty(target, self.predicate(filters)).await
    }

    /// Keep results whose score lies within the optional bounds.
    pub fn filter_by_relevance_score(
        &self,
        results: Vec<ScoredResult>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Vec<ScoredResult> {
        results
            .into_iter()
            .filter(|r| min.is_none_or(|m| r.score >= m) && max.is_none_or(|m| r.score <= m))
            .collect()
    }

    /// Keep results whose text is similar to `reference`, averaging the
    /// similarity (mapped to `[0, 1]`) into the score. Returns the input
    /// unchanged if embedding fails.
    pub async fn semantic_filter(
        &self,
        results: Vec<ScoredResult>,
        reference: &str,
        threshold: f64,
        text_field: &str,
    ) -> Vec<ScoredResult> {
        let Some(provider) = &self.provider else {
            error!("Semantic filtering needs an embedding provider");
            return results;
        };
        match semantic_keep(provider.as_ref(), &results, reference, threshold, text_field).await {
            Ok(kept) => kept,
            Err(e) => {
                error!("Semantic filtering failed: {e}");
                results
            }
        }
    }
}

async fn semantic_keep(
    provider: &dyn EmbeddingProvider,
    results: &[ScoredResult],
    reference: &str,
    threshold: f64,
    text_field: &str,
) -> sift_embeddings::Result<Vec<ScoredResult>> {
    let reference_vector = provider.embed_query(reference).await?;
    let mut kept = Vec::with_capacity(results.len());
    for result in results {
        let Some(text) = result.metadata.get(text_field).and_then(JsonValue::as_str) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        let vector = provider.embed_query(text).await?;
        let similarity = f64::from(cosine_to_unit(cosine_similarity(&reference_vector, &vector)?));
        if similarity >= threshold {
            let mut result = result.clone();
            result.score = (result.score + similarity) / 2.0;
            kept.push(result);
        }
    }
    Ok(kept)
}
