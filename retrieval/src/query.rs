//! Query understanding and routing.
//!
//! A query is classified, expanded with recent conversation turns and then
//! routed to context-aware, hybrid or plain vector retrieval. Filters are
//! pushed into whichever search runs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sift_embeddings::EmbeddingProvider;
use sift_store::{SqlValue, VectorStore, validate_identifier};
use tracing::{debug, error, info, warn};

use crate::config::{QueryEngineConfig, RetrievalConfig};
use crate::context::{ContextRequest, ContextRetriever};
use crate::error::Result;
use crate::filter::{FilterEngine, FilterSet, Predicate};
use crate::hybrid::{HybridQuery, HybridRetriever};
use crate::similarity::{ScoredResult, SearchRequest, SimilaritySearcher};

const QUESTION_WORDS: [&str; 9] = ["what", "how", "why", "when", "where", "who", "which", "whose", "whom"];

/// Coarse intent of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Question,
    Instruction,
    Command,
    Other,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Question => "question",
            QueryType::Instruction => "instruction",
            QueryType::Command => "command",
            QueryType::Other => "other",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered pattern lists; the first type with a matching pattern wins.
pub struct QueryClassifier {
    patterns: Vec<(QueryType, Vec<Regex>)>,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClassifier {
    pub fn new() -> Self {
        let table: [(QueryType, &[&str]); 3] = [
            (
                QueryType::Question,
                &[r"\b(what|how|why|when|where|who|which|whose|whom)\b", r"\?$"],
            ),
            (
                QueryType::Instruction,
                &[r"\b(please|could you|would you|help me|tell me|explain|describe|summarize|find|search|look for)\b"],
            ),
            (
                QueryType::Command,
                &[r"\b(show|display|list|get|retrieve|fetch|provide|give|analyze|check|verify|validate)\b"],
            ),
        ];

        let mut patterns = Vec::with_capacity(table.len());
        for (kind, sources) in table {
            let mut compiled = Vec::with_capacity(sources.len());
            for source in sources {
                if let Ok(re) = Regex::new(source) {
                    compiled.push(re);
                }
            }
            patterns.push((kind, compiled));
        }
        Self { patterns }
    }

    pub fn classify(&self, query: &str) -> QueryType {
        let query = query.trim().to_lowercase();
        self.patterns
            .iter()
            .find(|(_, res)| res.iter().any(|re| re.is_match(&query)))
            .map_or(QueryType::Other, |(kind, _)| *kind)
    }
}

/// Capitalized words longer than two characters and words that follow a
/// question word, in first-seen order without duplicates.
pub fn extract_key_terms(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut seen = HashSet::new();
    let mut terms = Vec::new();

    for (i, word) in words.iter().enumerate() {
        let clean: String = word.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect();
        if clean.is_empty() {
            continue;
        }
        let capitalized = clean.chars().next().is_some_and(char::is_uppercase) && clean.chars().count() > 2;
        let follows_question = i > 0 && {
            let previous = words[i - 1]
                .to_lowercase()
                .trim_end_matches(['?', ',', '.', '!', ';', ':'])
                .to_string();
            QUESTION_WORDS.contains(&previous.as_str())
        };
        if (capitalized || follows_question) && seen.insert(clean.clone()) {
            terms.push(clean);
        }
    }
    terms
}

/// A routed query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub conversation_id: Option<String>,
    /// The configured default table when `None`.
    pub table: Option<String>,
    pub k: Option<usize>,
    pub use_hybrid: Option<bool>,
    pub use_context: Option<bool>,
    pub filters: Option<FilterSet>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            conversation_id: None,
            table: None,
            k: None,
            use_hybrid: None,
            use_context: None,
            filters: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_hybrid(mut self, use_hybrid: bool) -> Self {
        self.use_hybrid = Some(use_hybrid);
        self
    }

    pub fn with_context(mut self, use_context: bool) -> Self {
        self.use_context = Some(use_context);
        self
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = Some(filters);
        self
    }
}

/// Entry point for read queries. Every failure is logged and yields an
/// empty result list.
pub struct QueryEngine {
    searcher: Arc<SimilaritySearcher>,
    hybrid: Arc<HybridRetriever>,
    context: Arc<ContextRetriever>,
    filters: Arc<FilterEngine>,
    classifier: QueryClassifier,
    config: QueryEngineConfig,
}

impl QueryEngine {
    pub fn new(context: Arc<ContextRetriever>, filters: Arc<FilterEngine>) -> Self {
        Self::with_config(context, filters, QueryEngineConfig::default())
    }

    pub fn with_config(context: Arc<ContextRetriever>, filters: Arc<FilterEngine>, config: QueryEngineConfig) -> Self {
        let hybrid = Arc::clone(context.hybrid());
        let searcher = Arc::clone(hybrid.searcher());
        Self {
            searcher,
            hybrid,
            context,
            filters,
            classifier: QueryClassifier::new(),
            config,
        }
    }

    /// Wire every retrieval component over one store and provider.
    pub fn from_config(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let searcher = Arc::new(SimilaritySearcher::with_config(
            Arc::clone(&store),
            Arc::clone(&provider),
            config.search.clone(),
        ));
        let hybrid = Arc::new(HybridRetriever::with_config(searcher, config.hybrid.clone()));
        let context = Arc::new(ContextRetriever::with_config(hybrid, config.context.clone()));
        let filters = Arc::new(FilterEngine::with_config(store, config.filter.clone()).with_provider(provider));
        Ok(Self::with_config(context, filters, config.query.clone()))
    }

    pub fn config(&self) -> &QueryEngineConfig {
        &self.config
    }

    pub fn filters(&self) -> &Arc<FilterEngine> {
        &self.filters
    }

    pub fn context(&self) -> &Arc<ContextRetriever> {
        &self.context
    }

    pub fn hybrid(&self) -> &Arc<HybridRetriever> {
        &self.hybrid
    }

    pub fn classify_query(&self, query: &str) -> QueryType {
        self.classifier.classify(query)
    }

    /// Prepend the last conversation turns, oldest first. Questions also get
    /// their key terms appended.
    pub async fn expand_query(&self, query: &str, query_type: QueryType, conversation_id: Option<&str>) -> String {
        let context = match conversation_id {
            Some(id) => self.recent_turns(id).await.unwrap_or_else(|e| {
                warn!("Could not load conversation context: {e}");
                String::new()
            }),
            None => String::new(),
        };

        match query_type {
            QueryType::Question => {
                let terms = extract_key_terms(query).join(", ");
                format!("{context} {query} {terms}").trim().to_string()
            }
            QueryType::Instruction | QueryType::Command | QueryType::Other => {
                format!("{context} {query}").trim().to_string()
            }
        }
    }

    async fn recent_turns(&self, conversation_id: &str) -> Result<String> {
        let table = &self.context.config().messages_table;
        validate_identifier(table, "messages table")?;
        let sql = format!("SELECT question, answer FROM {table} WHERE conversation_id = ? ORDER BY created_at DESC LIMIT ?");
        let mut rows = self
            .searcher
            .store()
            .query(
                &sql,
                &[SqlValue::from(conversation_id), SqlValue::from(self.config.context_turns)],
            )
            .await?;
        rows.reverse();

        let mut parts = Vec::with_capacity(rows.len() * 2);
        for row in &rows {
            let field = |key: &str| row.get(key).and_then(JsonValue::as_str).filter(|s| !s.is_empty());
            if let Some(question) = field("question") {
                parts.push(format!("Q: {question}"));
            }
            if let Some(answer) = field("answer") {
                parts.push(format!("A: {answer}"));
            }
        }
        Ok(parts.join(" "))
    }

    fn predicate(&self, filters: Option<&FilterSet>) -> Result<Option<Predicate>> {
        match filters {
            Some(filters) if !filters.is_empty() => self.filters.predicate(filters),
            _ => Ok(None),
        }
    }

    /// Up to `k` completions of a partially typed query: the query itself,
    /// then topic expansions for questions and explanation requests.
    pub fn get_query_suggestions(&self, partial_query: &str, k: usize) -> Vec<String> {
        let base = partial_query.trim();
        if base.is_empty() {
            return Vec::new();
        }

        let lower = base.to_lowercase();
        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| lower.starts_with(p));
        let expansions: &[&str] = if starts(&["what", "how", "why"]) {
            &["security", "vulnerability"]
        } else if starts(&["tell me", "explain"]) {
            &["about cybersecurity", "about threats"]
        } else {
            &[]
        };

        let mut suggestions = vec![base.to_string()];
        suggestions.extend(expansions.iter().map(|tail| format!("{base} {tail}")));
        suggestions.truncate(k);
        suggestions
    }

    /// Classify, expand and retrieve.
    pub async fn process_query(&self, request: &QueryRequest) -> Vec<ScoredResult> {
        match self.try_process(request).await {
            Ok(results) => results,
            Err(e) => {
                error!("Query processing failed: {e}");
                Vec::new()
            }
        }
    }

    async fn try_process(&self, request: &QueryRequest) -> Result<Vec<ScoredResult>> {
        let query_type = self.classify_query(&request.query);
        info!("Query classified as {query_type}");

        let expanded = self
            .expand_query(&request.query, query_type, request.conversation_id.as_deref())
            .await;
        debug!("Expanded query: {expanded}");

        let table = request.table.as_deref().unwrap_or(&self.config.default_table);
        let k = request.k.unwrap_or(self.config.k);
        let predicate = self.predicate(request.filters.as_ref())?;

        if request.use_context.unwrap_or(self.config.use_context) {
            let mut context_request = ContextRequest::new(table, expanded, k).with_predicate(predicate);
            if let Some(id) = &request.conversation_id {
                context_request = context_request.with_conversation(id);
            }
            return Ok(self.context.retrieve_with_context(&context_request).await);
        }

        if request.use_hybrid.unwrap_or(self.config.use_hybrid) {
            let query = HybridQuery::new(table, expanded, k).with_predicate(predicate);
            let results = self.hybrid.hybrid_search(&query).await?;
            return Ok(results.into_iter().map(ScoredResult::from).collect());
        }

        let search = SearchRequest::text(table, expanded, k).with_predicate(predicate);
        let hits = self.searcher.search(&search).await?;
        Ok(hits.into_iter().map(ScoredResult::from).collect())
    }

    /// Nearest neighbours of a precomputed vector.
    pub async fn query_by_vector(
        &self,
        vector: Vec<f32>,
        table: &str,
        k: usize,
        filters: Option<&FilterSet>,
    ) -> Vec<ScoredResult> {
        let result = async {
            let predicate = self.predicate(filters)?;
            let search = SearchRequest::vector(table, vector, k).with_predicate(predicate);
            let hits = self.searcher.search(&search).await?;
            Ok::<_, crate::error::RetrievalError>(hits.into_iter().map(ScoredResult::from).collect())
        }
        .await;

        result.unwrap_or_else(|e| {
            error!("Vector query failed: {e}");
            Vec::new()
        })
    }

    /// Run each query unexpanded, one after another.
    pub async fn batch_query(&self, queries: &[String], table: &str, k: usize, use_hybrid: bool) -> Vec<Vec<ScoredResult>> {
        let mut batches = Vec::with_capacity(queries.len());
        for query in queries {
            let results = if use_hybrid {
                self.hybrid
                    .hybrid_search(&HybridQuery::new(table, query, k))
                    .await
                    .map(|rs| rs.into_iter().map(ScoredResult::from).collect())
            } else {
                self.searcher.search_by_text(table, query, k).await
            };
            batches.push(results.unwrap_or_else(|e| {
                error!("Batch query {query:?} failed: {e}");
                Vec::new()
            }));
        }
        batches
    }
}
