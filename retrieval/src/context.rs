//! Conversation-aware retrieval.
//!
//! History is read from a messages table with `conversation_id, question,
//! answer, created_at` columns. The selected messages expand the query
//! before hybrid search and bias the final scores toward results that share
//! words with the conversation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sift_store::{Row, SqlValue, VectorStore, validate_identifier};
use tracing::{debug, error, warn};

use crate::config::{ContextMode, ContextRetrieverConfig};
use crate::error::Result;
use crate::filter::Predicate;
use crate::hybrid::{HybridQuery, HybridRetriever};
use crate::similarity::{ScoredResult, id_string};

/// Messages sampled by the window-mode expansion.
const WINDOW_EXPANSION_MESSAGES: usize = 3;
/// Above this many messages the full modes only sample the most recent.
const FULL_MODE_SAMPLE_THRESHOLD: usize = 10;
const FULL_MODE_SAMPLE: usize = 5;
/// Cap on message-history hits mixed into conversation-aware results.
const MAX_HISTORY_HITS: usize = 3;

/// Marks results that came from the messages table.
pub const HISTORY_SOURCE: &str = "conversation_history";

/// One question/answer turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ContextMessage {
    fn from_row(row: &Row) -> Self {
        let text = |key: &str| row.get(key).and_then(JsonValue::as_str).unwrap_or_default().to_string();
        let timestamp = row
            .get("created_at")
            .and_then(JsonValue::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        Self {
            id: row.get("id").map(id_string).unwrap_or_default(),
            question: text("question"),
            answer: text("answer"),
            timestamp,
        }
    }

    /// Question and answer joined by a space.
    pub fn text(&self) -> String {
        format!("{} {}", self.question, self.answer)
    }

    fn write_turn(&self, out: &mut String) {
        if !self.question.is_empty() {
            out.push_str(&format!("Q: {}\n", self.question));
        }
        if !self.answer.is_empty() {
            out.push_str(&format!("A: {}\n", self.answer));
        }
    }
}

/// Prepend conversation history to `query`.
///
/// Window mode uses the last three messages. The full modes use all
/// messages, or only the last five once there are more than ten.
pub fn expand_query(query: &str, messages: &[ContextMessage], mode: ContextMode) -> String {
    if messages.is_empty() {
        return query.to_string();
    }

    let (header, sampled) = match mode {
        ContextMode::Window => (
            "Previous conversation context:\n",
            last_n(messages, WINDOW_EXPANSION_MESSAGES),
        ),
        ContextMode::FullChat | ContextMode::FullConversation if messages.len() > FULL_MODE_SAMPLE_THRESHOLD => {
            ("Recent conversation context:\n", last_n(messages, FULL_MODE_SAMPLE))
        }
        ContextMode::FullChat | ContextMode::FullConversation => ("Conversation context:\n", messages),
    };

    let mut context = header.to_string();
    for message in sampled {
        message.write_turn(&mut context);
    }
    format!("{context}\nCurrent query: {query}")
}

fn last_n(messages: &[ContextMessage], n: usize) -> &[ContextMessage] {
    &messages[messages.len().saturating_sub(n)..]
}

fn joined_text<'a>(messages: impl IntoIterator<Item = &'a ContextMessage>) -> String {
    messages.into_iter().map(ContextMessage::text).collect::<Vec<_>>().join(" ")
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(str::to_string).collect()
}

/// Share of the context's distinct words that also occur in `text`.
pub fn context_relevance(context: &str, text: &str) -> f64 {
    let context_words = word_set(context);
    if context_words.is_empty() {
        return 0.0;
    }
    let text_words = word_set(text);
    context_words.intersection(&text_words).count() as f64 / context_words.len() as f64
}

/// A context-aware retrieval request.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub table: String,
    pub query: String,
    pub conversation_id: Option<String>,
    pub k: usize,
    /// The configured mode when `None`.
    pub mode: Option<ContextMode>,
    /// The configured window when `None`.
    pub window_size: Option<usize>,
    /// Exact-match filters on result metadata.
    pub metadata_filters: Row,
    /// Pushed into the hybrid search.
    pub predicate: Option<Predicate>,
    pub text_col: String,
    pub embedding_col: String,
}

impl ContextRequest {
    pub fn new(table: impl Into<String>, query: impl Into<String>, k: usize) -> Self {
        Self {
            table: table.into(),
            query: query.into(),
            conversation_id: None,
            k,
            mode: None,
            window_size: None,
            metadata_filters: Row::new(),
            predicate: None,
            text_col: "content".to_string(),
            embedding_col: "embedding".to_string(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_mode(mut self, mode: ContextMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }

    pub fn with_metadata_filter(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata_filters.insert(key.into(), value.into());
        self
    }

    pub fn with_predicate(mut self, predicate: Option<Predicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_text_col(mut self, column: impl Into<String>) -> Self {
        self.text_col = column.into();
        self
    }

    pub fn with_embedding_col(mut self, column: impl Into<String>) -> Self {
        self.embedding_col = column.into();
        self
    }

    fn matches_filters(&self, metadata: &Row) -> bool {
        self.metadata_filters
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// Hybrid retrieval biased by conversation history.
pub struct ContextRetriever {
    hybrid: Arc<HybridRetriever>,
    config: ContextRetrieverConfig,
    referential: Option<Regex>,
    follow_up: Option<Regex>,
}

impl ContextRetriever {
    pub fn new(hybrid: Arc<HybridRetriever>) -> Self {
        Self::with_config(hybrid, ContextRetrieverConfig::default())
    }

    pub fn with_config(hybrid: Arc<HybridRetriever>, config: ContextRetrieverConfig) -> Self {
        let referential = Regex::new(r"(?i)\b(that|it|the above|previous|earlier|mentioned)\b").ok();
        let follow_up = Regex::new(r"(?i)\b(how|why|what|when|where|who|which)\b").ok();
        Self {
            hybrid,
            config,
            referential,
            follow_up,
        }
    }

    pub fn config(&self) -> &ContextRetrieverConfig {
        &self.config
    }

    pub fn hybrid(&self) -> &Arc<HybridRetriever> {
        &self.hybrid
    }

    /// Conversation history for `conversation_id`, oldest first.
    pub async fn conversation_context(
        &self,
        conversation_id: Option<&str>,
        mode: Option<ContextMode>,
        window_size: Option<usize>,
    ) -> Result<Vec<ContextMessage>> {
        let Some(conversation_id) = conversation_id else {
            return Ok(Vec::new());
        };
        let table = &self.config.messages_table;
        validate_identifier(table, "messages table")?;
        let mode = mode.unwrap_or(self.config.mode);
        let store = self.hybrid.searcher().store();
        let columns = "id, question, answer, created_at";

        let rows = match mode {
            ContextMode::Window => {
                let window = window_size.unwrap_or(self.config.window_size);
                let sql = format!(
                    "SELECT {columns} FROM {table} WHERE conversation_id = ? ORDER BY created_at DESC LIMIT ?"
                );
                let mut rows = store
                    .query(&sql, &[SqlValue::from(conversation_id), SqlValue::from(window)])
                    .await?;
                rows.reverse();
                rows
            }
            ContextMode::FullChat => {
                let since = TimeDelta::from_std(self.config.full_chat_window())
                    .ok()
                    .and_then(|delta| Utc::now().checked_sub_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let sql = format!(
                    "SELECT {columns} FROM {table} \
                     WHERE conversation_id = ? AND datetime(created_at) > datetime(?) \
                     ORDER BY created_at ASC"
                );
                store
                    .query(&sql, &[SqlValue::from(conversation_id), SqlValue::from(since.to_rfc3339())])
                    .await?
            }
            ContextMode::FullConversation => {
                let sql = format!("SELECT {columns} FROM {table} WHERE conversation_id = ? ORDER BY created_at ASC");
                store.query(&sql, &[SqlValue::from(conversation_id)]).await?
            }
        };

        debug!("Loaded {} {mode:?} messages for conversation {conversation_id}", rows.len());
        Ok(rows.iter().map(ContextMessage::from_row).collect())
    }

    /// Hybrid search over the expanded query with scores blended toward the
    /// conversation. Failures yield an empty list.
    pub async fn retrieve_with_context(&self, request: &ContextRequest) -> Vec<ScoredResult> {
        match self.try_retrieve(request).await {
            Ok(results) => results,
            Err(e) => {
                error!("Context-aware retrieval failed: {e}");
                Vec::new()
            }
        }
    }

    async fn try_retrieve(&self, request: &ContextRequest) -> Result<Vec<ScoredResult>> {
        let mode = request.mode.unwrap_or(self.config.mode);
        let messages = self
            .conversation_context(request.conversation_id.as_deref(), Some(mode), request.window_size)
            .await?;
        let expanded = expand_query(&request.query, &messages, mode);

        let query = HybridQuery::new(&request.table, expanded, request.k.saturating_mul(2))
            .with_text_col(&request.text_col)
            .with_embedding_col(&request.embedding_col)
            .with_predicate(request.predicate.clone());
        let candidates = self.hybrid.hybrid_search(&query).await?;

        let context = joined_text(&messages);
        let weight = self.config.conversation_weight;
        let mut results: Vec<ScoredResult> = candidates
            .into_iter()
            .filter(|r| request.matches_filters(&r.metadata))
            .map(|r| {
                let relevance = if messages.is_empty() {
                    0.0
                } else {
                    r.metadata
                        .get(&request.text_col)
                        .and_then(JsonValue::as_str)
                        .map(|text| context_relevance(&context, text))
                        .unwrap_or(0.0)
                };
                let mut scored = ScoredResult::from(r);
                scored.score = scored.score * (1.0 - weight) + relevance * weight;
                scored
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(request.k);
        Ok(results)
    }

    pub async fn retrieve_with_window_context(&self, request: ContextRequest) -> Vec<ScoredResult> {
        self.retrieve_with_context(&request.with_mode(ContextMode::Window)).await
    }

    pub async fn retrieve_with_full_chat_context(&self, request: ContextRequest) -> Vec<ScoredResult> {
        self.retrieve_with_context(&request.with_mode(ContextMode::FullChat)).await
    }

    pub async fn retrieve_with_full_conversation_context(&self, request: ContextRequest) -> Vec<ScoredResult> {
        self.retrieve_with_context(&request.with_mode(ContextMode::FullConversation))
            .await
    }

    /// Knowledge-base results mixed with up to `min(k / 2, 3)` matching
    /// questions from the conversation history, tagged with
    /// `source = conversation_history`.
    pub async fn retrieve_conversation_aware(&self, request: ContextRequest) -> Vec<ScoredResult> {
        let request = request.with_mode(ContextMode::Window);
        let messages = match self
            .conversation_context(request.conversation_id.as_deref(), Some(ContextMode::Window), request.window_size)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!("Could not load conversation history: {e}");
                Vec::new()
            }
        };

        let mut results = self.retrieve_with_context(&request).await;

        let history_k = (request.k / 2).min(MAX_HISTORY_HITS);
        if request.conversation_id.is_some() && !messages.is_empty() && history_k > 0 {
            let query = HybridQuery::new(&self.config.messages_table, &request.query, history_k)
                .with_text_col("question")
                .with_embedding_col(&request.embedding_col);
            match self.hybrid.hybrid_search(&query).await {
                Ok(hits) => results.extend(hits.into_iter().map(|hit| {
                    let mut scored = ScoredResult::from(hit);
                    scored
                        .metadata
                        .insert("source".to_string(), JsonValue::from(HISTORY_SOURCE));
                    scored
                })),
                Err(e) => warn!("Message history search failed, using knowledge results only: {e}"),
            }
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(request.k);
        results
    }

    /// Rewrite the query by how it relates to the conversation, then run a
    /// window-mode context retrieval.
    pub async fn search_with_query_understanding(&self, request: ContextRequest) -> Vec<ScoredResult> {
        let messages = match self
            .conversation_context(request.conversation_id.as_deref(), Some(ContextMode::Window), request.window_size)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!("Query understanding failed: {e}");
                return Vec::new();
            }
        };
        let expanded = self.expand_query_by_type(&request.query, &messages, ContextMode::Window);

        let request = ContextRequest {
            query: expanded,
            ..request
        }
        .with_mode(ContextMode::Window);
        self.retrieve_with_context(&request).await
    }

    /// Expansion keyed on the query's wording.
    ///
    /// Referential queries ("that", "it", "previous", ...) get the recent
    /// turns, follow-up questions get the last question, anything else gets
    /// the last exchange.
    pub fn expand_query_by_type(&self, query: &str, messages: &[ContextMessage], mode: ContextMode) -> String {
        if messages.is_empty() {
            return query.to_string();
        }
        let full = mode != ContextMode::Window;

        if self.referential.as_ref().is_some_and(|re| re.is_match(query)) {
            let context = if full && messages.len() > 3 {
                joined_text(messages[..1].iter().chain(last_n(messages, 2)))
            } else {
                joined_text(last_n(messages, 2))
            };
            return format!("Based on this context: {context}. Query: {query}");
        }

        if self.follow_up.as_ref().is_some_and(|re| re.is_match(query))
            && let Some(last) = messages.last()
            && !last.question.is_empty()
        {
            return format!("Regarding: {}. Follow-up: {query}", last.question);
        }

        let context = if full && messages.len() > 1 {
            joined_text(messages[..1].iter().chain(last_n(messages, 1)))
        } else if full {
            joined_text(&messages[..1])
        } else {
            joined_text(last_n(messages, 1))
        };
        if context.trim().is_empty() {
            return query.to_string();
        }
        format!("Context: {context}. Query: {query}")
    }
}
