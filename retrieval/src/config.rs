//! Configuration for the retrieval layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sift_chunking::{SentenceChunkerConfig, TextPreprocessorConfig};
use sift_embeddings::BatchEmbedderConfig;
use sift_store::Metric;

use crate::error::{Result, RetrievalError};

/// Configuration for every retrieval component, loadable from one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// SQLite database file; `None` keeps the store in memory.
    pub store_path: Option<PathBuf>,

    /// Text cleanup before chunking.
    pub preprocessor: TextPreprocessorConfig,

    /// Chunk sizing.
    pub chunker: SentenceChunkerConfig,

    /// Embedding provider and batching.
    pub embedder: BatchEmbedderConfig,

    /// Similarity search defaults.
    pub search: SearchConfig,

    /// Hybrid fusion.
    pub hybrid: HybridConfig,

    /// Push-down filtering.
    pub filter: FilterEngineConfig,

    /// Conversation-aware retrieval.
    pub context: ContextRetrieverConfig,

    /// Query routing.
    pub query: QueryEngineConfig,

    /// Document ingestion.
    pub indexer: IndexerConfig,
}

impl RetrievalConfig {
    /// Parse a JSON document. Missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RetrievalError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    /// Set the database file.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Set the embedder configuration.
    pub fn with_embedder(mut self, embedder: BatchEmbedderConfig) -> Self {
        self.embedder = embedder;
        self
    }

    /// Set the hybrid configuration.
    pub fn with_hybrid(mut self, hybrid: HybridConfig) -> Self {
        self.hybrid = hybrid;
        self
    }

    /// Set the context configuration.
    pub fn with_context(mut self, context: ContextRetrieverConfig) -> Self {
        self.context = context;
        self
    }

    /// Check the sections that reject bad values outright.
    pub fn validate(&self) -> Result<()> {
        self.chunker.validate()?;
        self.embedder.validate()?;
        self.context.validate()?;
        if self.hybrid.candidates_each == 0 {
            return Err(RetrievalError::Validation(
                "hybrid.candidates_each must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Similarity search defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Metric used when a request does not name one.
    pub metric: Metric,

    /// Vector column.
    pub column: String,

    /// Id column.
    pub id_col: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            column: "embedding".to_string(),
            id_col: "id".to_string(),
        }
    }
}

/// Hybrid vector + keyword fusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Weight of the normalized vector score.
    pub vector_weight: f64,

    /// Weight of the normalized keyword score.
    pub keyword_weight: f64,

    /// Candidates drawn from each side before fusion.
    pub candidates_each: usize,

    /// Minimum fused score kept by the default ranker.
    pub threshold: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            vector_weight: 0.6,
            keyword_weight: 0.4,
            candidates_each: 50,
            threshold: 0.0,
        }
    }
}

impl HybridConfig {
    /// Set both fusion weights.
    pub fn with_weights(mut self, vector_weight: f64, keyword_weight: f64) -> Self {
        self.vector_weight = vector_weight;
        self.keyword_weight = keyword_weight;
        self
    }

    /// Set the per-side candidate count.
    pub fn with_candidates_each(mut self, candidates_each: usize) -> Self {
        self.candidates_each = candidates_each;
        self
    }

    /// Whether the weights add up to one.
    pub fn weights_sum_to_one(&self) -> bool {
        (self.vector_weight + self.keyword_weight - 1.0).abs() <= 1e-6
    }
}

/// How much conversation history informs a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// The last N messages.
    #[default]
    Window,
    /// Messages from the current session.
    FullChat,
    /// Every message in the conversation.
    FullConversation,
}

/// Conversation-aware retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextRetrieverConfig {
    /// Messages read in window mode.
    pub window_size: usize,

    /// Share of the final score given to overlap with the conversation.
    pub conversation_weight: f64,

    /// Mode used when a request does not name one.
    pub mode: ContextMode,

    /// Table holding `conversation_id, question, answer, created_at`.
    pub messages_table: String,

    /// How far back the full-chat mode reaches, in seconds.
    pub full_chat_window_secs: u64,
}

impl Default for ContextRetrieverConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            conversation_weight: 0.3,
            mode: ContextMode::Window,
            messages_table: "messages".to_string(),
            full_chat_window_secs: 3600,
        }
    }
}

impl ContextRetrieverConfig {
    /// Set the default mode.
    pub fn with_mode(mut self, mode: ContextMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the window size.
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the conversation weight.
    pub fn with_conversation_weight(mut self, weight: f64) -> Self {
        self.conversation_weight = weight;
        self
    }

    /// Set the messages table.
    pub fn with_messages_table(mut self, table: impl Into<String>) -> Self {
        self.messages_table = table.into();
        self
    }

    /// The full-chat lookback.
    pub fn full_chat_window(&self) -> Duration {
        Duration::from_secs(self.full_chat_window_secs)
    }

    /// Reject weights outside `[0, 1]` and bad table names.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.conversation_weight) {
            return Err(RetrievalError::Validation(format!(
                "conversation_weight must be within [0, 1], got {}",
                self.conversation_weight
            )));
        }
        sift_store::validate_identifier(&self.messages_table, "messages table")?;
        Ok(())
    }
}

/// Push-down filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterEngineConfig {
    /// When set, metadata fields are read from this JSON column with
    /// `json_extract` instead of from same-named columns.
    pub metadata_column: Option<String>,

    /// Row limit for plain filtered queries.
    pub default_limit: usize,
}

impl Default for FilterEngineConfig {
    fn default() -> Self {
        Self {
            metadata_column: None,
            default_limit: 100,
        }
    }
}

impl FilterEngineConfig {
    /// Read metadata fields from a JSON column.
    pub fn with_metadata_column(mut self, column: impl Into<String>) -> Self {
        self.metadata_column = Some(column.into());
        self
    }
}

/// Query routing defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryEngineConfig {
    /// Table searched when a request does not name one.
    pub default_table: String,

    /// Results per query.
    pub k: usize,

    /// Use hybrid search when context retrieval is off.
    pub use_hybrid: bool,

    /// Route through conversation-aware retrieval.
    pub use_context: bool,

    /// Conversation turns prepended during expansion.
    pub context_turns: usize,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            default_table: "text_vectors".to_string(),
            k: 10,
            use_hybrid: true,
            use_context: true,
            context_turns: 3,
        }
    }
}

/// Document ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Table written when a call does not name one.
    pub table: String,

    /// Run the preprocessor before chunking.
    pub preprocess: bool,

    /// Metric of the vector index ensured on the table.
    pub metric: Metric,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            table: "text_vectors".to_string(),
            preprocess: true,
            metric: Metric::Cosine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = RetrievalConfig::default();
        assert_eq!(config.hybrid.vector_weight, 0.6);
        assert_eq!(config.hybrid.keyword_weight, 0.4);
        assert_eq!(config.hybrid.candidates_each, 50);
        assert_eq!(config.context.window_size, 5);
        assert_eq!(config.context.mode, ContextMode::Window);
        assert_eq!(config.context.full_chat_window(), Duration::from_secs(3600));
        assert!(config.hybrid.weights_sum_to_one());
    }

    #[test]
    fn test_partial_json() {
        let config = RetrievalConfig::from_json_str(
            r#"{
                "hybrid": { "vector_weight": 0.7, "keyword_weight": 0.5 },
                "context": { "mode": "full_conversation" },
                "search": { "metric": "l2" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.hybrid.vector_weight, 0.7);
        assert_eq!(config.hybrid.candidates_each, 50);
        assert!(!config.hybrid.weights_sum_to_one());
        assert_eq!(config.context.mode, ContextMode::FullConversation);
        assert_eq!(config.context.window_size, 5);
        assert_eq!(config.search.metric, Metric::L2);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RetrievalConfig::from_json_str(r#"{ "context": { "conversation_weight": 1.5 } }"#).is_err());
        assert!(RetrievalConfig::from_json_str(r#"{ "context": { "messages_table": "m; DROP" } }"#).is_err());
        assert!(RetrievalConfig::from_json_str(r#"{ "hybrid": { "candidates_each": 0 } }"#).is_err());
        assert!(RetrievalConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sift.json");
        std::fs::write(&path, r#"{ "query": { "k": 3 } }"#).unwrap();

        let config = RetrievalConfig::load(&path).unwrap();
        assert_eq!(config.query.k, 3);
        assert!(matches!(
            RetrievalConfig::load(dir.path().join("missing.json")),
            Err(RetrievalError::Config(_))
        ));
    }
}
