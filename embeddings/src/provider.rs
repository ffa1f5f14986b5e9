//! Embedding providers.
//!
//! Providers turn text into dense vectors. [`OpenAIProvider`] talks to any
//! OpenAI-compatible `/embeddings` endpoint (OpenAI itself, vLLM, SGLang,
//! Ollama). [`HashingProvider`] is a deterministic bag-of-words embedder
//! that needs no network and is used offline and in tests.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::normalize;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name, e.g. `openai`.
    fn name(&self) -> &str;

    /// Model identifier.
    fn model(&self) -> &str;

    /// Output dimension, when known without making a call.
    fn dimension(&self) -> Option<usize>;

    /// Embed a single query string.
    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding returned for query".to_string()))
    }

    /// Embed a batch of documents, one vector per input in input order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

/// Provider for OpenAI-compatible embedding endpoints.
pub struct OpenAIProvider {
    /// Name reported in logs (`openai`, `vllm`, ...).
    name: String,

    /// API key, sent as a bearer token when present.
    api_key: Option<String>,

    /// API base URL, without the `/embeddings` suffix.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Model to request.
    model: String,

    /// Requested output dimensions (if supported by the server).
    dimensions: Option<usize>,
}

impl OpenAIProvider {
    /// Default OpenAI API base URL.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Default OpenAI embedding model.
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    /// Create an OpenAI provider, reading `OPENAI_API_KEY` from the
    /// environment.
    pub fn new() -> Self {
        Self {
            name: "openai".to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
            model: Self::DEFAULT_MODEL.to_string(),
            dimensions: None,
        }
    }

    /// Set the name reported by [`EmbeddingProvider::name`].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Clear the API key (local servers usually need none).
    pub fn without_api_key(mut self) -> Self {
        self.api_key = None;
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Request a specific output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Whether an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        self.dimensions
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Requesting {} embeddings from {} with model: {}",
            texts.len(),
            self.name,
            self.model
        );

        let mut body = serde_json::json!({
            "input": texts,
            "model": self.model,
        });
        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest(format!("{status}: {error_text}")));
        }

        let mut result: OpenAIEmbeddingResponse = response.json().await?;
        if result.data.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.data.len()
            )));
        }
        result.data.sort_by_key(|item| item.index);

        info!("Generated {} embeddings with {}", result.data.len(), self.name);

        Ok(result.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric term is hashed into one of `dimension`
/// buckets with a hash-derived sign; the result is L2-normalized. Texts
/// sharing vocabulary land close together, which is enough for offline
/// runs and tests.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    model: String,
    dimension: usize,
}

impl HashingProvider {
    /// Default output dimension.
    pub const DEFAULT_DIMENSION: usize = 384;

    /// Create a provider with the given dimension (at least 1).
    pub fn new(dimension: usize) -> Self {
        Self {
            model: "feature-hashing".to_string(),
            dimension: dimension.max(1),
        }
    }

    /// Set the model label.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Embed synchronously.
    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        for term in terms(text) {
            let digest = Sha256::digest(term.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercase alphanumeric terms of `text`.
fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_openai_builder() {
        let provider = OpenAIProvider::new()
            .with_name("vllm")
            .without_api_key()
            .with_base_url("http://localhost:8006/v1/")
            .with_model("BAAI/bge-base-en")
            .with_dimensions(768);

        assert_eq!(provider.name(), "vllm");
        assert_eq!(provider.model(), "BAAI/bge-base-en");
        assert_eq!(provider.dimension(), Some(768));
        assert_eq!(provider.base_url, "http://localhost:8006/v1");
        assert!(!provider.has_api_key());
    }

    #[tokio::test]
    async fn test_openai_reorders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [0.0, 1.0], "index": 1},
                    {"embedding": [1.0, 0.0], "index": 0}
                ],
                "model": "text-embedding-3-small"
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("sk-test")
            .with_base_url(server.uri());
        let vectors = provider
            .embed_documents(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_openai_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("sk-test")
            .with_base_url(server.uri());
        let err = provider.embed_query("hello").await.unwrap_err();

        assert!(matches!(err, EmbeddingError::RateLimited { retry_after_secs: 7 }));
    }

    #[tokio::test]
    async fn test_openai_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new().without_api_key().with_base_url(server.uri());
        let err = provider.embed_query("hello").await.unwrap_err();

        assert!(matches!(err, EmbeddingError::ApiRequest(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_hashing_is_deterministic_and_normalized() {
        let provider = HashingProvider::new(64);
        let a = provider.embed_query("Vector search with SQLite").await.unwrap();
        let b = provider.embed_query("vector SEARCH with sqlite").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_shared_terms_are_closer() {
        let provider = HashingProvider::new(256);
        let query = provider.embed_text("rust borrow checker");
        let near = provider.embed_text("the rust borrow checker explained");
        let far = provider.embed_text("baking sourdough bread at home");

        let near_sim = cosine_similarity(&query, &near).unwrap();
        let far_sim = cosine_similarity(&query, &far).unwrap();
        assert!(near_sim > far_sim);
    }

    #[test]
    fn test_hashing_empty_text_is_zero_vector() {
        let provider = HashingProvider::new(8);
        assert_eq!(provider.embed_text("  ... "), vec![0.0; 8]);
    }
}
