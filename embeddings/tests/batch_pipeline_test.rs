//! Batch embedding against a mock OpenAI-compatible server.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use sift_embeddings::{
    BatchEmbedder, BatchEmbedderConfig, CheckpointRecord, EmbeddingError, ProviderCache,
    ProviderRegistry, ProviderSettings,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Echoes one 3-d vector per input, encoding the input length.
struct EchoEmbeddings;

impl Respond for EchoEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let inputs = body["input"].as_array().cloned().unwrap_or_default();
        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let len = text.as_str().map_or(0, str::len) as f64;
                json!({"embedding": [len, 1.0, 0.0], "index": index})
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({"data": data, "model": "mock"}))
    }
}

#[tokio::test]
async fn test_vllm_provider_batches_against_server() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(EchoEmbeddings)
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let checkpoint = dir.path().join("run.jsonl");
    let settings = ProviderSettings::new("vllm").with_base_url(format!("{}/v1", server.uri()));
    let config = BatchEmbedderConfig::new(settings)
        .with_batch_size(2)
        .with_retries(0, 1.0, 0.01)
        .with_checkpoint(&checkpoint, true);

    let embedder = BatchEmbedder::new(config)?;
    let texts: Vec<String> = ["a", "bb", "ccc", "dddd", "eeeee"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    let (vectors, dim) = embedder.run(&texts).await?;

    assert_eq!(dim, 3);
    let lengths: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
    assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

    let lines = std::fs::read_to_string(&checkpoint)?;
    let records: Vec<CheckpointRecord> = lines
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(records.len(), 5);
    assert_eq!(records[4].text.as_deref(), Some("eeeee"));
    Ok(())
}

#[tokio::test]
async fn test_server_errors_are_retried() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(EchoEmbeddings)
        .mount(&server)
        .await;

    let settings = ProviderSettings::new("ollama").with_base_url(server.uri());
    let config = BatchEmbedderConfig::new(settings).with_retries(2, 1.0, 0.001);
    let embedder = BatchEmbedder::new(config)?;

    let (vectors, _) = embedder.run(&["hello".to_string()]).await?;
    assert_eq!(vectors, vec![vec![5.0, 1.0, 0.0]]);
    Ok(())
}

#[tokio::test]
async fn test_persistent_failure_surfaces_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .expect(2)
        .mount(&server)
        .await;

    let settings = ProviderSettings::new("sglang").with_base_url(server.uri());
    let config = BatchEmbedderConfig::new(settings).with_retries(1, 1.0, 0.001);
    let embedder = BatchEmbedder::new(config).unwrap();

    let err = embedder.run(&["x".to_string()]).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::ApiRequest(msg) if msg.contains("model not loaded")));
}

#[tokio::test]
async fn test_shared_cache_across_embedders() {
    let registry = Arc::new(ProviderRegistry::default());
    let cache = Arc::new(ProviderCache::new());
    let settings = ProviderSettings::new("local").with_dimensions(12);

    let first = BatchEmbedder::new(BatchEmbedderConfig::new(settings.clone()))
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .with_provider_cache(Arc::clone(&cache));
    let second = BatchEmbedder::new(BatchEmbedderConfig::new(settings))
        .unwrap()
        .with_registry(registry)
        .with_provider_cache(Arc::clone(&cache));

    let a = first.provider().await.unwrap();
    let b = second.provider().await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.dimension(), Some(12));
    assert_eq!(cache.len().await, 1);
}
