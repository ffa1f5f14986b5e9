//! Index documents into an on-disk store and read them back through the
//! public query surface.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value as JsonValue, json};
use sift_chunking::{SentenceChunkerConfig, TokenizerKind};
use sift_embeddings::BatchEmbedder;
use sift_retrieval::{
    ContextMode, Document, DocumentIndexer, FilterSet, FilterTarget, FilterValue, QueryEngine, QueryRequest,
    RetrievalConfig,
};
use sift_store::{Row, SqlValue, SqliteVectorStore, VectorStore};

const CONFIG: &str = r#"{
    "embedder": {
        "provider": "sentence_transformer",
        "dimensions": 64,
        "batch_size": 2,
        "max_retries": 0,
        "backoff_base": 1.0,
        "backoff_cap": 1.0,
        "reuse_provider": true
    },
    "filter": { "metadata_column": "metadata" },
    "context": { "window_size": 4 },
    "hybrid": { "candidates_each": 20 }
}"#;

struct Fixture {
    indexer: DocumentIndexer,
    engine: QueryEngine,
    store: Arc<SqliteVectorStore>,
    _dir: tempfile::TempDir,
}

async fn fixture() -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("sift.json");
    std::fs::write(&config_path, CONFIG)?;

    let mut config = RetrievalConfig::load(&config_path)?.with_store_path(dir.path().join("sift.db"));
    config.chunker = SentenceChunkerConfig::new(12, 0).with_tokenizer(TokenizerKind::Whitespace);

    let store = match &config.store_path {
        Some(path) => Arc::new(SqliteVectorStore::open(path)?),
        None => Arc::new(SqliteVectorStore::open_in_memory()?),
    };
    let embedder = Arc::new(BatchEmbedder::new(config.embedder.clone())?);
    let provider = embedder.provider().await?;

    let indexer = DocumentIndexer::new(Arc::clone(&embedder), store.clone(), &config)?;
    let engine = QueryEngine::from_config(store.clone(), provider, &config)?;
    Ok(Fixture {
        indexer,
        engine,
        store,
        _dir: dir,
    })
}

async fn seed(fixture: &Fixture) -> anyhow::Result<()> {
    let documents = vec![
        Document::new("Tokio is an async runtime. It schedules tasks on worker threads.")
            .with_id("tokio")
            .with_field("topic", "tech")
            .with_field("year", 2023)
            .with_field("created_at", "2024-03-01T00:00:00Z"),
        Document::new("Sourdough bread needs a starter. Bake it at high heat.")
            .with_id("bread")
            .with_field("topic", "food")
            .with_field("year", 2021)
            .with_field("created_at", "2024-02-01T00:00:00Z"),
        Document::new("Rust guarantees memory safety. The borrow checker enforces ownership.")
            .with_id("rust")
            .with_field("topic", "tech")
            .with_field("year", 2019)
            .with_field("created_at", "2024-01-01T00:00:00Z"),
    ];
    fixture.indexer.index_documents(&documents, None).await?;
    Ok(())
}

fn metadata_of(row: &Row) -> Row {
    row.get("metadata")
        .and_then(JsonValue::as_str)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_indexed_documents_are_searchable() -> anyhow::Result<()> {
    let fixture = fixture().await?;
    seed(&fixture).await?;

    let hybrid = fixture
        .engine
        .process_query(&QueryRequest::new("async runtime").with_context(false).with_k(2))
        .await;
    assert_eq!(hybrid[0].id, "tokio_chunk_0");
    assert_eq!(hybrid[0].metadata["topic"], json!("tech"));

    let vector = fixture
        .engine
        .process_query(&QueryRequest::new("sourdough starter").with_context(false).with_hybrid(false))
        .await;
    assert_eq!(vector[0].id, "bread_chunk_0");

    let batches = fixture
        .engine
        .batch_query(&["borrow checker".to_string()], "text_vectors", 1, true)
        .await;
    assert_eq!(batches[0][0].id, "rust_chunk_0");
    Ok(())
}

#[tokio::test]
async fn test_filtered_rows_satisfy_every_predicate() -> anyhow::Result<()> {
    let fixture = fixture().await?;
    seed(&fixture).await?;

    let filters = FilterSet::default()
        .with_field("year", FilterValue::from(json!({ "min": 2020, "max": 2024 })))
        .with_field("topic", FilterValue::from(json!(["tech", "science"])));
    let rows = fixture
        .engine
        .filters()
        .apply_multiple_filters(&FilterTarget::table("text_vectors"), &filters)
        .await;

    assert_eq!(rows.len(), 1);
    for row in &rows {
        let metadata = metadata_of(row);
        let year = metadata["year"].as_i64().unwrap_or_default();
        assert!((2020..=2024).contains(&year));
        assert_eq!(metadata["topic"], json!("tech"));
    }

    let routed = fixture
        .engine
        .process_query(&QueryRequest::new("memory safety").with_filters(filters))
        .await;
    let ids: Vec<&str> = routed.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["tokio_chunk_0"]);
    Ok(())
}

#[tokio::test]
async fn test_window_context_returns_latest_messages() -> anyhow::Result<()> {
    let fixture = fixture().await?;
    fixture
        .store
        .exec_sql(
            "CREATE TABLE messages (id TEXT PRIMARY KEY, conversation_id TEXT, question TEXT, answer TEXT, created_at TEXT)",
            &[],
        )
        .await?;
    for i in 0..7 {
        fixture
            .store
            .exec_sql(
                "INSERT INTO messages VALUES (?, 'conv', ?, ?, ?)",
                &[
                    SqlValue::from(format!("m{i}")),
                    SqlValue::from(format!("question {i}")),
                    SqlValue::from(format!("answer {i}")),
                    SqlValue::from(format!("2024-05-01T10:00:0{i}Z")),
                ],
            )
            .await?;
    }

    let context = fixture.engine.context();
    let window = context.conversation_context(Some("conv"), None, None).await?;
    let ids: Vec<&str> = window.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m3", "m4", "m5", "m6"]);

    let all = context
        .conversation_context(Some("conv"), Some(ContextMode::FullConversation), None)
        .await?;
    assert_eq!(all.len(), 7);
    // Fixed 2024 timestamps fall outside the one-hour session window.
    let session = context
        .conversation_context(Some("conv"), Some(ContextMode::FullChat), None)
        .await?;
    assert!(session.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_document_update_replaces_chunks() -> anyhow::Result<()> {
    let fixture = fixture().await?;
    seed(&fixture).await?;

    let ids = fixture
        .indexer
        .update_document(
            "bread",
            &Document::new("Rye bread is dense. Rye flour has little gluten. Proof it slowly overnight in the fridge.")
                .with_field("topic", "food"),
            None,
        )
        .await?;
    assert_eq!(ids, vec!["bread_chunk_0", "bread_chunk_1"]);

    let rows = fixture
        .store
        .query(
            "SELECT id, content FROM text_vectors WHERE doc_id = ? ORDER BY chunk_index",
            &[SqlValue::from("bread")],
        )
        .await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| !r["content"].as_str().unwrap_or_default().contains("Sourdough")));

    assert_eq!(fixture.indexer.delete_document("bread", None).await?, 2);
    Ok(())
}
