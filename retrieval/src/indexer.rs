//! Document ingestion: preprocess, chunk, embed and upsert.
//!
//! Ingestion is a write path, so every failure is returned to the caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sift_chunking::{SentenceChunker, TextPreprocessor};
use sift_embeddings::BatchEmbedder;
use sift_store::{RECORD_COLUMNS, Row, SqlValue, StoredRecord, VectorStore, validate_identifier};
use tracing::{debug, info};

use crate::config::{IndexerConfig, RetrievalConfig};
use crate::error::{Result, RetrievalError};

/// A document to index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    /// Derived from the content hash when `None`.
    #[serde(default)]
    pub doc_id: Option<String>,
    /// Copied onto every chunk.
    #[serde(default)]
    pub metadata: Row,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The explicit id, or the SHA-256 hex digest of the content.
    pub fn resolved_id(&self) -> String {
        match &self.doc_id {
            Some(id) => id.clone(),
            None => content_id(&self.content),
        }
    }
}

/// SHA-256 hex digest of `content`.
pub fn content_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{digest:x}")
}

/// Id of chunk `index` of document `doc_id`.
pub fn chunk_id(doc_id: &str, index: usize) -> String {
    format!("{doc_id}_chunk_{index}")
}

/// Writes documents into a vector table as embedded chunks.
pub struct DocumentIndexer {
    preprocessor: TextPreprocessor,
    chunker: SentenceChunker,
    embedder: Arc<BatchEmbedder>,
    store: Arc<dyn VectorStore>,
    config: IndexerConfig,
}

impl DocumentIndexer {
    pub fn new(embedder: Arc<BatchEmbedder>, store: Arc<dyn VectorStore>, config: &RetrievalConfig) -> Result<Self> {
        Ok(Self {
            preprocessor: TextPreprocessor::with_config(config.preprocessor.clone()),
            chunker: SentenceChunker::new(config.chunker.clone())?,
            embedder,
            store,
            config: config.indexer.clone(),
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    fn table<'a>(&'a self, table: Option<&'a str>) -> Result<&'a str> {
        let table = table.unwrap_or(&self.config.table);
        validate_identifier(table, "table")?;
        Ok(table)
    }

    /// Preprocess, chunk and embed `document` under `doc_id` without
    /// touching the store.
    async fn prepare_records(&self, document: &Document, doc_id: &str) -> Result<Vec<StoredRecord>> {
        let text = if self.config.preprocess {
            self.preprocessor.preprocess(&document.content)
        } else {
            document.content.clone()
        };
        let chunks = self.chunker.chunk(&text);
        if chunks.is_empty() {
            debug!("Document {doc_id} produced no chunks");
            return Ok(Vec::new());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let (vectors, dimension) = self.embedder.run(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(RetrievalError::Validation(format!(
                "embedded {} vectors for {} chunks of document {doc_id}",
                vectors.len(),
                chunks.len()
            )));
        }
        debug!("Embedded {} chunks of {doc_id} ({dimension}-d)", chunks.len());

        Ok(chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (chunk, vector))| {
                let id = chunk_id(doc_id, i);
                let mut record = StoredRecord::new(&id, vector).with_document(doc_id, i);
                record.metadata = document.metadata.clone();
                record
                    .with_field("chunk_id", id)
                    .with_field("doc_id", doc_id)
                    .with_field("chunk_index", i)
                    .with_field("content", chunk.text.as_str())
                    .with_field("content_length", chunk.text.chars().count())
                    .with_field("token_count", chunk.token_count)
            })
            .collect())
    }

    async fn prepare_table(&self, table: &str) -> Result<()> {
        self.store.create_table(table, RECORD_COLUMNS).await?;
        self.store.ensure_vector_index(table, "embedding", self.config.metric).await?;
        Ok(())
    }

    /// Index one document and return its chunk ids in order. A document
    /// that yields no chunks writes nothing.
    pub async fn index_document(&self, document: &Document, table: Option<&str>) -> Result<Vec<String>> {
        let table = self.table(table)?;
        let doc_id = document.resolved_id();

        let records = self.prepare_records(document, &doc_id).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        self.prepare_table(table).await?;
        self.store.insert_records(table, &records).await?;
        info!("Indexed document {doc_id} as {} chunks into {table}", records.len());
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    /// Index documents in order, stopping at the first failure.
    pub async fn index_documents(&self, documents: &[Document], table: Option<&str>) -> Result<Vec<(String, Vec<String>)>> {
        let mut indexed = Vec::with_capacity(documents.len());
        for document in documents {
            let ids = self.index_document(document, table).await?;
            indexed.push((document.resolved_id(), ids));
        }
        Ok(indexed)
    }

    /// Replace every chunk of `doc_id` with chunks of the new content. A
    /// failed update leaves the old chunks intact.
    pub async fn update_document(&self, doc_id: &str, document: &Document, table: Option<&str>) -> Result<Vec<String>> {
        let table = self.table(table)?;
        let records = self.prepare_records(document, doc_id).await?;

        self.prepare_table(table).await?;
        let (removed, written) = self.store.replace_document(table, doc_id, &records).await?;
        info!("Updated document {doc_id} in {table}: {removed} chunks replaced by {written}");
        Ok(records.into_iter().map(|r| r.id).collect())
    }

    /// Delete every chunk of `doc_id`, returning the number removed.
    pub async fn delete_document(&self, doc_id: &str, table: Option<&str>) -> Result<usize> {
        let table = self.table(table)?;
        let removed = self
            .store
            .exec_sql(&format!("DELETE FROM {table} WHERE doc_id = ?"), &[SqlValue::from(doc_id)])
            .await?;
        info!("Deleted {removed} chunks of document {doc_id} from {table}");
        Ok(removed)
    }
}
