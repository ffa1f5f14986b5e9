//! Batch embedding with retry and checkpointing.
//!
//! [`BatchEmbedder`] splits its input into consecutive batches and sends
//! each one to the provider. A failed batch is retried with capped
//! exponential backoff and jitter; once the retry budget is spent the last
//! error is returned. Successful vectors can be streamed to a JSONL
//! checkpoint file as they arrive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::Embedding;
use crate::cache::ProviderCache;
use crate::error::{EmbeddingError, Result};
use crate::provider::EmbeddingProvider;
use crate::registry::{ProviderRegistry, ProviderSettings};

/// Upper bound of the multiplicative jitter applied to each backoff.
pub const MAX_JITTER: f64 = 0.25;

/// Configuration for [`BatchEmbedder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEmbedderConfig {
    /// Provider to resolve through the registry.
    #[serde(flatten)]
    pub provider: ProviderSettings,

    /// Texts per provider call.
    pub batch_size: usize,

    /// Retries after the first failed attempt of a batch.
    pub max_retries: u32,

    /// Exponential backoff base.
    pub backoff_base: f64,

    /// Longest backoff in seconds, before jitter.
    pub backoff_cap: f64,

    /// JSONL file receiving one line per embedded vector.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,

    /// Include the source text in checkpoint lines.
    #[serde(default)]
    pub checkpoint_include_text: bool,

    /// Keep the resolved provider for later runs.
    pub reuse_provider: bool,
}

impl Default for BatchEmbedderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderSettings::default(),
            batch_size: 64,
            max_retries: 3,
            backoff_base: 2.0,
            backoff_cap: 30.0,
            checkpoint_path: None,
            checkpoint_include_text: false,
            reuse_provider: true,
        }
    }
}

impl BatchEmbedderConfig {
    /// Config for the given provider settings.
    pub fn new(provider: ProviderSettings) -> Self {
        Self {
            provider,
            ..Self::default()
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the retry budget and backoff curve.
    pub fn with_retries(mut self, max_retries: u32, backoff_base: f64, backoff_cap: f64) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = backoff_base;
        self.backoff_cap = backoff_cap;
        self
    }

    /// Stream vectors to a JSONL checkpoint.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>, include_text: bool) -> Self {
        self.checkpoint_path = Some(path.into());
        self.checkpoint_include_text = include_text;
        self
    }

    /// Enable or disable provider reuse across runs.
    pub fn with_reuse_provider(mut self, reuse: bool) -> Self {
        self.reuse_provider = reuse;
        self
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbeddingError::Validation("batch_size must be greater than zero".to_string()));
        }
        if !(self.backoff_base >= 1.0) {
            return Err(EmbeddingError::Validation(format!(
                "backoff_base must be at least 1.0, got {}",
                self.backoff_base
            )));
        }
        if !(self.backoff_cap > 0.0) {
            return Err(EmbeddingError::Validation(format!(
                "backoff_cap must be positive, got {}",
                self.backoff_cap
            )));
        }
        Ok(())
    }
}

/// Delay before retrying after failed attempt number `attempt` (0-based):
/// `min(cap, base^attempt) * (1 + jitter)` seconds, with `jitter` clamped
/// to `[0, 0.25]`.
pub fn backoff_delay(attempt: u32, base: f64, cap: f64, jitter: f64) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base.powi(exponent).min(cap) * (1.0 + jitter.clamp(0.0, MAX_JITTER));
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// One line of the checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Position of the text in the run's input.
    pub index: usize,

    /// Batch number the vector came from.
    pub batch: usize,

    /// Vector length.
    pub dim: usize,

    /// The vector.
    pub vector: Embedding,

    /// Source text, when enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Append-only JSONL writer, opened once per run.
struct Checkpoint {
    path: PathBuf,
    writer: BufWriter<File>,
    include_text: bool,
    lines: usize,
}

impl Checkpoint {
    async fn open(path: &Path, include_text: bool) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            include_text,
            lines: 0,
        })
    }

    async fn append(&mut self, start: usize, batch: usize, texts: &[String], vectors: &[Embedding]) -> Result<()> {
        for (offset, (text, vector)) in texts.iter().zip(vectors).enumerate() {
            let record = CheckpointRecord {
                index: start + offset,
                batch,
                dim: vector.len(),
                vector: vector.clone(),
                text: self.include_text.then(|| text.clone()),
            };
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            self.writer
                .write_all(&line)
                .await
                .map_err(|e| EmbeddingError::Checkpoint(format!("{}: {e}", self.path.display())))?;
            self.lines += 1;
        }
        Ok(())
    }

    async fn close(mut self) -> Result<usize> {
        self.writer
            .flush()
            .await
            .map_err(|e| EmbeddingError::Checkpoint(format!("{}: {e}", self.path.display())))?;
        self.writer.into_inner().sync_all().await?;
        debug!("Checkpoint {} closed after {} lines", self.path.display(), self.lines);
        Ok(self.lines)
    }
}

/// Embeds text in batches through a resolved provider.
pub struct BatchEmbedder {
    config: BatchEmbedderConfig,
    registry: Arc<ProviderRegistry>,
    provider_cache: Option<Arc<ProviderCache>>,
    injected: Option<Arc<dyn EmbeddingProvider>>,
    resolved: Mutex<Option<Arc<dyn EmbeddingProvider>>>,
}

impl BatchEmbedder {
    /// Create an embedder that resolves its provider through the default
    /// registry.
    pub fn new(config: BatchEmbedderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(ProviderRegistry::default()),
            provider_cache: None,
            injected: None,
            resolved: Mutex::new(None),
        })
    }

    /// Create an embedder around an explicit provider. The injected
    /// provider always wins over registry resolution.
    pub fn with_provider(config: BatchEmbedderConfig, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let mut embedder = Self::new(config)?;
        embedder.injected = Some(provider);
        Ok(embedder)
    }

    /// Resolve providers through `registry`.
    pub fn with_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Share provider instances through `cache`.
    pub fn with_provider_cache(mut self, cache: Arc<ProviderCache>) -> Self {
        self.provider_cache = Some(cache);
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &BatchEmbedderConfig {
        &self.config
    }

    /// The provider a run would use.
    pub async fn provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        if let Some(provider) = &self.injected {
            return Ok(Arc::clone(provider));
        }

        let mut resolved = self.resolved.lock().await;
        if self.config.reuse_provider
            && let Some(provider) = resolved.as_ref()
        {
            return Ok(Arc::clone(provider));
        }

        let provider = match &self.provider_cache {
            Some(cache) => cache.get_or_create(&self.registry, &self.config.provider).await?,
            None => self.registry.create_or_fallback(&self.config.provider)?,
        };
        if self.config.reuse_provider {
            *resolved = Some(Arc::clone(&provider));
        }
        Ok(provider)
    }

    /// Embed `texts`, returning the vectors in input order and their
    /// dimension. Empty input returns `([], 0)` without touching the
    /// provider.
    pub async fn run(&self, texts: &[String]) -> Result<(Vec<Embedding>, usize)> {
        if texts.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let provider = self.provider().await?;
        let mut checkpoint = match &self.config.checkpoint_path {
            Some(path) => Some(Checkpoint::open(path, self.config.checkpoint_include_text).await?),
            None => None,
        };

        let result = self.run_batches(provider.as_ref(), texts, checkpoint.as_mut()).await;

        if let Some(checkpoint) = checkpoint {
            match (&result, checkpoint.close().await) {
                (Ok(_), Err(e)) => return Err(e),
                (Err(_), Err(e)) => warn!("Failed to close checkpoint after error: {e}"),
                _ => {}
            }
        }
        result
    }

    async fn run_batches(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        mut checkpoint: Option<&mut Checkpoint>,
    ) -> Result<(Vec<Embedding>, usize)> {
        let batch_size = self.config.batch_size;
        let total_batches = texts.len().div_ceil(batch_size);
        let mut vectors: Vec<Embedding> = Vec::with_capacity(texts.len());
        let mut dimension = provider.dimension();

        info!(
            "Embedding {} texts in {total_batches} batches with {}",
            texts.len(),
            provider.name()
        );

        for (batch_idx, batch) in texts.chunks(batch_size).enumerate() {
            let embedded = self.embed_with_retry(provider, batch, batch_idx).await?;

            let dim = *dimension.get_or_insert_with(|| embedded.first().map_or(0, Vec::len));
            if let Some(bad) = embedded.iter().find(|v| v.len() != dim) {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dim,
                    actual: bad.len(),
                });
            }

            if let Some(cp) = checkpoint.as_deref_mut() {
                cp.append(vectors.len(), batch_idx, batch, &embedded).await?;
            }
            vectors.extend(embedded);
            debug!("Batch {}/{total_batches} done", batch_idx + 1);
        }

        Ok((vectors, dimension.unwrap_or(0)))
    }

    async fn embed_with_retry(
        &self,
        provider: &dyn EmbeddingProvider,
        batch: &[String],
        batch_idx: usize,
    ) -> Result<Vec<Embedding>> {
        let max_retries = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            let outcome = provider.embed_documents(batch).await.and_then(|vectors| {
                if vectors.len() == batch.len() {
                    Ok(vectors)
                } else {
                    Err(EmbeddingError::InvalidResponse(format!(
                        "expected {} vectors, got {}",
                        batch.len(),
                        vectors.len()
                    )))
                }
            });

            match outcome {
                Ok(vectors) => return Ok(vectors),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_retries => {
                    error!(
                        "Batch {batch_idx} failed after {} attempts: {e}",
                        attempt + 1
                    );
                    return Err(e);
                }
                Err(e) => {
                    let jitter = rand::random_range(0.0..=MAX_JITTER);
                    let delay = backoff_delay(attempt, self.config.backoff_base, self.config.backoff_cap, jitter);
                    warn!(
                        "Batch {batch_idx} attempt {} failed: {e}; retrying in {delay:?}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
