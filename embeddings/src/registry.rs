//! Provider registry with alias resolution.
//!
//! Providers are registered under a canonical name plus any number of
//! aliases. Names are trimmed and lowercased before lookup, so `" OA "`,
//! `oa` and `openai` all resolve to the same factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EmbeddingError, Result};
use crate::provider::{EmbeddingProvider, HashingProvider, OpenAIProvider};

/// Builds a provider from settings.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderSettings) -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync>;

/// Everything needed to construct a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider name or alias.
    pub provider: String,

    /// Model; the provider default when absent.
    #[serde(default)]
    pub model: Option<String>,

    /// API key; falls back to `OPENAI_API_KEY` for `openai`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Endpoint base URL; the provider default when absent.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Requested output dimension.
    #[serde(default)]
    pub dimensions: Option<usize>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self::new("openai")
    }
}

impl ProviderSettings {
    /// Settings for the named provider with every option defaulted.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
            api_key: None,
            base_url: None,
            dimensions: None,
        }
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }
}

/// Fallback dimension for a provider/model pair when the provider does not
/// report one.
pub fn default_dimension(provider: &str, model: Option<&str>) -> usize {
    let provider = provider.trim().to_lowercase();
    match provider.as_str() {
        "openai" | "oa" => match model {
            Some(m) if m.contains("large") => 3072,
            _ => 1536,
        },
        "vllm" | "sglang" => {
            let model = model.unwrap_or(LOCAL_DEFAULT_MODEL);
            if model.contains("large") {
                1024
            } else if model.contains("base") {
                768
            } else {
                384
            }
        }
        _ => HashingProvider::DEFAULT_DIMENSION,
    }
}

const LOCAL_DEFAULT_MODEL: &str = "BAAI/bge-small-en-v1.5";
const OLLAMA_DEFAULT_MODEL: &str = "nomic-embed-text";

/// Name → factory table.
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
    aliases: BTreeMap<String, String>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_providers())
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProviderRegistry {
    /// A registry with no providers.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    /// A registry with `openai`, `vllm`, `sglang`, `ollama` and `hashing`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let builtins: [(&str, ProviderFactory, &[&str]); 5] = [
            ("openai", Arc::new(build_openai), &["oa"]),
            (
                "vllm",
                compatible("vllm", "http://localhost:8006/v1", LOCAL_DEFAULT_MODEL),
                &[],
            ),
            (
                "sglang",
                compatible("sglang", "http://localhost:8007/v1", LOCAL_DEFAULT_MODEL),
                &[],
            ),
            (
                "ollama",
                compatible("ollama", "http://localhost:8005/v1", OLLAMA_DEFAULT_MODEL),
                &[],
            ),
            (
                "hashing",
                Arc::new(build_hashing),
                &[
                    "huggingface",
                    "hf",
                    "sentence_transformer",
                    "sentence-transformer",
                    "local",
                ],
            ),
        ];
        for (name, factory, aliases) in builtins {
            registry.insert(name, factory, aliases);
        }
        registry
    }

    /// Trim, lowercase and resolve aliases.
    pub fn canonical_name(&self, name: &str) -> String {
        let key = name.trim().to_lowercase();
        self.aliases.get(&key).cloned().unwrap_or(key)
    }

    /// Register a provider. Fails if the name exists and `overwrite` is
    /// false.
    pub fn register(
        &mut self,
        name: &str,
        factory: ProviderFactory,
        aliases: &[&str],
        overwrite: bool,
    ) -> Result<()> {
        let key = self.canonical_name(name);
        if key.is_empty() {
            return Err(EmbeddingError::Validation("provider name must not be empty".to_string()));
        }
        if !overwrite && self.factories.contains_key(&key) {
            return Err(EmbeddingError::Validation(format!(
                "provider '{key}' already exists (set overwrite to replace)"
            )));
        }
        self.insert(&key, factory, aliases);
        info!("Registered embedding provider {key}");
        Ok(())
    }

    fn insert(&mut self, key: &str, factory: ProviderFactory, aliases: &[&str]) {
        self.factories.insert(key.to_string(), factory);
        for alias in aliases {
            let alias_key = alias.trim().to_lowercase();
            debug!("Registered alias {alias_key} -> {key}");
            self.aliases.insert(alias_key, key.to_string());
        }
    }

    /// Canonical provider names, sorted. Aliases are not included.
    pub fn available_providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Alias → canonical name table.
    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    /// Build the provider named in `settings`.
    pub fn create(&self, settings: &ProviderSettings) -> Result<Arc<dyn EmbeddingProvider>> {
        let key = self.canonical_name(&settings.provider);
        let Some(factory) = self.factories.get(&key) else {
            return Err(EmbeddingError::UnknownProvider {
                name: settings.provider.clone(),
                available: self.available_providers().join(", "),
            });
        };
        let provider = factory(settings)?;
        debug!("Created embedding provider {key} (model {})", provider.model());
        Ok(provider)
    }

    /// Build the named provider, or the first canonical provider that can be
    /// built from the same settings if that fails.
    pub fn create_or_fallback(&self, settings: &ProviderSettings) -> Result<Arc<dyn EmbeddingProvider>> {
        let first_error = match self.create(settings) {
            Ok(provider) => return Ok(provider),
            Err(e) => e,
        };
        warn!(
            "Could not create provider '{}': {first_error}; trying registered providers",
            settings.provider
        );

        let requested = self.canonical_name(&settings.provider);
        for (name, factory) in &self.factories {
            if *name == requested {
                continue;
            }
            let candidate = ProviderSettings {
                provider: name.clone(),
                ..settings.clone()
            };
            match factory(&candidate) {
                Ok(provider) => {
                    warn!("Falling back to embedding provider {name}");
                    return Ok(provider);
                }
                Err(e) => debug!("Provider {name} unavailable: {e}"),
            }
        }

        Err(EmbeddingError::ProviderNotConfigured(format!(
            "no provider could be built for '{}': {first_error}",
            settings.provider
        )))
    }
}

fn build_openai(settings: &ProviderSettings) -> Result<Arc<dyn EmbeddingProvider>> {
    let mut provider = OpenAIProvider::new();
    if let Some(key) = &settings.api_key {
        provider = provider.with_api_key(key);
    }
    if !provider.has_api_key() {
        return Err(EmbeddingError::ProviderNotConfigured(
            "openai requires an API key (set OPENAI_API_KEY)".to_string(),
        ));
    }
    if let Some(url) = &settings.base_url {
        provider = provider.with_base_url(url);
    }
    if let Some(model) = &settings.model {
        provider = provider.with_model(model);
    }
    if let Some(dims) = settings.dimensions {
        provider = provider.with_dimensions(dims);
    }
    Ok(Arc::new(provider))
}

/// Factory for an OpenAI-compatible local server.
fn compatible(name: &'static str, base_url: &'static str, model: &'static str) -> ProviderFactory {
    Arc::new(move |settings: &ProviderSettings| -> Result<Arc<dyn EmbeddingProvider>> {
        let mut provider = OpenAIProvider::new()
            .with_name(name)
            .without_api_key()
            .with_base_url(settings.base_url.as_deref().unwrap_or(base_url))
            .with_model(settings.model.as_deref().unwrap_or(model));
        if let Some(key) = &settings.api_key {
            provider = provider.with_api_key(key);
        }
        if let Some(dims) = settings.dimensions {
            provider = provider.with_dimensions(dims);
        }
        info!(
            "Creating {name} embedding provider with model {} at {}",
            provider.model(),
            settings.base_url.as_deref().unwrap_or(base_url)
        );
        Ok(Arc::new(provider))
    })
}

fn build_hashing(settings: &ProviderSettings) -> Result<Arc<dyn EmbeddingProvider>> {
    let dimension = settings
        .dimensions
        .unwrap_or(HashingProvider::DEFAULT_DIMENSION);
    let mut provider = HashingProvider::new(dimension);
    if let Some(model) = &settings.model {
        provider = provider.with_model(model);
    }
    Ok(Arc::new(provider))
}
