//! Caller-owned provider cache.
//!
//! Constructing a provider can be expensive (HTTP clients, model handles).
//! [`ProviderCache`] keeps one instance per distinct [`ProviderSettings`],
//! keyed by a SHA-256 digest of the settings, so repeated embedder runs can
//! share it. There is no process-wide cache; whoever owns the
//! `ProviderCache` decides its lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::provider::EmbeddingProvider;
use crate::registry::{ProviderRegistry, ProviderSettings};

/// Providers keyed by a digest of their settings.
#[derive(Default)]
pub struct ProviderCache {
    providers: RwLock<HashMap<String, Arc<dyn EmbeddingProvider>>>,
}

impl ProviderCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable cache key for `settings`. The provider name is canonicalized
    /// first so aliases share an entry.
    pub fn settings_key(registry: &ProviderRegistry, settings: &ProviderSettings) -> String {
        let mut hasher = Sha256::new();
        let fields = [
            Some(registry.canonical_name(&settings.provider)),
            settings.model.clone(),
            settings.api_key.clone(),
            settings.base_url.clone(),
            settings.dimensions.map(|d| d.to_string()),
        ];
        for field in fields {
            match field {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
            hasher.update([0x1f]);
        }
        hex(&hasher.finalize())
    }

    /// Return the cached provider for `settings`, creating it through the
    /// registry on first use.
    pub async fn get_or_create(
        &self,
        registry: &ProviderRegistry,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn EmbeddingProvider>> {
        let key = Self::settings_key(registry, settings);

        if let Some(provider) = self.providers.read().await.get(&key) {
            debug!("Provider cache hit for {}", settings.provider);
            return Ok(Arc::clone(provider));
        }

        let mut providers = self.providers.write().await;
        if let Some(provider) = providers.get(&key) {
            return Ok(Arc::clone(provider));
        }
        let provider = registry.create_or_fallback(settings)?;
        providers.insert(key, Arc::clone(&provider));
        debug!("Cached new provider for {}", settings.provider);
        Ok(provider)
    }

    /// Number of cached providers.
    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }

    /// Drop every cached provider.
    pub async fn clear(&self) {
        self.providers.write().await.clear();
    }
}

/// Lowercase hex encoding.
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_same_settings_reuse_instance() {
        let registry = ProviderRegistry::default();
        let cache = ProviderCache::new();
        let settings = ProviderSettings::new("hashing").with_dimensions(16);

        let a = cache.get_or_create(&registry, &settings).await.unwrap();
        let b = cache.get_or_create(&registry, &settings).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_alias_shares_entry() {
        let registry = ProviderRegistry::default();
        let cache = ProviderCache::new();

        let a = cache
            .get_or_create(&registry, &ProviderSettings::new("hashing"))
            .await
            .unwrap();
        let b = cache
            .get_or_create(&registry, &ProviderSettings::new("HF"))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_different_settings_get_new_instance() {
        let registry = ProviderRegistry::default();
        let cache = ProviderCache::new();

        let a = cache
            .get_or_create(&registry, &ProviderSettings::new("hashing").with_dimensions(8))
            .await
            .unwrap();
        let b = cache
            .get_or_create(&registry, &ProviderSettings::new("hashing").with_dimensions(16))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len().await, 2);
        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[test]
    fn test_settings_key_distinguishes_none_from_empty() {
        let registry = ProviderRegistry::default();
        let none = ProviderSettings::new("hashing");
        let empty = ProviderSettings::new("hashing").with_model("");
        assert_ne!(
            ProviderCache::settings_key(&registry, &none),
            ProviderCache::settings_key(&registry, &empty)
        );
        assert_eq!(ProviderCache::settings_key(&registry, &none).len(), 64);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x0f]), "00ab0f");
    }
}
