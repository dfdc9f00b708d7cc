//! Cache of recent identification results.
//!
//! Keyed by a digest of the image bytes, so a rescan of the same photo can be
//! answered from memory when the identification service is unavailable.

use cardscan_core::Prediction;
use moka::future::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::config::CacheSettings;

/// Cache key for identification results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    digest: u64,
    len: usize,
}

impl CacheKey {
    /// Create a cache key from the image sent to identification.
    pub fn for_image(image: &[u8]) -> Self {
        let mut hasher = DefaultHasher::new();
        image.hash(&mut hasher);
        Self {
            digest: hasher.finish(),
            len: image.len(),
        }
    }
}

/// Identification cache using moka.
#[derive(Clone)]
pub struct IdentificationCache {
    cache: Cache<CacheKey, Prediction>,
}

impl IdentificationCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let cache = Cache::builder()
            .max_capacity(settings.capacity)
            .time_to_live(settings.ttl)
            .build();

        Self { cache }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Prediction> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: CacheKey, prediction: Prediction) {
        self.cache.insert(key, prediction).await;
    }
}

impl Default for IdentificationCache {
    fn default() -> Self {
        Self::new(&CacheSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pikachu() -> Prediction {
        Prediction {
            name: "Pikachu".to_string(),
            set: "Base Set".to_string(),
            number: Some("58/102".to_string()),
            rarity: "Common".to_string(),
            confidence: 0.95,
            model_version: "clip-v1".to_string(),
            processing_time_ms: 80,
        }
    }

    #[tokio::test]
    async fn test_cache_operations() {
        let cache = IdentificationCache::default();
        let key = CacheKey::for_image(b"card photo");

        // Cache miss
        assert!(cache.get(&key).await.is_none());

        cache.insert(key, pikachu()).await;

        // Same bytes give the same key
        let cached = cache.get(&CacheKey::for_image(b"card photo")).await;
        assert_eq!(cached.map(|p| p.name), Some("Pikachu".to_string()));

        // Different bytes miss
        assert!(cache.get(&CacheKey::for_image(b"other photo")).await.is_none());
    }
}
