//! Embedding cache
//!
//! Wraps a provider with a bounded LRU cache keyed by text.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::{EmbeddingError, EmbeddingProvider};

/// Provider wrapper that remembers recent embeddings
///
/// Only cache misses reach the inner provider, as a single batch.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl CachedEmbedder {
    /// Zero capacity is bumped to one entry
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut results: Vec<Option<Vec<f32>>> = {
            let mut cache = self.cache.lock();
            texts.iter().map(|text| cache.get(text).cloned()).collect()
        };

        let uncached: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, cached)| cached.is_none())
            .map(|(i, _)| i)
            .collect();

        if uncached.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let misses: Vec<String> = uncached.iter().map(|i| texts[*i].clone()).collect();
        let embedded = self.inner.embed_batch(&misses).await?;
        if embedded.len() != misses.len() {
            return Err(EmbeddingError::fatal(format!(
                "provider returned {} embeddings for {} inputs",
                embedded.len(),
                misses.len()
            )));
        }

        {
            let mut cache = self.cache.lock();
            for (idx, vector) in uncached.into_iter().zip(embedded) {
                cache.put(texts[idx].clone(), vector.clone());
                results[idx] = Some(vector);
            }
        }

        log::debug!(
            "Embedding cache: {} hit(s), {} miss(es)",
            texts.len() - misses.len(),
            misses.len()
        );

        Ok(results.into_iter().flatten().collect())
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts texts that reach the wrapped provider
    struct CountingProvider {
        inner: HashingEmbedder,
        seen: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn model_name(&self) -> &str {
            "counting"
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    fn counting() -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            inner: HashingEmbedder::new(16),
            seen: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_only_misses_reach_provider() {
        let provider = counting();
        let cached = CachedEmbedder::new(provider.clone(), 8);

        let first = cached
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let second = cached
            .embed_batch(&["b".to_string(), "c".to_string(), "a".to_string()])
            .await
            .unwrap();

        assert_eq!(provider.seen.load(Ordering::SeqCst), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second[0], first[1]);
        assert_eq!(second[2], first[0]);
        assert_eq!(cached.cache_size(), 3);
    }

    #[tokio::test]
    async fn test_full_hit_skips_provider() {
        let provider = counting();
        let cached = CachedEmbedder::new(provider.clone(), 8);

        cached.embed_one("rust").await.unwrap();
        cached.embed_one("rust").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let provider = counting();
        let cached = CachedEmbedder::new(provider.clone(), 2);

        for text in ["a", "b", "c"] {
            cached.embed_one(text).await.unwrap();
        }
        assert_eq!(cached.cache_size(), 2);

        cached.embed_one("a").await.unwrap();
        assert_eq!(provider.seen.load(Ordering::SeqCst), 4);

        cached.clear_cache();
        assert_eq!(cached.cache_size(), 0);
    }

    #[test]
    fn test_delegates_identity() {
        let cached = CachedEmbedder::new(Arc::new(HashingEmbedder::new(24)), 0);
        assert_eq!(cached.dimension(), 24);
        assert_eq!(cached.model_name(), "hashing-24");
    }
}
