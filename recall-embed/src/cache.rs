//! LRU cache in front of any embedding provider.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use recall_core::embedding::EmbeddingProvider;
use recall_core::{Embedding, Result};

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from the cache.
    pub hits: u64,
    /// Forwarded to the inner provider.
    pub misses: u64,
}

/// Memoizes embeddings by exact input text.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Embedding>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for CachedEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEmbedder")
            .field("model", &self.inner.model_name())
            .field("capacity", &self.cache.lock().cap())
            .finish_non_exhaustive()
    }
}

impl CachedEmbedder {
    /// Wrap `inner` with a cache of `capacity` entries.
    #[must_use]
    pub fn new(inner: Arc<dyn EmbeddingProvider>, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, text: &str) -> Option<Embedding> {
        let found = self.cache.lock().get(text).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        if let Some(hit) = self.lookup(text) {
            trace!(chars = text.len(), "embedding cache hit");
            return Ok(hit);
        }
        let embedding = self.inner.embed(text).await?;
        self.cache.lock().put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let mut out: Vec<Option<Embedding>> = texts.iter().map(|t| self.lookup(t)).collect();
        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            let batch: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let fresh = self.inner.embed_batch(&batch).await?;
            let mut cache = self.cache.lock();
            for (i, embedding) in missing.into_iter().zip(fresh) {
                cache.put(texts[i].to_string(), embedding.clone());
                out[i] = Some(embedding);
            }
        }
        out.into_iter()
            .map(|e| {
                e.ok_or_else(|| {
                    recall_core::RecallError::Dependency(
                        "embedding batch returned too few vectors".into(),
                    )
                })
            })
            .collect()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::embedding::HashingEmbeddingProvider;

    fn cached(capacity: usize) -> CachedEmbedder {
        CachedEmbedder::new(
            Arc::new(HashingEmbeddingProvider::new(16)),
            NonZeroUsize::new(capacity).expect("non-zero"),
        )
    }

    #[tokio::test]
    async fn repeated_text_hits_cache() {
        let c = cached(4);
        let a = c.embed("same text").await.expect("first");
        let b = c.embed("same text").await.expect("second");
        assert_eq!(a, b);
        assert_eq!(c.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn batch_only_fetches_misses() {
        let c = cached(8);
        c.embed("one").await.expect("warm");
        let out = c.embed_batch(&["one", "two", "three"]).await.expect("batch");
        assert_eq!(out.len(), 3);
        assert_eq!(c.stats().hits, 1);
        assert_eq!(c.stats().misses, 3);
        assert_eq!(out[0], c.embed("one").await.expect("again"));
    }

    #[tokio::test]
    async fn least_recent_entry_is_evicted() {
        let c = cached(1);
        c.embed("a").await.expect("a");
        c.embed("b").await.expect("b");
        c.embed("a").await.expect("a again");
        assert_eq!(c.stats().hits, 0);
    }
}
