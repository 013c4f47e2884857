//! In-process TTL cache with bounded capacity
//!
//! Provides:
//! - Generic get/set operations with per-entry TTL
//! - LRU-style eviction when capacity is reached
//! - Idempotent invalidation
//! - A get-or-load helper
//!
//! Used for query answers, semantic-search results, tenant listings and the
//! external agent directory. Safe for concurrent readers and writers.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_access: Instant,
}

/// A bounded TTL cache.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    default_ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache with a default TTL and a maximum entry count.
    pub fn new(default_ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            capacity: capacity.max(1),
        }
    }

    /// Get a value, refreshing its access time. Expired entries are removed.
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert with the default TTL.
    pub async fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert with a custom TTL, evicting the least recently used entry when
    /// the cache is full.
    pub async fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            // Drop expired entries first, then the least recently used one.
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.capacity {
                if let Some(lru) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&lru);
                    debug!("Cache full, evicted LRU entry");
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                last_access: now,
            },
        );
    }

    /// Remove a key. Returns whether it was present. Idempotent.
    pub async fn invalidate(&self, key: &K) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    /// Clear all entries. Idempotent.
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }

    /// Current live entry count (expired entries are pruned).
    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get from the cache, or compute and insert with the default TTL.
    ///
    /// Loader errors are not cached.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        if let Some(cached) = self.get(&key).await {
            return Ok(cached);
        }

        let value = loader().await?;
        self.set(key, value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 10);
        cache.set("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.get(&"missing".to_string()).await, None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(10), 10);
        cache.set("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn capacity_evicts_lru() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.set("a".to_string(), 1).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set("b".to_string(), 2).await;
        tokio::time::sleep(Duration::from_millis(2)).await;

        // Touch "a" so "b" becomes the LRU entry.
        cache.get(&"a".to_string()).await;
        cache.set("c".to_string(), 3).await;

        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert_eq!(cache.get(&"b".to_string()).await, None);
        assert_eq!(cache.get(&"c".to_string()).await, Some(3));
    }

    #[tokio::test]
    async fn invalidation_is_idempotent() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 10);
        cache.set("a".to_string(), 1).await;
        assert!(cache.invalidate(&"a".to_string()).await);
        assert!(!cache.invalidate(&"a".to_string()).await);
        cache.invalidate_all().await;
        cache.invalidate_all().await;
    }

    #[tokio::test]
    async fn get_or_load_caches_result() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60), 10);

        let v = cache
            .get_or_load("k".to_string(), || async { Ok::<_, ()>(9) })
            .await
            .unwrap();
        assert_eq!(v, 9);

        // Loader must not run again.
        let v = cache
            .get_or_load("k".to_string(), || async { Err(()) })
            .await
            .unwrap();
        assert_eq!(v, 9);
    }
}
