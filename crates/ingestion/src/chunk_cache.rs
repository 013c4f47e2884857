//! On-disk chunk cache
//!
//! Caches the load+split stage of indexing so re-indexing a document (same
//! tenant, id and chunking parameters) skips parsing. Embedding and storage
//! always run. One JSON file per key under the configured directory.

use crate::chunker::TextChunk;
use crate::errors::IngestionError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Cached entry layout.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedChunks {
    pub chunks: Vec<TextChunk>,
    /// Unix seconds at write time
    pub timestamp: i64,
    pub count: usize,
}

/// Disk-backed chunk cache.
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache key: `md5(tenant|document_id|chunk_size|chunk_overlap)`.
    pub fn key(tenant: &str, document_id: &str, chunk_size: usize, chunk_overlap: usize) -> String {
        let input = format!("{tenant}|{document_id}|{chunk_size}|{chunk_overlap}");
        format!("{:x}", md5::compute(input.as_bytes()))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Look up cached chunks.
    pub async fn get(&self, key: &str) -> Option<Vec<TextChunk>> {
        let path = self.path_for(key);
        let bytes = tokio::fs::read(&path).await.ok()?;

        match serde_json::from_slice::<CachedChunks>(&bytes) {
            Ok(cached) => {
                debug!(key, count = cached.count, "Chunk cache hit");
                Some(cached.chunks)
            }
            Err(e) => {
                warn!(key, error = %e, "Corrupt chunk cache entry, discarding");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    /// Store chunks under a key.
    pub async fn put(&self, key: &str, chunks: &[TextChunk]) -> Result<(), IngestionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| IngestionError::CacheError(format!("create cache dir: {e}")))?;

        let entry = CachedChunks {
            chunks: chunks.to_vec(),
            timestamp: chrono::Utc::now().timestamp(),
            count: chunks.len(),
        };

        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| IngestionError::CacheError(format!("serialize cache entry: {e}")))?;

        tokio::fs::write(self.path_for(key), bytes)
            .await
            .map_err(|e| IngestionError::CacheError(format!("write cache entry: {e}")))?;

        debug!(key, count = entry.count, "Chunk cache write");
        Ok(())
    }

    /// Remove one entry. Idempotent.
    pub async fn purge(&self, key: &str) -> Result<(), IngestionError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IngestionError::CacheError(format!("purge entry: {e}"))),
        }
    }

    /// Remove every entry. Idempotent.
    pub async fn purge_all(&self) -> Result<(), IngestionError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(IngestionError::CacheError(format!("read cache dir: {e}"))),
        };

        while let Ok(Some(entry)) = entries.next_entry().await.map_err(|e| {
            IngestionError::CacheError(format!("iterate cache dir: {e}"))
        }) {
            if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, i: usize, total: usize) -> TextChunk {
        TextChunk {
            text: text.to_string(),
            chunk_index: i,
            total_chunks: total,
        }
    }

    #[test]
    fn key_is_stable_and_parameter_sensitive() {
        let a = ChunkCache::key("acme", "faq", 1000, 100);
        let b = ChunkCache::key("acme", "faq", 1000, 100);
        let c = ChunkCache::key("acme", "faq", 500, 100);
        let d = ChunkCache::key("other", "faq", 1000, 100);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn roundtrip_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(dir.path());
        let key = ChunkCache::key("acme", "faq", 1000, 100);

        assert!(cache.get(&key).await.is_none());

        let chunks = vec![chunk("first", 0, 2), chunk("second", 1, 2)];
        cache.put(&key, &chunks).await.unwrap();

        let cached = cache.get(&key).await.unwrap();
        assert_eq!(cached, chunks);

        cache.purge(&key).await.unwrap();
        assert!(cache.get(&key).await.is_none());
        // Idempotent
        cache.purge(&key).await.unwrap();
    }

    #[tokio::test]
    async fn purge_all_clears_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(dir.path());

        for doc in ["a", "b", "c"] {
            let key = ChunkCache::key("acme", doc, 1000, 100);
            cache.put(&key, &[chunk("x", 0, 1)]).await.unwrap();
        }

        cache.purge_all().await.unwrap();
        for doc in ["a", "b", "c"] {
            let key = ChunkCache::key("acme", doc, 1000, 100);
            assert!(cache.get(&key).await.is_none());
        }
        // Idempotent even when the directory is gone
        cache.purge_all().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_entries_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChunkCache::new(dir.path());
        let key = ChunkCache::key("acme", "faq", 1000, 100);

        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join(format!("{key}.json")), b"not json")
            .await
            .unwrap();

        assert!(cache.get(&key).await.is_none());
    }
}
