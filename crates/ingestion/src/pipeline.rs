//! Indexing pipeline
//!
//! Core logic for indexing documents: validation, idempotency probe,
//! loading, chunking, batched embedding and per-batch atomic persistence
//! into the tenant's vector collection.
//!
//! Concurrency: a process-wide semaphore caps parallel indexing jobs, a
//! second one caps parallel embedding batch groups. Point ids are derived
//! from `(tenant, document_id, chunk_index)` so batch retries are
//! idempotent and a failed document never leaves partial chunks behind.

use crate::chunk_cache::ChunkCache;
use crate::chunker::{split_text, ChunkerConfig, TextChunk};
use crate::errors::IngestionError;
use crate::loader::{load_document, validate_path, LoadedRecord};
use crate::media::MediaGateway;
use chatforge_common::config::IngestionConfig;
use chatforge_common::vector::{ChunkPoint, PayloadFilter, VectorStore};
use chatforge_common::{Embedder, TenantId};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Stages reported while a document is being indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Checking,
    Preparing,
    Processing,
    Embedding,
    Storing,
    Complete,
    Error,
}

/// A progress event for UI consumption. `progress` is weakly increasing
/// over a successful run and ends at 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Callback receiving progress events.
pub type ProgressSink = dyn Fn(ProgressEvent) + Send + Sync;

/// Result of one indexing call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexOutcome {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub document_id: String,
    pub chunks: usize,
    pub duration_ms: u64,
}

/// Per-file result of a batch indexing call.
pub struct FileResult {
    pub path: PathBuf,
    pub outcome: Result<IndexOutcome, IngestionError>,
}

/// The ingestion core service.
pub struct IndexService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    media: Arc<dyn MediaGateway>,
    cache: ChunkCache,
    config: IngestionConfig,
    collection_prefix: String,
    embedding_batch_size: usize,
    job_semaphore: Arc<Semaphore>,
    group_semaphore: Arc<Semaphore>,
    ensured_collections: Mutex<HashSet<String>>,
}

impl IndexService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        media: Arc<dyn MediaGateway>,
        config: IngestionConfig,
        collection_prefix: String,
        embedding_batch_size: usize,
    ) -> Self {
        let cache = ChunkCache::new(config.chunk_cache_dir.clone());
        Self {
            store,
            embedder,
            media,
            cache,
            job_semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            group_semaphore: Arc::new(Semaphore::new(config.max_embedding_groups.max(1))),
            config,
            collection_prefix,
            embedding_batch_size: embedding_batch_size.max(1),
            ensured_collections: Mutex::new(HashSet::new()),
        }
    }

    /// Derive the document id from an explicit value or the file stem.
    fn resolve_document_id(path: &Path, supplied: Option<&str>) -> String {
        match supplied {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "document".to_string()),
        }
    }

    /// Ensure the tenant's collection exists, memoizing the check.
    async fn ensure_collection(&self, tenant: &TenantId) -> Result<String, IngestionError> {
        let collection = tenant.collection_name(&self.collection_prefix);

        {
            let ensured = self.ensured_collections.lock().await;
            if ensured.contains(&collection) {
                return Ok(collection);
            }
        }

        self.store
            .ensure_collection(&collection, self.embedder.dimension())
            .await?;

        self.ensured_collections.lock().await.insert(collection.clone());
        Ok(collection)
    }

    /// Index one document. Runs under the job budget with a wall-clock
    /// timeout.
    #[instrument(skip(self, metadata, progress), fields(tenant = %tenant, path = %path.display()))]
    pub async fn index_document(
        &self,
        path: &Path,
        tenant: &TenantId,
        document_id: Option<&str>,
        metadata: serde_json::Value,
        progress: Option<&ProgressSink>,
    ) -> Result<IndexOutcome, IngestionError> {
        let _permit = self
            .job_semaphore
            .acquire()
            .await
            .map_err(|_| IngestionError::CacheError("job queue closed".to_string()))?;

        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        let result = tokio::time::timeout(
            timeout,
            self.index_document_inner(path, tenant, document_id, metadata, progress),
        )
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                emit(
                    progress,
                    ProgressStage::Error,
                    100,
                    Some("job timed out".to_string()),
                );
                Err(IngestionError::JobTimeout(self.config.job_timeout_secs))
            }
        }
    }

    async fn index_document_inner(
        &self,
        path: &Path,
        tenant: &TenantId,
        document_id: Option<&str>,
        metadata: serde_json::Value,
        progress: Option<&ProgressSink>,
    ) -> Result<IndexOutcome, IngestionError> {
        let start = Instant::now();

        emit(progress, ProgressStage::Checking, 5, None);

        let extension = validate_path(
            path,
            self.config.max_file_bytes,
            self.config.max_text_bytes,
        )?;
        let document_id = Self::resolve_document_id(path, document_id);
        let collection = self.ensure_collection(tenant).await?;

        // Idempotency: any chunk for (tenant, document_id) means indexed.
        let existing_filter = PayloadFilter::tenant(tenant.as_str())
            .and("document_id", json!(document_id.clone()));
        let existing = self.store.count(&collection, Some(&existing_filter)).await?;
        if existing > 0 {
            info!(document_id, existing, "Document already indexed, skipping");
            emit(progress, ProgressStage::Complete, 100, Some("already_indexed".into()));
            return Ok(IndexOutcome {
                skipped: true,
                reason: Some("already_indexed".to_string()),
                document_id,
                chunks: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        emit(progress, ProgressStage::Preparing, 10, None);

        let chunker_config = ChunkerConfig {
            chunk_size: self.config.chunk_size,
            chunk_overlap: self.config.chunk_overlap,
        };
        let cache_key = ChunkCache::key(
            tenant.as_str(),
            &document_id,
            chunker_config.chunk_size,
            chunker_config.chunk_overlap,
        );

        // A cache hit bypasses load+split; embed+store still run.
        let (chunks, record) = match self.cache.get(&cache_key).await {
            Some(chunks) => (chunks, None),
            None => {
                emit(progress, ProgressStage::Processing, 25, None);
                let record = load_document(path, &extension, self.media.as_ref()).await?;

                emit(progress, ProgressStage::Processing, 40, None);
                let chunks = split_text(&record.text, &chunker_config);
                if chunks.is_empty() {
                    return Err(IngestionError::ParseError {
                        path: path.display().to_string(),
                        message: "document produced no chunks".to_string(),
                    });
                }

                if let Err(e) = self.cache.put(&cache_key, &chunks).await {
                    warn!(error = %e, "Chunk cache write failed, continuing");
                }
                (chunks, Some(record))
            }
        };

        let total_chunks = chunks.len();
        emit(progress, ProgressStage::Embedding, 50, Some(format!("{total_chunks} chunks")));

        let points =
            self.build_points(tenant, &document_id, &chunks, record.as_ref(), &metadata, path);

        // Embed and persist in batches; groups run concurrently under the
        // embedding budget. Progress is driven by completed batches.
        let batches: Vec<Vec<(TextChunk, ChunkPoint)>> = chunks
            .into_iter()
            .zip(points)
            .collect::<Vec<_>>()
            .chunks(self.embedding_batch_size)
            .map(|b| b.to_vec())
            .collect();
        let total_batches = batches.len();
        // done count and last emitted percentage; emission happens under the
        // lock so concurrent batch completions cannot reorder progress.
        let completed = Arc::new(std::sync::Mutex::new((0usize, 50u8)));

        let results: Vec<Result<(), IngestionError>> = stream::iter(batches)
            .map(|batch| {
                let completed = completed.clone();
                let collection = collection.clone();
                async move {
                    let _group = self
                        .group_semaphore
                        .acquire()
                        .await
                        .map_err(|_| IngestionError::CacheError("embed queue closed".into()))?;

                    let texts: Vec<String> =
                        batch.iter().map(|(c, _)| c.text.clone()).collect();
                    let vectors = self
                        .embedder
                        .embed_batch(&texts)
                        .await
                        .map_err(|e| IngestionError::EmbeddingError(e.to_string()))?;

                    let points: Vec<ChunkPoint> = batch
                        .into_iter()
                        .zip(vectors)
                        .map(|((_, mut point), vector)| {
                            point.vector = vector;
                            point
                        })
                        .collect();

                    self.store.upsert(&collection, points).await?;

                    {
                        let mut state = completed.lock().unwrap_or_else(|p| p.into_inner());
                        state.0 += 1;
                        let pct =
                            (50 + (45 * state.0 / total_batches.max(1)) as u8).min(95);
                        if pct > state.1 {
                            state.1 = pct;
                            emit(progress, ProgressStage::Storing, pct, None);
                        }
                    }
                    Ok(())
                }
            })
            .buffer_unordered(self.config.max_embedding_groups.max(1))
            .collect()
            .await;

        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            // Remove anything the successful batches wrote.
            if let Err(cleanup) = self.store.delete_by_filter(&collection, &existing_filter).await
            {
                warn!(error = %cleanup, "Failed to clean up partial chunks");
            }
            emit(progress, ProgressStage::Error, 100, Some(err.to_string()));
            return Err(err);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        emit(progress, ProgressStage::Complete, 100, None);
        chatforge_common::metrics::record_ingestion(
            duration_ms as f64 / 1000.0,
            total_chunks,
            tenant.as_str(),
        );

        info!(
            document_id,
            chunks = total_chunks,
            duration_ms,
            "Document indexed"
        );

        Ok(IndexOutcome {
            skipped: false,
            reason: None,
            document_id,
            chunks: total_chunks,
            duration_ms,
        })
    }

    /// Build payload-complete points with deterministic ids; vectors are
    /// filled in at embedding time.
    fn build_points(
        &self,
        tenant: &TenantId,
        document_id: &str,
        chunks: &[TextChunk],
        record: Option<&LoadedRecord>,
        metadata: &serde_json::Value,
        path: &Path,
    ) -> Vec<ChunkPoint> {
        let now = chrono::Utc::now().to_rfc3339();
        let source = record
            .map(|r| r.source.clone())
            .unwrap_or_else(|| {
                path.file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default()
            });
        let modality = record
            .map(|r| r.modality.as_str())
            .unwrap_or("text");
        let content_hash = record.map(|r| r.content_hash.clone());

        chunks
            .iter()
            .map(|chunk| {
                let mut payload = metadata.as_object().cloned().unwrap_or_default();
                payload.insert("tenant_id".into(), json!(tenant.as_str()));
                payload.insert("document_id".into(), json!(document_id));
                payload.insert("chunk_index".into(), json!(chunk.chunk_index));
                payload.insert("total_chunks".into(), json!(chunk.total_chunks));
                payload.insert("source".into(), json!(source));
                payload.insert("modality".into(), json!(modality));
                payload.insert("processed_at".into(), json!(now));
                payload.insert("indexed_at".into(), json!(now));
                payload.insert("text".into(), json!(chunk.text));
                if let Some(ref hash) = content_hash {
                    payload.insert("content_hash".into(), json!(hash));
                }

                ChunkPoint {
                    id: point_id(tenant.as_str(), document_id, chunk.chunk_index),
                    vector: Vec::new(),
                    payload,
                }
            })
            .collect()
    }

    /// Index several files; failures are reported per file and the batch
    /// continues.
    pub async fn index_multiple(
        &self,
        paths: &[PathBuf],
        tenant: &TenantId,
        metadata: serde_json::Value,
        progress: Option<&ProgressSink>,
    ) -> Vec<FileResult> {
        let mut results = Vec::with_capacity(paths.len());

        let futures = paths.to_vec().into_iter().map(|path| {
            let metadata = metadata.clone();
            async move {
                let outcome = self
                    .index_document(&path, tenant, None, metadata, progress)
                    .await;
                FileResult {
                    path: path.clone(),
                    outcome,
                }
            }
        });

        // The job semaphore inside index_document enforces the parallelism
        // cap; drive them all concurrently here.
        let mut all = stream::iter(futures)
            .buffer_unordered(self.config.max_concurrent_jobs.max(1))
            .collect::<Vec<_>>()
            .await;

        // Keep input order for per-file reporting.
        all.sort_by_key(|r| {
            paths
                .iter()
                .position(|p| p == &r.path)
                .unwrap_or(usize::MAX)
        });
        results.extend(all);
        results
    }

    /// Delete a document's chunks, or every chunk of the tenant when no
    /// document id is given. The collection itself is kept. Idempotent.
    pub async fn delete_documents(
        &self,
        tenant: &TenantId,
        document_id: Option<&str>,
    ) -> Result<u64, IngestionError> {
        let collection = tenant.collection_name(&self.collection_prefix);
        if !self.store.collection_exists(&collection).await? {
            return Ok(0);
        }

        let mut filter = PayloadFilter::tenant(tenant.as_str());
        if let Some(doc) = document_id {
            filter = filter.and("document_id", json!(doc));

            let key = ChunkCache::key(
                tenant.as_str(),
                doc,
                self.config.chunk_size,
                self.config.chunk_overlap,
            );
            if let Err(e) = self.cache.purge(&key).await {
                warn!(error = %e, "Chunk cache purge failed");
            }
        }

        let deleted = self.store.delete_by_filter(&collection, &filter).await?;
        info!(
            tenant = %tenant,
            document_id = document_id.unwrap_or("*"),
            deleted,
            "Chunks deleted"
        );
        Ok(deleted)
    }

    /// Access to the chunk cache for admin purges.
    pub fn chunk_cache(&self) -> &ChunkCache {
        &self.cache
    }
}

/// Deterministic point id for `(tenant, document_id, chunk_index)`.
fn point_id(tenant: &str, document_id: &str, chunk_index: usize) -> Uuid {
    let name = format!("{tenant}/{document_id}/{chunk_index}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn emit(progress: Option<&ProgressSink>, stage: ProgressStage, pct: u8, detail: Option<String>) {
    if let Some(sink) = progress {
        sink(ProgressEvent {
            stage,
            progress: pct.min(100),
            detail,
        });
    }
}
