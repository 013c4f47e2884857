//! Qdrant-backed vector store
//!
//! Holds a small pool of client handles (picked at random per call) and maps
//! the narrow [`VectorStore`] contract onto the Qdrant API. All point-level
//! calls inherit the client timeout; scroll pages get the longer scan
//! timeout.

use super::{ChunkPoint, PayloadFilter, RetrievedPoint, VectorStore};
use crate::config::VectorConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointId, PointStruct, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Qdrant implementation of the vector gateway.
pub struct QdrantStore {
    clients: Vec<Qdrant>,
    scroll_timeout: Duration,
}

impl QdrantStore {
    /// Build the client pool from configuration.
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let pool_size = config.pool_size.max(1);
        let mut clients = Vec::with_capacity(pool_size);

        for _ in 0..pool_size {
            let mut builder = Qdrant::from_url(&config.url)
                .timeout(Duration::from_secs(config.timeout_secs));
            if let Some(ref key) = config.api_key {
                builder = builder.api_key(key.clone());
            }
            let client = builder.build().map_err(|e| AppError::VectorStore {
                message: format!("Failed to create Qdrant client: {e}"),
            })?;
            clients.push(client);
        }

        Ok(Self {
            clients,
            scroll_timeout: Duration::from_secs(config.scroll_timeout_secs),
        })
    }

    /// A random handle from the pool.
    fn client(&self) -> &Qdrant {
        let idx = rand::thread_rng().gen_range(0..self.clients.len());
        &self.clients[idx]
    }

    fn store_err(context: &str, e: impl std::fmt::Display) -> AppError {
        AppError::VectorStore {
            message: format!("{context}: {e}"),
        }
    }
}

/// Translate an equality filter into a Qdrant filter.
fn to_qdrant_filter(filter: &PayloadFilter) -> Filter {
    let conditions: Vec<Condition> = filter
        .matches
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => Condition::matches(key.clone(), s.clone()),
            serde_json::Value::Bool(b) => Condition::matches(key.clone(), *b),
            serde_json::Value::Number(n) => {
                Condition::matches(key.clone(), n.as_i64().unwrap_or_default())
            }
            other => Condition::matches(key.clone(), other.to_string()),
        })
        .collect();

    Filter::must(conditions)
}

/// Flatten a Qdrant payload map into plain JSON.
fn payload_to_json(
    payload: std::collections::HashMap<String, qdrant_client::qdrant::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    payload
        .into_iter()
        .map(|(k, v)| (k, v.into_json()))
        .collect()
}

fn point_id_to_string(id: Option<PointId>) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(s)) => s,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        let client = self.client();

        let exists = client
            .collection_exists(collection)
            .await
            .map_err(|e| Self::store_err("collection_exists", e))?;
        if exists {
            return Ok(());
        }

        debug!(collection, dimension, "Creating vector collection");
        client
            .create_collection(
                CreateCollectionBuilder::new(collection).vectors_config(
                    VectorParamsBuilder::new(dimension as u64, Distance::Cosine),
                ),
            )
            .await
            .map_err(|e| Self::store_err("create_collection", e))?;
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        self.client()
            .collection_exists(collection)
            .await
            .map_err(|e| Self::store_err("collection_exists", e))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let response = self
            .client()
            .list_collections()
            .await
            .map_err(|e| Self::store_err("list_collections", e))?;
        Ok(response
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn upsert(&self, collection: &str, points: Vec<ChunkPoint>) -> Result<()> {
        let qdrant_points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                let payload: Payload = Payload::from(p.payload);
                PointStruct::new(p.id.to_string(), p.vector, payload)
            })
            .collect();

        self.client()
            .upsert_points(UpsertPointsBuilder::new(collection, qdrant_points).wait(true))
            .await
            .map_err(|e| Self::store_err("upsert_points", e))?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<RetrievedPoint>> {
        let mut builder =
            SearchPointsBuilder::new(collection, vector.to_vec(), limit as u64).with_payload(true);
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }

        let response = self
            .client()
            .search_points(builder)
            .await
            .map_err(|e| Self::store_err("search_points", e))?;

        Ok(response
            .result
            .into_iter()
            .map(|p| RetrievedPoint {
                id: point_id_to_string(p.id),
                score: p.score.clamp(0.0, 1.0),
                payload: payload_to_json(p.payload),
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<RetrievedPoint>, Option<String>)> {
        let mut builder = ScrollPointsBuilder::new(collection)
            .limit(limit as u32)
            .with_payload(true);
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }
        if let Some(offset) = offset {
            builder = builder.offset(PointId::from(offset));
        }

        let response = tokio::time::timeout(self.scroll_timeout, self.client().scroll(builder))
            .await
            .map_err(|_| AppError::Timeout {
                operation: "vector_scroll".to_string(),
                timeout_ms: self.scroll_timeout.as_millis() as u64,
            })?
            .map_err(|e| Self::store_err("scroll", e))?;

        let next = response
            .next_page_offset
            .map(|id| point_id_to_string(Some(id)))
            .filter(|s| !s.is_empty());

        let points = response
            .result
            .into_iter()
            .map(|p| RetrievedPoint {
                id: point_id_to_string(p.id),
                score: 0.0,
                payload: payload_to_json(p.payload),
            })
            .collect();

        Ok((points, next))
    }

    async fn count(&self, collection: &str, filter: Option<&PayloadFilter>) -> Result<u64> {
        let mut builder = CountPointsBuilder::new(collection).exact(true);
        if let Some(filter) = filter {
            builder = builder.filter(to_qdrant_filter(filter));
        }

        let response = self
            .client()
            .count(builder)
            .await
            .map_err(|e| Self::store_err("count", e))?;

        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn delete_by_filter(&self, collection: &str, filter: &PayloadFilter) -> Result<u64> {
        // Qdrant's delete does not report the removed count; count first.
        let matched = self.count(collection, Some(filter)).await?;
        if matched == 0 {
            return Ok(0);
        }

        self.client()
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(to_qdrant_filter(filter))
                    .wait(true),
            )
            .await
            .map_err(|e| Self::store_err("delete_points", e))?;

        Ok(matched)
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.client()
            .delete_collection(collection)
            .await
            .map_err(|e| Self::store_err("delete_collection", e))?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        self.client()
            .health_check()
            .await
            .map_err(|e| Self::store_err("health_check", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_translation_handles_value_kinds() {
        let filter = PayloadFilter::tenant("acme")
            .and("chunk_index", serde_json::Value::from(3))
            .and("takeover", serde_json::Value::Bool(true));
        let qf = to_qdrant_filter(&filter);
        assert_eq!(qf.must.len(), 3);
    }

    #[test]
    fn point_id_roundtrip() {
        let id = PointId::from("6dca4f18-0000-0000-0000-000000000000".to_string());
        assert_eq!(
            point_id_to_string(Some(id)),
            "6dca4f18-0000-0000-0000-000000000000"
        );
        assert_eq!(point_id_to_string(None), "");
    }
}
