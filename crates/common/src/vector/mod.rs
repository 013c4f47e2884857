//! Vector store gateway
//!
//! A narrow contract over the ANN store: collection management, point
//! upsert/search/scroll/count and filtered deletion. One collection per
//! tenant, cosine distance. The concrete provider sits behind the
//! [`VectorStore`] trait; a Qdrant implementation and an in-memory
//! implementation (for tests) are provided.

mod memory;
mod qdrant;

pub use memory::MemoryVectorStore;
pub use qdrant::QdrantStore;

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A point to be written into a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    /// Carries at least `tenant_id`, `document_id`, `chunk_index`,
    /// `total_chunks`, `source`, `modality` and the chunk `text`.
    pub payload: serde_json::Map<String, Value>,
}

/// A point returned from search or scroll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedPoint {
    pub id: String,
    /// Cosine similarity in [0, 1]; zero for scroll results.
    pub score: f32,
    pub payload: serde_json::Map<String, Value>,
}

impl RetrievedPoint {
    /// Payload field as a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// The chunk text carried in the payload.
    pub fn text(&self) -> &str {
        self.payload_str("text").unwrap_or_default()
    }
}

/// Equality-match payload filter. All conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub matches: Vec<(String, Value)>,
}

impl PayloadFilter {
    /// Filter on a tenant id.
    pub fn tenant(tenant_id: &str) -> Self {
        Self::default().and("tenant_id", Value::String(tenant_id.to_string()))
    }

    /// Add another equality condition.
    pub fn and(mut self, key: &str, value: Value) -> Self {
        self.matches.push((key.to_string(), value));
        self
    }

    /// Whether a payload satisfies every condition.
    pub fn accepts(&self, payload: &serde_json::Map<String, Value>) -> bool {
        self.matches
            .iter()
            .all(|(k, v)| payload.get(k) == Some(v))
    }
}

/// Capability set consumed by ingestion, query and tenant admin.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist yet.
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()>;

    /// Whether the collection exists.
    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    /// All collection names.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Upsert points. Writing the same point id twice replaces the point,
    /// which makes batch retries idempotent.
    async fn upsert(&self, collection: &str, points: Vec<ChunkPoint>) -> Result<()>;

    /// ANN search, scores are cosine similarity in [0, 1].
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<RetrievedPoint>>;

    /// Paginated scan. `offset` is the cursor returned by the previous page.
    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<RetrievedPoint>, Option<String>)>;

    /// Count points matching the filter.
    async fn count(&self, collection: &str, filter: Option<&PayloadFilter>) -> Result<u64>;

    /// Delete points matching the filter, returning how many were removed.
    async fn delete_by_filter(&self, collection: &str, filter: &PayloadFilter) -> Result<u64>;

    /// Drop a whole collection.
    async fn delete_collection(&self, collection: &str) -> Result<()>;

    /// Reachability check for /health.
    async fn health(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_accepts_matching_payload() {
        let filter = PayloadFilter::tenant("acme").and("document_id", Value::String("d1".into()));

        let mut payload = serde_json::Map::new();
        payload.insert("tenant_id".into(), Value::String("acme".into()));
        payload.insert("document_id".into(), Value::String("d1".into()));
        payload.insert("chunk_index".into(), Value::from(0));
        assert!(filter.accepts(&payload));

        payload.insert("tenant_id".into(), Value::String("other".into()));
        assert!(!filter.accepts(&payload));
    }

    #[test]
    fn retrieved_point_text_defaults_empty() {
        let p = RetrievedPoint {
            id: "x".into(),
            score: 0.5,
            payload: serde_json::Map::new(),
        };
        assert_eq!(p.text(), "");
    }
}
