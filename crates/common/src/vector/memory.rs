//! In-memory vector store
//!
//! Exact cosine search over a HashMap of collections. Used by tests and
//! local development without a running Qdrant.

use super::{ChunkPoint, PayloadFilter, RetrievedPoint, VectorStore};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Clone)]
struct StoredPoint {
    id: String,
    vector: Vec<f32>,
    payload: serde_json::Map<String, serde_json::Value>,
}

struct Collection {
    dimension: usize,
    // BTreeMap keeps scroll order stable across pages.
    points: BTreeMap<String, StoredPoint>,
}

/// An in-process [`VectorStore`].
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<BTreeMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    // Map [-1, 1] onto [0, 1] the way cosine *similarity* scores come back
    // from the real store.
    ((dot / (na * nb)) + 1.0) / 2.0
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        let mut collections = self.collections.write().await;
        collections.entry(collection.to_string()).or_insert(Collection {
            dimension,
            points: BTreeMap::new(),
        });
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(self.collections.read().await.contains_key(collection))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }

    async fn upsert(&self, collection: &str, points: Vec<ChunkPoint>) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| AppError::VectorStore {
                message: format!("collection '{collection}' does not exist"),
            })?;

        for point in points {
            if point.vector.len() != coll.dimension {
                return Err(AppError::VectorStore {
                    message: format!(
                        "dimension mismatch: expected {}, got {}",
                        coll.dimension,
                        point.vector.len()
                    ),
                });
            }
            let id = point.id.to_string();
            coll.points.insert(
                id.clone(),
                StoredPoint {
                    id,
                    vector: point.vector,
                    payload: point.payload,
                },
            );
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<RetrievedPoint>> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<RetrievedPoint> = coll
            .points
            .values()
            .filter(|p| filter.map(|f| f.accepts(&p.payload)).unwrap_or(true))
            .map(|p| RetrievedPoint {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<RetrievedPoint>, Option<String>)> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok((Vec::new(), None));
        };

        let mut page = Vec::with_capacity(limit);
        let mut next = None;

        let iter = coll
            .points
            .range(offset.unwrap_or_default()..)
            .map(|(_, p)| p)
            .filter(|p| filter.map(|f| f.accepts(&p.payload)).unwrap_or(true));

        for point in iter {
            if page.len() == limit {
                next = Some(point.id.clone());
                break;
            }
            page.push(RetrievedPoint {
                id: point.id.clone(),
                score: 0.0,
                payload: point.payload.clone(),
            });
        }

        Ok((page, next))
    }

    async fn count(&self, collection: &str, filter: Option<&PayloadFilter>) -> Result<u64> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(collection) else {
            return Ok(0);
        };

        Ok(coll
            .points
            .values()
            .filter(|p| filter.map(|f| f.accepts(&p.payload)).unwrap_or(true))
            .count() as u64)
    }

    async fn delete_by_filter(&self, collection: &str, filter: &PayloadFilter) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let before = coll.points.len();
        coll.points.retain(|_, p| !filter.accepts(&p.payload));
        Ok((before - coll.points.len()) as u64)
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn point(tenant: &str, doc: &str, idx: i64, vector: Vec<f32>) -> ChunkPoint {
        let mut payload = serde_json::Map::new();
        payload.insert("tenant_id".into(), tenant.into());
        payload.insert("document_id".into(), doc.into());
        payload.insert("chunk_index".into(), idx.into());
        payload.insert("text".into(), format!("chunk {idx} of {doc}").into());
        ChunkPoint {
            id: Uuid::new_v4(),
            vector,
            payload,
        }
    }

    #[tokio::test]
    async fn upsert_and_search() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 3).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    point("acme", "d1", 0, vec![1.0, 0.0, 0.0]),
                    point("acme", "d1", 1, vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("c", &[1.0, 0.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.9);
        assert_eq!(hits[0].payload_str("chunk_index"), None);
        assert_eq!(hits[0].payload.get("chunk_index").unwrap(), 0);
    }

    #[tokio::test]
    async fn search_respects_tenant_filter() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    point("a", "d", 0, vec![1.0, 0.0]),
                    point("b", "d", 0, vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let filter = PayloadFilter::tenant("a");
        let hits = store
            .search("c", &[1.0, 0.0], 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload_str("tenant_id"), Some("a"));
    }

    #[tokio::test]
    async fn upsert_same_id_replaces() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();

        let id = Uuid::new_v4();
        let mut p = point("a", "d", 0, vec![1.0, 0.0]);
        p.id = id;
        store.upsert("c", vec![p.clone()]).await.unwrap();
        store.upsert("c", vec![p]).await.unwrap();

        assert_eq!(store.count("c", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_by_filter_is_idempotent() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert("c", vec![point("a", "d1", 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let filter = PayloadFilter::tenant("a").and("document_id", "d1".into());
        assert_eq!(store.delete_by_filter("c", &filter).await.unwrap(), 1);
        assert_eq!(store.delete_by_filter("c", &filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scroll_paginates() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        let points: Vec<_> = (0..5).map(|i| point("a", "d", i, vec![1.0, 0.0])).collect();
        store.upsert("c", points).await.unwrap();

        let (page1, cursor) = store.scroll("c", None, None, 2).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert!(cursor.is_some());

        let (page2, cursor) = store.scroll("c", None, cursor, 2).await.unwrap();
        assert_eq!(page2.len(), 2);

        let (page3, cursor) = store.scroll("c", None, cursor, 2).await.unwrap();
        assert_eq!(page3.len(), 1);
        assert!(cursor.is_none());

        // No id appears twice across pages.
        let mut ids: Vec<_> = page1
            .iter()
            .chain(&page2)
            .chain(&page3)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn missing_collection_counts_zero() {
        let store = MemoryVectorStore::new();
        assert_eq!(store.count("nope", None).await.unwrap(), 0);
        assert!(store.search("nope", &[1.0], 5, None).await.unwrap().is_empty());
    }
}
