//! Tenant administration over the vector store
//!
//! Tenant enumeration, per-tenant document stats and confirmed bulk
//! deletion. Listings and stats are cached for five minutes; deletion
//! invalidates both caches.

use crate::errors::IngestionError;
use chatforge_common::cache::TtlCache;
use chatforge_common::vector::{PayloadFilter, VectorStore};
use chatforge_common::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const ADMIN_CACHE_TTL: Duration = Duration::from_secs(300);
const SCROLL_PAGE: usize = 256;

/// Per-tenant statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantStats {
    pub tenant_id: String,
    pub document_count: usize,
    pub chunk_count: u64,
    pub collection_name: String,
    pub last_updated: Option<String>,
}

/// Tenant admin service.
pub struct TenantAdmin {
    store: Arc<dyn VectorStore>,
    collection_prefix: String,
    tenants_cache: TtlCache<String, Vec<String>>,
    stats_cache: TtlCache<String, TenantStats>,
}

impl TenantAdmin {
    pub fn new(store: Arc<dyn VectorStore>, collection_prefix: String) -> Self {
        Self {
            store,
            collection_prefix,
            tenants_cache: TtlCache::new(ADMIN_CACHE_TTL, 8),
            stats_cache: TtlCache::new(ADMIN_CACHE_TTL, 256),
        }
    }

    fn collection_for(&self, tenant: &TenantId) -> String {
        tenant.collection_name(&self.collection_prefix)
    }

    /// Enumerate tenants by scanning collection payloads for distinct
    /// `tenant_id` values. Cached.
    pub async fn list_tenants(&self) -> Result<Vec<String>, IngestionError> {
        if let Some(cached) = self.tenants_cache.get(&"all".to_string()).await {
            return Ok(cached);
        }

        let prefix = format!("{}_", self.collection_prefix);
        let collections = self.store.list_collections().await?;

        let mut tenants = BTreeSet::new();
        for collection in collections {
            if !collection.starts_with(&prefix) {
                continue;
            }

            let mut offset = None;
            loop {
                let (points, next) = self
                    .store
                    .scroll(&collection, None, offset, SCROLL_PAGE)
                    .await?;
                for point in &points {
                    if let Some(tenant) = point.payload_str("tenant_id") {
                        tenants.insert(tenant.to_string());
                    }
                }
                match next {
                    Some(cursor) => offset = Some(cursor),
                    None => break,
                }
            }
        }

        let tenants: Vec<String> = tenants.into_iter().collect();
        self.tenants_cache
            .set("all".to_string(), tenants.clone())
            .await;
        Ok(tenants)
    }

    /// Distinct document count and chunk totals for a tenant. A missing
    /// collection yields zeroed stats. Cached.
    pub async fn stats(&self, tenant: &TenantId) -> Result<TenantStats, IngestionError> {
        let cache_key = tenant.as_str().to_string();
        if let Some(cached) = self.stats_cache.get(&cache_key).await {
            return Ok(cached);
        }

        let collection = self.collection_for(tenant);

        if !self.store.collection_exists(&collection).await? {
            return Ok(TenantStats {
                tenant_id: tenant.as_str().to_string(),
                document_count: 0,
                chunk_count: 0,
                collection_name: collection,
                last_updated: None,
            });
        }

        let filter = PayloadFilter::tenant(tenant.as_str());
        let chunk_count = self.store.count(&collection, Some(&filter)).await?;

        let mut documents = BTreeSet::new();
        let mut last_updated: Option<String> = None;
        let mut offset = None;
        loop {
            let (points, next) = self
                .store
                .scroll(&collection, Some(&filter), offset, SCROLL_PAGE)
                .await?;
            for point in &points {
                if let Some(doc) = point.payload_str("document_id") {
                    documents.insert(doc.to_string());
                }
                if let Some(indexed_at) = point.payload_str("indexed_at") {
                    if last_updated.as_deref().map(|l| indexed_at > l).unwrap_or(true) {
                        last_updated = Some(indexed_at.to_string());
                    }
                }
            }
            match next {
                Some(cursor) => offset = Some(cursor),
                None => break,
            }
        }

        let stats = TenantStats {
            tenant_id: tenant.as_str().to_string(),
            document_count: documents.len(),
            chunk_count,
            collection_name: collection,
            last_updated,
        };

        self.stats_cache.set(cache_key, stats.clone()).await;
        Ok(stats)
    }

    /// Delete every point of a tenant. Refuses without explicit
    /// confirmation; invalidates the admin caches on success.
    pub async fn delete_tenant(
        &self,
        tenant: &TenantId,
        confirm: bool,
    ) -> Result<u64, IngestionError> {
        if !confirm {
            return Err(IngestionError::ConfirmationRequired(
                "tenant deletion requires confirm=true".to_string(),
            ));
        }

        let collection = self.collection_for(tenant);
        if !self.store.collection_exists(&collection).await? {
            return Ok(0);
        }

        let filter = PayloadFilter::tenant(tenant.as_str());
        let deleted = self.store.delete_by_filter(&collection, &filter).await?;

        self.tenants_cache.invalidate_all().await;
        self.stats_cache.invalidate(&tenant.as_str().to_string()).await;

        info!(tenant = %tenant, deleted, "Tenant data deleted");
        if deleted == 0 {
            warn!(tenant = %tenant, "Tenant deletion matched no points");
        }
        Ok(deleted)
    }
}
