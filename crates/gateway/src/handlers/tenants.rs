//! Tenant admin handlers
//!
//! Enumeration, stats and confirmed deletion. Protected by JWT when a
//! secret is configured.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;
use chatforge_common::auth::require_admin;
use chatforge_common::errors::{AppError, Result};
use chatforge_common::TenantId;

fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    require_admin(state.jwt.as_deref(), auth_header)
}

/// List all tenants present in the vector store.
pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    check_admin(&state, &headers)?;

    let tenants = state.admin.list_tenants().await.map_err(AppError::from)?;
    Ok(Json(json!({
        "success": true,
        "total": tenants.len(),
        "tenants": tenants,
    })))
}

/// Stats for one tenant.
pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>> {
    check_admin(&state, &headers)?;
    let tenant = TenantId::parse(&tenant_id)?;

    let stats = state.admin.stats(&tenant).await.map_err(AppError::from)?;
    Ok(Json(json!({
        "success": true,
        "tenant_id": stats.tenant_id,
        "document_count": stats.document_count,
        "chunk_count": stats.chunk_count,
        "collection_name": stats.collection_name,
        "last_updated": stats.last_updated,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub confirm: bool,
}

/// Delete every vector of a tenant. Requires `?confirm=true`.
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Value>> {
    check_admin(&state, &headers)?;
    let tenant = TenantId::parse(&tenant_id)?;

    let deleted = state
        .admin
        .delete_tenant(&tenant, params.confirm)
        .await
        .map_err(AppError::from)?;

    Ok(Json(json!({
        "success": true,
        "tenant_id": tenant.as_str(),
        "deleted_points": deleted,
    })))
}
