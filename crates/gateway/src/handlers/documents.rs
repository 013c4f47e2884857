//! Document handlers
//!
//! Multipart upload (single and batch) feeding the indexing pipeline,
//! scoped deletion and per-tenant stats. Uploaded temp files are removed
//! once indexing finishes, success or not.

use axum::{
    extract::{Multipart, Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;
use chatforge_common::errors::{AppError, Result};
use chatforge_common::TenantId;

/// One uploaded file staged on disk.
struct StagedFile {
    path: PathBuf,
    original_name: String,
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Temp file cleanup failed");
            }
        }
    }
}

/// Pull files and fields out of a multipart body. Files are staged under
/// the OS temp dir with their original extension preserved.
async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Vec<StagedFile>, Option<String>, Value)> {
    let mut files = Vec::new();
    let mut tenant: Option<String> = None;
    let mut metadata = json!({});

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("bad multipart body: {e}"), None))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "files" => {
                let original_name = field
                    .file_name()
                    .unwrap_or("upload.txt")
                    .to_string();
                let extension = std::path::Path::new(&original_name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("txt")
                    .to_string();

                let bytes = field.bytes().await.map_err(|e| {
                    AppError::validation(format!("failed to read upload: {e}"), Some("file"))
                })?;

                let stem = std::path::Path::new(&original_name)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("upload");
                let path = std::env::temp_dir().join(format!(
                    "chatforge_{stem}_{}.{extension}",
                    Uuid::new_v4().simple()
                ));
                tokio::fs::write(&path, &bytes).await?;

                files.push(StagedFile {
                    path,
                    original_name,
                });
            }
            "tenant_id" | "tenantId" | "client_id" | "clientId" => {
                tenant = Some(field.text().await.map_err(|e| {
                    AppError::validation(format!("bad tenant field: {e}"), Some("tenant_id"))
                })?);
            }
            "metadata" => {
                let raw = field.text().await.unwrap_or_default();
                metadata = serde_json::from_str(&raw).unwrap_or(json!({}));
            }
            _ => {}
        }
    }

    Ok((files, tenant, metadata))
}

/// Index a single uploaded document.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let (files, tenant, metadata) = read_multipart(multipart).await?;
    let tenant = TenantId::parse(&tenant.ok_or_else(|| AppError::MissingField {
        field: "tenant_id".to_string(),
    })?)?;

    let file = files.into_iter().next().ok_or_else(|| AppError::MissingField {
        field: "file".to_string(),
    })?;

    let document_id = std::path::Path::new(&file.original_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(String::from);

    let outcome = state
        .index
        .index_document(
            &file.path,
            &tenant,
            document_id.as_deref(),
            metadata,
            None,
        )
        .await
        .map_err(AppError::from)?;

    Ok(Json(json!({
        "success": true,
        "skipped": outcome.skipped,
        "reason": outcome.reason,
        "document_id": outcome.document_id,
        "chunks": outcome.chunks,
        "duration_ms": outcome.duration_ms,
    })))
}

/// Index several uploaded documents; per-file failures are reported and the
/// batch continues.
pub async fn batch_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let (files, tenant, metadata) = read_multipart(multipart).await?;
    let tenant = TenantId::parse(&tenant.ok_or_else(|| AppError::MissingField {
        field: "tenant_id".to_string(),
    })?)?;

    if files.is_empty() {
        return Err(AppError::MissingField {
            field: "files".to_string(),
        });
    }

    let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
    let results = state
        .index
        .index_multiple(&paths, &tenant, metadata, None)
        .await;

    let report: Vec<Value> = results
        .iter()
        .zip(files.iter())
        .map(|(result, staged)| match &result.outcome {
            Ok(outcome) => json!({
                "file": staged.original_name,
                "success": true,
                "skipped": outcome.skipped,
                "document_id": outcome.document_id,
                "chunks": outcome.chunks,
            }),
            Err(e) => json!({
                "file": staged.original_name,
                "success": false,
                "error": e.to_string(),
            }),
        })
        .collect();

    let succeeded = report.iter().filter(|r| r["success"] == true).count();

    Ok(Json(json!({
        "success": true,
        "total": report.len(),
        "succeeded": succeeded,
        "failed": report.len() - succeeded,
        "results": report,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub document_id: Option<String>,
}

/// Delete a document's chunks, or all of a tenant's chunks.
pub async fn delete_documents(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<Value>> {
    let tenant = TenantId::parse(&tenant_id)?;

    let deleted = state
        .index
        .delete_documents(&tenant, params.document_id.as_deref())
        .await
        .map_err(AppError::from)?;

    Ok(Json(json!({
        "success": true,
        "tenant_id": tenant.as_str(),
        "document_id": params.document_id,
        "deleted_chunks": deleted,
    })))
}

/// Per-tenant document statistics.
pub async fn stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Value>> {
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
