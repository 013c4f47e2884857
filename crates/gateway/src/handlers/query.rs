//! Query handlers
//!
//! Blocking query, SSE streaming (`data: {type: token|done|error}` lines),
//! semantic search and the hybrid entry point.

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::state::AppState;
use chatforge_common::errors::{AppError, Result};
use chatforge_query::QueryOptions;

#[derive(Debug, Deserialize, Validate)]
pub struct QueryRequest {
    pub tenant_id: String,

    #[validate(length(min = 3, max = 1000))]
    pub question: String,

    #[serde(default)]
    pub options: QueryOptions,
}

/// Blocking RAG query.
pub async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Value>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("question".to_string()),
    })?;
    let tenant = chatforge_common::TenantId::parse(&request.tenant_id)?;

    let answer = state
        .query
        .query(&tenant, &request.question, request.options)
        .await?;

    Ok(Json(json!({
        "success": true,
        "text": answer.text,
        "sources": answer.sources,
        "confidence": answer.confidence,
        "usage": answer.usage,
        "latency_ms": answer.latency_ms,
        "cached": answer.cached,
        "route": answer.route,
    })))
}

/// Streaming RAG query over SSE. Frames:
/// `{"type":"token","delta":...}`, `{"type":"done"}`,
/// `{"type":"error","message":...}`. Sources ride on the first frame.
pub async fn stream(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("question".to_string()),
    })?;
    let tenant = chatforge_common::TenantId::parse(&request.tenant_id)?;

    let answer_stream = state
        .query
        .stream_query(&tenant, &request.question, request.options)
        .await?;

    let events = answer_stream
        .map(|frame| {
            let payload = match frame {
                Ok(chunk) => {
                    if let Some(sources) = chunk.sources {
                        json!({"type": "token", "delta": chunk.delta, "sources": sources})
                    } else {
                        json!({"type": "token", "delta": chunk.delta})
                    }
                }
                Err(e) => json!({"type": "error", "message": e.to_string()}),
            };
            Ok(Event::default().data(payload.to_string()))
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().data(json!({"type": "done"}).to_string()))
        }));

    Ok(Sse::new(events))
}

#[derive(Debug, Deserialize)]
pub struct SemanticSearchRequest {
    pub tenant_id: String,
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// Plain semantic search, no generation.
pub async fn semantic_search(
    State(state): State<AppState>,
    Json(request): Json<SemanticSearchRequest>,
) -> Result<Json<Value>> {
    let tenant = chatforge_common::TenantId::parse(&request.tenant_id)?;

    let results = state
        .query
        .semantic_search(&tenant, &request.query, request.limit)
        .await?;

    Ok(Json(json!({
        "success": true,
        "total": results.len(),
        "results": results,
    })))
}

/// Hybrid query; currently backed by the vector path.
pub async fn hybrid(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Value>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("question".to_string()),
    })?;
    let tenant = chatforge_common::TenantId::parse(&request.tenant_id)?;

    let answer = state
        .query
        .hybrid_query(&tenant, &request.question, request.options)
        .await?;

    Ok(Json(json!({
        "success": true,
        "text": answer.text,
        "sources": answer.sources,
        "confidence": answer.confidence,
        "usage": answer.usage,
        "latency_ms": answer.latency_ms,
        "cached": answer.cached,
        "route": answer.route,
    })))
}
