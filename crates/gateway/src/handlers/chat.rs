//! Chat surface handlers
//!
//! The widget-facing JSON API: sessions, messages, history, escalation and
//! the agent-side message endpoint. Responses use a `success` envelope.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chatforge_conversation::TurnOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::AppState;
use chatforge_common::errors::{AppError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub client_id: Option<String>,
    pub product_id: Option<i64>,
    pub session_token: Option<String>,
    pub visitor_id: Option<String>,
    pub room_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub success: bool,
    pub room_id: Uuid,
    pub messages: Vec<Value>,
    pub is_new_session: bool,
    pub session_token: String,
    pub visitor_id: String,
}

/// Resolve or create a widget session.
pub async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>> {
    let tenant = state
        .resolve_tenant(request.client_id.as_deref(), request.product_id)
        .await?;

    let handle = state
        .conversation
        .start_session(
            &tenant,
            request.session_token.as_deref(),
            request.visitor_id.as_deref(),
            request.room_id,
        )
        .await?;

    Ok(Json(StartSessionResponse {
        success: true,
        room_id: handle.room.id,
        messages: handle
            .messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect(),
        is_new_session: handle.is_new,
        session_token: handle.room.session_token.clone(),
        visitor_id: handle.room.visitor_id,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub client_id: String,
    pub room_id: Uuid,
    pub content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handover: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<Value>,
}

/// One customer turn.
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>> {
    let tenant = state.resolve_tenant(Some(&request.client_id), None).await?;

    let outcome = state
        .conversation
        .process_message(&tenant, request.room_id, &request.content)
        .await?;

    let response = match outcome {
        TurnOutcome::Answered {
            ai_message, sources, ..
        } => SendMessageResponse {
            success: true,
            message: Some(serde_json::to_value(&ai_message)?),
            sources: Some(serde_json::to_value(&sources)?),
            handover: None,
            reason: None,
            assigned_agent: None,
        },
        TurnOutcome::Handover {
            reason,
            assigned_agent,
            system_message,
            ..
        } => SendMessageResponse {
            success: true,
            message: system_message
                .map(|m| serde_json::to_value(&m))
                .transpose()?,
            sources: None,
            handover: Some(true),
            reason: Some(reason),
            assigned_agent: assigned_agent
                .map(|a| serde_json::to_value(&a))
                .transpose()?,
        },
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub client_id: String,
    pub limit: Option<u64>,
}

/// Messages of a room, ascending.
pub async fn history(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>> {
    let tenant = state.resolve_tenant(Some(&params.client_id), None).await?;
    let messages = state
        .conversation
        .history(&tenant, room_id, params.limit.unwrap_or(200).min(1000))
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "roomId": room_id,
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsParams {
    pub visitor_id: String,
}

/// Conversation summaries for a visitor, newest first.
pub async fn conversations(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Query(params): Query<ConversationsParams>,
) -> Result<Json<Value>> {
    let tenant = state.resolve_tenant(Some(&client_id), None).await?;
    let summaries = state
        .conversation
        .conversations(&tenant, &params.visitor_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "conversations": summaries
            .iter()
            .map(|s| serde_json::json!({
                "roomId": s.room_id,
                "startedAt": s.started_at.to_rfc3339(),
                "lastMessage": s.last_message,
                "lastMessageAt": s.last_message_at.to_rfc3339(),
                "status": s.status,
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomActionRequest {
    pub client_id: String,
    pub room_id: Uuid,
}

/// Manual escalation to a human agent.
pub async fn escalate(
    State(state): State<AppState>,
    Json(request): Json<RoomActionRequest>,
) -> Result<Json<Value>> {
    let tenant = state.resolve_tenant(Some(&request.client_id), None).await?;
    let outcome = state.conversation.escalate(&tenant, request.room_id).await?;

    match outcome {
        TurnOutcome::Handover {
            assigned_agent,
            system_message,
            reason,
            ..
        } => Ok(Json(serde_json::json!({
            "success": true,
            "handover": true,
            "reason": reason,
            "assignedAgent": assigned_agent,
            "message": system_message,
            "queuePosition": state.conversation.queue_position(&tenant, request.room_id).await,
        }))),
        TurnOutcome::Answered { .. } => Err(AppError::Internal {
            message: "escalation produced no handover".to_string(),
        }),
    }
}

/// Close a session.
pub async fn close(
    State(state): State<AppState>,
    Json(request): Json<RoomActionRequest>,
) -> Result<Json<Value>> {
    let tenant = state.resolve_tenant(Some(&request.client_id), None).await?;
    state
        .conversation
        .close_session(&tenant, request.room_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "closed": true,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageRequest {
    pub client_id: String,
    pub room_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub content: String,
}

/// A human agent's message into a room.
pub async fn agent_message(
    State(state): State<AppState>,
    Json(request): Json<AgentMessageRequest>,
) -> Result<Json<Value>> {
    let tenant = state.resolve_tenant(Some(&request.client_id), None).await?;
    let message = state
        .conversation
        .agent_message(&tenant, request.room_id, request.agent_id, &request.content)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": message,
    })))
}
