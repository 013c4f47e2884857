//! Inbound bridge handlers
//!
//! Events arriving from the external agent backend: an agent message typed
//! in the CRM (`widget_message_received`) and an assignment made there
//! (`agent_assigned`). Both persist first, then fan out to the room.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::state::AppState;
use chatforge_common::errors::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAgentMessage {
    pub client_id: String,
    pub room_id: Uuid,
    pub content: String,
    pub agent_email: Option<String>,
}

/// `widget_message_received`: a message written by an agent in the external
/// backend.
pub async fn widget_message_received(
    State(state): State<AppState>,
    Json(request): Json<InboundAgentMessage>,
) -> Result<Json<Value>> {
    let tenant = state.resolve_tenant(Some(&request.client_id), None).await?;

    let agent_id = match request.agent_email.as_deref() {
        Some(email) => state
            .repo
            .find_user_by_email(email)
            .await?
            .map(|u| u.id),
        None => None,
    };

    let message = state
        .conversation
        .agent_message(&tenant, request.room_id, agent_id, &request.content)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": message,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAgentAssigned {
    pub client_id: String,
    pub room_id: Uuid,
    pub agent_name: String,
    pub agent_email: String,
}

/// `agent_assigned`: the external backend routed this room to one of its
/// agents.
pub async fn agent_assigned(
    State(state): State<AppState>,
    Json(request): Json<InboundAgentAssigned>,
) -> Result<Json<Value>> {
    let tenant = state.resolve_tenant(Some(&request.client_id), None).await?;

    let room = state
        .conversation
        .assign_external_by_email(
            &tenant,
            request.room_id,
            &request.agent_name,
            &request.agent_email,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "roomId": room.id,
        "takeover": room.takeover,
        "assignedAgentId": room.assigned_agent_id,
    })))
}
