//! WebSocket realtime protocol
//!
//! Client -> server events (JSON, `type` tagged):
//! `join_room{roomId,clientId}`, `leave_room`, `typing{isTyping}`,
//! `widget-message{content}`, `agent-message{content,agentId?}`,
//! `start-conversation{visitorId?}`, `end-conversation`,
//! `get-active-conversations`.
//!
//! Server -> client: `room_joined`, `new_message`, `user_typing`,
//! `session_update`, `active-conversations`, plus an `error` event for
//! protocol violations. Room events come off the per-room broadcast hub;
//! a lagging socket skips events and reconciles via history.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use chatforge_common::TenantId;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::AppState;

/// Client -> server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientEvent {
    #[serde(rename = "join_room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        #[serde(rename = "clientId")]
        client_id: String,
    },
    #[serde(rename = "leave_room")]
    LeaveRoom,
    #[serde(rename = "typing")]
    Typing {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    #[serde(rename = "widget-message")]
    WidgetMessage { content: String },
    #[serde(rename = "agent-message")]
    AgentMessage {
        content: String,
        #[serde(rename = "agentId")]
        agent_id: Option<Uuid>,
    },
    #[serde(rename = "start-conversation")]
    StartConversation {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "visitorId")]
        visitor_id: Option<String>,
    },
    #[serde(rename = "end-conversation")]
    EndConversation,
    #[serde(rename = "get-active-conversations")]
    GetActiveConversations {
        #[serde(rename = "clientId")]
        client_id: String,
    },
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Per-connection state: the joined room and the task forwarding its
/// broadcast events to this socket.
struct Connection {
    room: Option<(Uuid, TenantId)>,
    forward_task: Option<tokio::task::JoinHandle<()>>,
}

impl Connection {
    fn leave(&mut self) {
        if let Some(task) = self.forward_task.take() {
            task.abort();
        }
        self.room = None;
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound frames are funneled through one channel so room events and
    // direct replies cannot interleave mid-frame.
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        room: None,
        forward_task: None,
    };

    while let Some(Ok(frame)) = ws_receiver.next().await {
        match frame {
            WsMessage::Text(text) => {
                let event: ClientEvent = match serde_json::from_str(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "Invalid websocket frame");
                        send(&tx, json!({"type": "error", "message": "invalid frame"})).await;
                        continue;
                    }
                };

                if let Err(e) = handle_event(event, &state, &tx, &mut conn).await {
                    send(&tx, json!({"type": "error", "message": e.to_string()})).await;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    conn.leave();
    sender_task.abort();
}

async fn send(tx: &mpsc::Sender<String>, payload: serde_json::Value) {
    let _ = tx.send(payload.to_string()).await;
}

/// Subscribe a connection to a room's broadcast channel.
fn start_forwarding(
    state: &AppState,
    tx: mpsc::Sender<String>,
    room_id: Uuid,
    tenant: &TenantId,
) -> tokio::task::JoinHandle<()> {
    let mut receiver = state.hub.subscribe(room_id, tenant.as_str());
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if let Ok(frame) = serde_json::to_string(&event) {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // Best-effort delivery; the store is authoritative.
                    warn!(skipped, "Websocket subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_event(
    event: ClientEvent,
    state: &AppState,
    tx: &mpsc::Sender<String>,
    conn: &mut Connection,
) -> chatforge_common::Result<()> {
    match event {
        ClientEvent::JoinRoom { room_id, client_id } => {
            let tenant = state.resolve_tenant(Some(&client_id), None).await?;
            // The room must exist in this tenant before we fan anything out.
            state
                .conversation
                .history(&tenant, room_id, 1)
                .await?;

            conn.leave();
            conn.forward_task = Some(start_forwarding(state, tx.clone(), room_id, &tenant));
            conn.room = Some((room_id, tenant));

            send(tx, json!({"type": "room_joined", "roomId": room_id})).await;
        }

        ClientEvent::LeaveRoom => {
            conn.leave();
        }

        ClientEvent::Typing { is_typing } => {
            if let Some((room_id, ref tenant)) = conn.room {
                state.hub.emit(
                    room_id,
                    tenant.as_str(),
                    chatforge_conversation::RoomEvent::UserTyping {
                        sender: "customer".to_string(),
                        is_typing,
                    },
                );
            }
        }

        ClientEvent::WidgetMessage { content } => {
            let Some((room_id, ref tenant)) = conn.room else {
                send(tx, json!({"type": "error", "message": "join a room first"})).await;
                return Ok(());
            };
            // The turn's events (message, typing, answer) arrive through
            // the room subscription.
            state
                .conversation
                .process_message(tenant, room_id, &content)
                .await?;
        }

        ClientEvent::AgentMessage { content, agent_id } => {
            let Some((room_id, ref tenant)) = conn.room else {
                send(tx, json!({"type": "error", "message": "join a room first"})).await;
                return Ok(());
            };
            state
                .conversation
                .agent_message(tenant, room_id, agent_id, &content)
                .await?;
        }

        ClientEvent::StartConversation {
            client_id,
            visitor_id,
        } => {
            let tenant = state.resolve_tenant(Some(&client_id), None).await?;
            let handle = state
                .conversation
                .start_session(&tenant, None, visitor_id.as_deref(), None)
                .await?;

            conn.leave();
            conn.forward_task = Some(start_forwarding(state, tx.clone(), handle.room.id, &tenant));
            conn.room = Some((handle.room.id, tenant));

            send(
                tx,
                json!({
                    "type": "room_joined",
                    "roomId": handle.room.id,
                    "sessionToken": handle.room.session_token,
                    "visitorId": handle.room.visitor_id,
                    "isNewSession": handle.is_new,
                }),
            )
            .await;
        }

        ClientEvent::EndConversation => {
            if let Some((room_id, tenant)) = conn.room.take() {
                conn.leave();
                state.conversation.close_session(&tenant, room_id).await?;
            }
        }

        ClientEvent::GetActiveConversations { client_id } => {
            let tenant = state.resolve_tenant(Some(&client_id), None).await?;
            let rooms = state.repo.list_active_rooms(tenant.as_str()).await?;
            send(
                tx,
                json!({
                    "type": "active-conversations",
                    "conversations": rooms
                        .iter()
                        .map(|r| json!({
                            "roomId": r.id,
                            "visitorId": r.visitor_id,
                            "takeover": r.takeover,
                            "assignedAgentId": r.assigned_agent_id,
                            "customerEmail": r.customer_email,
                            "lastActivityAt": r.last_activity_at.to_rfc3339(),
                        }))
                        .collect::<Vec<_>>(),
                }),
            )
            .await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_deserialize() {
        let join: ClientEvent = serde_json::from_str(
            r#"{"type":"join_room","roomId":"7f1a2f10-0000-0000-0000-000000000001","clientId":"acme"}"#,
        )
        .unwrap();
        assert!(matches!(join, ClientEvent::JoinRoom { .. }));

        let typing: ClientEvent =
            serde_json::from_str(r#"{"type":"typing","isTyping":true}"#).unwrap();
        assert!(matches!(typing, ClientEvent::Typing { is_typing: true }));

        let widget: ClientEvent =
            serde_json::from_str(r#"{"type":"widget-message","content":"hi"}"#).unwrap();
        assert!(matches!(widget, ClientEvent::WidgetMessage { .. }));

        let end: ClientEvent = serde_json::from_str(r#"{"type":"end-conversation"}"#).unwrap();
        assert!(matches!(end, ClientEvent::EndConversation));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_str(r#"{"type":"mystery","foo":1}"#);
        assert!(result.is_err());
    }
}
