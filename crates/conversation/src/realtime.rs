//! Realtime fan-out
//!
//! Per-room pub/sub over broadcast channels, addressed
//! `room_<room_id>_<tenant_id>`, plus the bridge to the external agent
//! backend. Delivery is best-effort per subscriber; the message store is
//! authoritative, so a lagging subscriber reconciles via history.

use async_trait::async_trait;
use chatforge_common::db::models::{ChatRoom, Message};
use chatforge_common::errors::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// Events fanned out to room subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    RoomJoined {
        room_id: Uuid,
    },
    NewMessage {
        message: MessageDto,
    },
    UserTyping {
        sender: String,
        is_typing: bool,
    },
    SessionUpdate {
        room_id: Uuid,
        status: String,
        takeover: bool,
        assigned_agent_id: Option<Uuid>,
    },
}

/// Wire shape of a message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_type: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: String,
}

impl From<&Message> for MessageDto {
    fn from(m: &Message) -> Self {
        Self {
            id: m.id,
            room_id: m.room_id,
            sender_type: m.sender_type.clone(),
            content: m.content.clone(),
            metadata: m.metadata.clone(),
            created_at: m.created_at.to_rfc3339(),
        }
    }
}

/// Per-room broadcast hub.
#[derive(Default)]
pub struct RoomHub {
    channels: DashMap<String, broadcast::Sender<RoomEvent>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(room_id: Uuid, tenant: &str) -> String {
        format!("room_{room_id}_{tenant}")
    }

    /// Join a room: returns a receiver of its events.
    pub fn subscribe(&self, room_id: Uuid, tenant: &str) -> broadcast::Receiver<RoomEvent> {
        let key = Self::key(room_id, tenant);
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Emit an event to a room. Best-effort: no subscribers is fine.
    pub fn emit(&self, room_id: Uuid, tenant: &str, event: RoomEvent) {
        let key = Self::key(room_id, tenant);
        if let Some(sender) = self.channels.get(&key) {
            let receivers = sender.receiver_count();
            if receivers > 0 {
                let _ = sender.send(event);
            }
            debug!(room = %key, receivers, "Room event emitted");
        }
    }

    /// Drop a room's channel once the room closes.
    pub fn remove_room(&self, room_id: Uuid, tenant: &str) {
        self.channels.remove(&Self::key(room_id, tenant));
    }

    /// Subscriber count, for presence-style introspection.
    pub fn subscriber_count(&self, room_id: Uuid, tenant: &str) -> usize {
        self.channels
            .get(&Self::key(room_id, tenant))
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

// ============================================================================
// External agent bridge
// ============================================================================

/// Enriched message payload mirrored to the external agent backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetMessagePayload {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub client_id: String,
    pub content: String,
    pub sender_type: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub topic: String,
    pub status: String,
    pub status_color: String,
    pub last_message: String,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u32>,
    pub takeover: bool,
}

impl WidgetMessagePayload {
    /// Build the enriched payload from a message and its room.
    pub fn from_message(message: &Message, room: &ChatRoom) -> Self {
        let status_color = if room.takeover { "orange" } else { "green" };
        Self {
            id: message.id,
            conversation_id: room.id,
            client_id: room.tenant_id.clone(),
            content: message.content.clone(),
            sender_type: message.sender_type.clone(),
            created_at: message.created_at.to_rfc3339(),
            metadata: message.metadata.clone(),
            name: room.customer_name.clone(),
            email: room.customer_email.clone(),
            topic: "support".to_string(),
            status: room.status.clone(),
            status_color: status_color.to_string(),
            last_message: message.content.clone(),
            time: message.created_at.to_rfc3339(),
            confidence: message
                .metadata
                .as_ref()
                .and_then(|m| m.get("confidence"))
                .and_then(|c| c.as_u64())
                .map(|c| c as u32),
            takeover: room.takeover,
        }
    }
}

/// Handover notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAssignedPayload {
    pub agent_email: String,
    pub agent_name: String,
    pub room_id: Uuid,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
}

/// Outbound channel to the external agent backend. Failures are logged and
/// swallowed by callers; the bridge never blocks a turn.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    async fn widget_message(&self, payload: WidgetMessagePayload) -> Result<()>;
    async fn agent_assigned(&self, payload: AgentAssignedPayload) -> Result<()>;
}

/// Bridge used when no external agent backend is configured.
pub struct NoopBridge;

#[async_trait]
impl AgentBridge for NoopBridge {
    async fn widget_message(&self, _payload: WidgetMessagePayload) -> Result<()> {
        Ok(())
    }

    async fn agent_assigned(&self, _payload: AgentAssignedPayload) -> Result<()> {
        Ok(())
    }
}

/// HTTP bridge posting events to the external agent backend.
pub struct HttpBridge {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBridge {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url,
            api_key,
        }
    }

    async fn post<T: Serialize>(&self, event: &str, payload: &T) -> Result<()> {
        let url = format!("{}/events/{event}", self.base_url);
        let mut request = self.client.post(&url).json(payload);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            warn!(event, status = %response.status(), "Bridge event rejected");
        }
        Ok(())
    }
}

#[async_trait]
impl AgentBridge for HttpBridge {
    async fn widget_message(&self, payload: WidgetMessagePayload) -> Result<()> {
        self.post("widget_message", &payload).await
    }

    async fn agent_assigned(&self, payload: AgentAssignedPayload) -> Result<()> {
        self.post("agent_assigned", &payload).await
    }
}

/// Test bridge collecting events on a channel.
pub struct ChannelBridge {
    pub widget_tx: tokio::sync::mpsc::UnboundedSender<WidgetMessagePayload>,
    pub assigned_tx: tokio::sync::mpsc::UnboundedSender<AgentAssignedPayload>,
}

impl ChannelBridge {
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<WidgetMessagePayload>,
        tokio::sync::mpsc::UnboundedReceiver<AgentAssignedPayload>,
    ) {
        let (widget_tx, widget_rx) = tokio::sync::mpsc::unbounded_channel();
        let (assigned_tx, assigned_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                widget_tx,
                assigned_tx,
            },
            widget_rx,
            assigned_rx,
        )
    }
}

#[async_trait]
impl AgentBridge for ChannelBridge {
    async fn widget_message(&self, payload: WidgetMessagePayload) -> Result<()> {
        let _ = self.widget_tx.send(payload);
        Ok(())
    }

    async fn agent_assigned(&self, payload: AgentAssignedPayload) -> Result<()> {
        let _ = self.assigned_tx.send(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_emit_delivers() {
        let hub = RoomHub::new();
        let room = Uuid::new_v4();
        let mut rx = hub.subscribe(room, "acme");

        hub.emit(
            room,
            "acme",
            RoomEvent::UserTyping {
                sender: "ai".to_string(),
                is_typing: true,
            },
        );

        match rx.recv().await.unwrap() {
            RoomEvent::UserTyping { sender, is_typing } => {
                assert_eq!(sender, "ai");
                assert!(is_typing);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let hub = RoomHub::new();
        // Must not panic or error.
        hub.emit(
            Uuid::new_v4(),
            "acme",
            RoomEvent::RoomJoined {
                room_id: Uuid::new_v4(),
            },
        );
    }

    #[tokio::test]
    async fn rooms_are_isolated_by_tenant() {
        let hub = RoomHub::new();
        let room = Uuid::new_v4();
        let mut rx_a = hub.subscribe(room, "a");
        let _rx_b = hub.subscribe(room, "b");

        hub.emit(room, "a", RoomEvent::RoomJoined { room_id: room });

        assert!(rx_a.try_recv().is_ok());
        // Tenant b's channel saw nothing.
        assert_eq!(hub.subscriber_count(room, "b"), 1);
        let mut rx_b2 = hub.subscribe(room, "b");
        assert!(rx_b2.try_recv().is_err());
    }

    #[test]
    fn room_event_serializes_with_type_tag() {
        let event = RoomEvent::UserTyping {
            sender: "ai".to_string(),
            is_typing: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_typing");
        assert_eq!(json["is_typing"], false);
    }

    #[tokio::test]
    async fn channel_bridge_collects_payloads() {
        let (bridge, mut widget_rx, _assigned_rx) = ChannelBridge::new();

        let payload = WidgetMessagePayload {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            client_id: "acme".to_string(),
            content: "hello".to_string(),
            sender_type: "customer".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            metadata: None,
            name: None,
            email: None,
            topic: "support".to_string(),
            status: "active".to_string(),
            status_color: "green".to_string(),
            last_message: "hello".to_string(),
            time: "2026-01-01T00:00:00Z".to_string(),
            confidence: None,
            takeover: false,
        };

        bridge.widget_message(payload.clone()).await.unwrap();
        let received = widget_rx.recv().await.unwrap();
        assert_eq!(received.content, "hello");
        assert_eq!(received.client_id, "acme");
    }
}
