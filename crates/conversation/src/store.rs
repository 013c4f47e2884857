//! Session store boundary
//!
//! The conversation core talks to persistence through this trait so the
//! turn logic can be exercised against an in-memory store. The production
//! implementation delegates to the SeaORM repository.

use async_trait::async_trait;
use chatforge_common::db::models::{AgentStatus, ChatRoom, Message, SenderType, SessionContext};
use chatforge_common::db::models::{RoomStatus, User};
use chatforge_common::db::{ConversationSummary, Repository};
use chatforge_common::errors::{AppError, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Persistence operations the conversation core needs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    // Rooms
    async fn create_room(&self, tenant: &str, token: &str, visitor: &str) -> Result<ChatRoom>;
    async fn find_room(&self, tenant: &str, room_id: Uuid) -> Result<Option<ChatRoom>>;
    async fn find_active_room_by_token(&self, tenant: &str, token: &str)
        -> Result<Option<ChatRoom>>;
    async fn find_active_room_for_visitor(
        &self,
        tenant: &str,
        visitor: &str,
    ) -> Result<Option<ChatRoom>>;
    async fn touch_room(&self, room_id: Uuid) -> Result<()>;
    async fn set_room_identity(
        &self,
        room_id: Uuid,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<()>;
    async fn assign_agent(&self, room_id: Uuid, agent_id: Uuid, source: &str) -> Result<ChatRoom>;
    async fn close_room(&self, room_id: Uuid) -> Result<ChatRoom>;
    async fn conversation_summaries(
        &self,
        tenant: &str,
        visitor: &str,
    ) -> Result<Vec<ConversationSummary>>;
    async fn stale_active_rooms(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<ChatRoom>>;

    // Messages
    async fn create_message(
        &self,
        room_id: Uuid,
        tenant: &str,
        sender_type: SenderType,
        content: &str,
        metadata: Option<Value>,
        sender_id: Option<Uuid>,
    ) -> Result<Message>;
    async fn list_messages(&self, room_id: Uuid, limit: u64) -> Result<Vec<Message>>;
    async fn last_messages(&self, room_id: Uuid, n: u64) -> Result<Vec<Message>>;

    // Session context
    async fn get_or_create_context(&self, room_id: Uuid, tenant: &str) -> Result<SessionContext>;
    async fn merge_entities(
        &self,
        room_id: Uuid,
        tenant: &str,
        updates: &Map<String, Value>,
    ) -> Result<SessionContext>;
    async fn clear_handover_flags(&self, room_id: Uuid, tenant: &str) -> Result<SessionContext>;

    // Local agents
    async fn list_available_agents(&self, tenant: &str) -> Result<Vec<User>>;
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    #[allow(clippy::too_many_arguments)]
    async fn create_user(
        &self,
        tenant: &str,
        name: &str,
        email: &str,
        status: AgentStatus,
        max_concurrent: i32,
        department: Option<String>,
        skills: Vec<String>,
        source: &str,
    ) -> Result<User>;
    async fn adjust_user_load(&self, user_id: Uuid, delta: i32) -> Result<User>;
}

#[async_trait]
impl SessionStore for Repository {
    async fn create_room(&self, tenant: &str, token: &str, visitor: &str) -> Result<ChatRoom> {
        Repository::create_room(self, tenant, token, visitor).await
    }

    async fn find_room(&self, tenant: &str, room_id: Uuid) -> Result<Option<ChatRoom>> {
        Repository::find_room_in_tenant(self, tenant, room_id).await
    }

    async fn find_active_room_by_token(
        &self,
        tenant: &str,
        token: &str,
    ) -> Result<Option<ChatRoom>> {
        Repository::find_active_room_by_token(self, tenant, token).await
    }

    async fn find_active_room_for_visitor(
        &self,
        tenant: &str,
        visitor: &str,
    ) -> Result<Option<ChatRoom>> {
        Repository::find_active_room_for_visitor(self, tenant, visitor).await
    }

    async fn touch_room(&self, room_id: Uuid) -> Result<()> {
        Repository::touch_room(self, room_id).await
    }

    async fn set_room_identity(
        &self,
        room_id: Uuid,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        Repository::set_room_identity(self, room_id, email, name).await
    }

    async fn assign_agent(&self, room_id: Uuid, agent_id: Uuid, source: &str) -> Result<ChatRoom> {
        Repository::assign_agent_to_room(self, room_id, agent_id, source).await
    }

    async fn close_room(&self, room_id: Uuid) -> Result<ChatRoom> {
        Repository::close_room(self, room_id).await
    }

    async fn conversation_summaries(
        &self,
        tenant: &str,
        visitor: &str,
    ) -> Result<Vec<ConversationSummary>> {
        Repository::conversation_summaries(self, tenant, visitor).await
    }

    async fn stale_active_rooms(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<ChatRoom>> {
        Repository::stale_active_rooms(self, cutoff).await
    }

    async fn create_message(
        &self,
        room_id: Uuid,
        tenant: &str,
        sender_type: SenderType,
        content: &str,
        metadata: Option<Value>,
        sender_id: Option<Uuid>,
    ) -> Result<Message> {
        Repository::create_message(self, room_id, tenant, sender_type, content, metadata, sender_id)
            .await
    }

    async fn list_messages(&self, room_id: Uuid, limit: u64) -> Result<Vec<Message>> {
        Repository::list_messages(self, room_id, limit).await
    }

    async fn last_messages(&self, room_id: Uuid, n: u64) -> Result<Vec<Message>> {
        Repository::last_messages(self, room_id, n).await
    }

    async fn get_or_create_context(&self, room_id: Uuid, tenant: &str) -> Result<SessionContext> {
        Repository::get_or_create_context(self, room_id, tenant).await
    }

    async fn merge_entities(
        &self,
        room_id: Uuid,
        tenant: &str,
        updates: &Map<String, Value>,
    ) -> Result<SessionContext> {
        Repository::merge_context_entities(self, room_id, tenant, updates).await
    }

    async fn clear_handover_flags(&self, room_id: Uuid, tenant: &str) -> Result<SessionContext> {
        Repository::clear_handover_flags(self, room_id, tenant).await
    }

    async fn list_available_agents(&self, tenant: &str) -> Result<Vec<User>> {
        Repository::list_available_agents(self, tenant).await
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Repository::find_user(self, user_id).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Repository::find_user_by_email(self, email).await
    }

    async fn create_user(
        &self,
        tenant: &str,
        name: &str,
        email: &str,
        status: AgentStatus,
        max_concurrent: i32,
        department: Option<String>,
        skills: Vec<String>,
        source: &str,
    ) -> Result<User> {
        Repository::create_user(
            self,
            tenant,
            name,
            email,
            status,
            max_concurrent,
            department,
            skills,
            source,
        )
        .await
    }

    async fn adjust_user_load(&self, user_id: Uuid, delta: i32) -> Result<User> {
        Repository::adjust_user_load(self, user_id, delta).await
    }
}

// ============================================================================
// In-memory store
// ============================================================================

use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryInner {
    rooms: HashMap<Uuid, ChatRoom>,
    messages: Vec<Message>,
    contexts: HashMap<Uuid, SessionContext>,
    users: HashMap<Uuid, User>,
    clock: i64,
}

impl MemoryInner {
    /// Strictly increasing timestamps so ordering by (created_at, id) is
    /// total even within one test tick.
    fn now(&mut self) -> chrono::DateTime<chrono::FixedOffset> {
        self.clock += 1;
        (Utc::now() + chrono::Duration::microseconds(self.clock)).into()
    }
}

/// HashMap-backed [`SessionStore`] for tests and local development.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemoryInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an online local agent. Test helper.
    pub async fn seed_agent(&self, tenant: &str, name: &str, email: &str, max_concurrent: i32) -> User {
        self.create_user(
            tenant,
            name,
            email,
            AgentStatus::Online,
            max_concurrent,
            None,
            Vec::new(),
            "local",
        )
        .await
        .expect("seed agent")
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_room(&self, tenant: &str, token: &str, visitor: &str) -> Result<ChatRoom> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let room = ChatRoom {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            session_token: token.to_string(),
            visitor_id: visitor.to_string(),
            status: RoomStatus::Active.as_str().to_string(),
            assigned_agent_id: None,
            agent_source: None,
            takeover: false,
            customer_email: None,
            customer_name: None,
            created_at: now,
            last_activity_at: now,
            closed_at: None,
        };
        inner.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn find_room(&self, tenant: &str, room_id: Uuid) -> Result<Option<ChatRoom>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .get(&room_id)
            .filter(|r| r.tenant_id == tenant)
            .cloned())
    }

    async fn find_active_room_by_token(
        &self,
        tenant: &str,
        token: &str,
    ) -> Result<Option<ChatRoom>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .values()
            .find(|r| r.tenant_id == tenant && r.session_token == token && r.is_active())
            .cloned())
    }

    async fn find_active_room_for_visitor(
        &self,
        tenant: &str,
        visitor: &str,
    ) -> Result<Option<ChatRoom>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .values()
            .filter(|r| r.tenant_id == tenant && r.visitor_id == visitor && r.is_active())
            .max_by_key(|r| r.last_activity_at)
            .cloned())
    }

    async fn touch_room(&self, room_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let room = inner.rooms.get_mut(&room_id).ok_or(AppError::RoomNotFound {
            id: room_id.to_string(),
        })?;
        room.last_activity_at = now;
        Ok(())
    }

    async fn set_room_identity(
        &self,
        room_id: Uuid,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let room = inner.rooms.get_mut(&room_id).ok_or(AppError::RoomNotFound {
            id: room_id.to_string(),
        })?;
        if let Some(email) = email {
            room.customer_email = Some(email.to_string());
        }
        if let Some(name) = name {
            room.customer_name = Some(name.to_string());
        }
        Ok(())
    }

    async fn assign_agent(&self, room_id: Uuid, agent_id: Uuid, source: &str) -> Result<ChatRoom> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let room = inner.rooms.get_mut(&room_id).ok_or(AppError::RoomNotFound {
            id: room_id.to_string(),
        })?;
        room.assigned_agent_id = Some(agent_id);
        room.agent_source = Some(source.to_string());
        room.takeover = true;
        room.last_activity_at = now;
        Ok(room.clone())
    }

    async fn close_room(&self, room_id: Uuid) -> Result<ChatRoom> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let room = inner.rooms.get_mut(&room_id).ok_or(AppError::RoomNotFound {
            id: room_id.to_string(),
        })?;
        room.status = RoomStatus::Closed.as_str().to_string();
        room.closed_at = Some(now);
        Ok(room.clone())
    }

    async fn conversation_summaries(
        &self,
        tenant: &str,
        visitor: &str,
    ) -> Result<Vec<ConversationSummary>> {
        let inner = self.inner.lock().await;
        let mut rooms: Vec<&ChatRoom> = inner
            .rooms
            .values()
            .filter(|r| r.tenant_id == tenant && r.visitor_id == visitor)
            .collect();
        rooms.sort_by_key(|r| std::cmp::Reverse(r.last_activity_at));

        Ok(rooms
            .into_iter()
            .map(|room| {
                let last = inner
                    .messages
                    .iter()
                    .filter(|m| m.room_id == room.id)
                    .max_by_key(|m| (m.created_at, m.id));
                ConversationSummary {
                    room_id: room.id,
                    started_at: room.created_at,
                    last_message: last.map(|m| m.content.clone()),
                    last_message_at: last.map(|m| m.created_at).unwrap_or(room.last_activity_at),
                    status: room.status.clone(),
                }
            })
            .collect())
    }

    async fn stale_active_rooms(&self, cutoff: chrono::DateTime<Utc>) -> Result<Vec<ChatRoom>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rooms
            .values()
            .filter(|r| r.is_active() && r.last_activity_at < cutoff)
            .cloned()
            .collect())
    }

    async fn create_message(
        &self,
        room_id: Uuid,
        tenant: &str,
        sender_type: SenderType,
        content: &str,
        metadata: Option<Value>,
        sender_id: Option<Uuid>,
    ) -> Result<Message> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let message = Message {
            id: Uuid::new_v4(),
            room_id,
            tenant_id: tenant.to_string(),
            sender_type: sender_type.as_str().to_string(),
            content: content.to_string(),
            metadata,
            sender_id,
            created_at: now,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, room_id: Uuid, limit: u64) -> Result<Vec<Message>> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn last_messages(&self, room_id: Uuid, n: u64) -> Result<Vec<Message>> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        let skip = messages.len().saturating_sub(n as usize);
        Ok(messages.split_off(skip))
    }

    async fn get_or_create_context(&self, room_id: Uuid, tenant: &str) -> Result<SessionContext> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let ctx = inner.contexts.entry(room_id).or_insert_with(|| SessionContext {
            id: Uuid::new_v4(),
            room_id,
            tenant_id: tenant.to_string(),
            collected_entities: serde_json::json!({}),
            current_workflow: None,
            workflow_state: serde_json::json!({}),
            updated_at: now,
        });
        Ok(ctx.clone())
    }

    async fn merge_entities(
        &self,
        room_id: Uuid,
        tenant: &str,
        updates: &Map<String, Value>,
    ) -> Result<SessionContext> {
        self.get_or_create_context(room_id, tenant).await?;
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let ctx = inner.contexts.get_mut(&room_id).expect("context exists");
        let mut entities = ctx.entities();
        for (k, v) in updates {
            entities.insert(k.clone(), v.clone());
        }
        ctx.collected_entities = Value::Object(entities);
        ctx.updated_at = now;
        Ok(ctx.clone())
    }

    async fn clear_handover_flags(&self, room_id: Uuid, tenant: &str) -> Result<SessionContext> {
        self.get_or_create_context(room_id, tenant).await?;
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let ctx = inner.contexts.get_mut(&room_id).expect("context exists");
        let mut entities = ctx.entities();
        entities.remove("pendingHandover");
        entities.remove("handoverReason");
        ctx.collected_entities = Value::Object(entities);
        ctx.updated_at = now;
        Ok(ctx.clone())
    }

    async fn list_available_agents(&self, tenant: &str) -> Result<Vec<User>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .filter(|u| u.tenant_id == tenant && u.has_capacity())
            .cloned()
            .collect())
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let inner = self.inner.lock().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn create_user(
        &self,
        tenant: &str,
        name: &str,
        email: &str,
        status: AgentStatus,
        max_concurrent: i32,
        department: Option<String>,
        skills: Vec<String>,
        source: &str,
    ) -> Result<User> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let user = User {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            status: status.as_str().to_string(),
            max_concurrent,
            current_load: 0,
            department,
            skills: serde_json::json!(skills),
            source: source.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn adjust_user_load(&self, user_id: Uuid, delta: i32) -> Result<User> {
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let user = inner.users.get_mut(&user_id).ok_or(AppError::NotFound {
            resource_type: "user".to_string(),
            id: user_id.to_string(),
        })?;
        user.current_load = (user.current_load + delta).max(0);
        user.updated_at = now;
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn room_lifecycle() {
        let store = MemorySessionStore::new();
        let room = store.create_room("acme", "tok1", "vis1").await.unwrap();
        assert!(room.is_active());

        let found = store
            .find_active_room_by_token("acme", "tok1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, room.id);

        // Wrong tenant sees nothing.
        assert!(store
            .find_active_room_by_token("beta", "tok1")
            .await
            .unwrap()
            .is_none());

        let closed = store.close_room(room.id).await.unwrap();
        assert!(!closed.is_active());
        assert!(closed.closed_at.is_some());
        assert!(store
            .find_active_room_by_token("acme", "tok1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn messages_are_ordered() {
        let store = MemorySessionStore::new();
        let room = store.create_room("acme", "tok", "vis").await.unwrap();

        for i in 0..5 {
            store
                .create_message(
                    room.id,
                    "acme",
                    SenderType::Customer,
                    &format!("m{i}"),
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        let all = store.list_messages(room.id, 100).await.unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

        let tail = store.last_messages(room.id, 2).await.unwrap();
        let contents: Vec<_> = tail.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn entities_merge_monotonically() {
        let store = MemorySessionStore::new();
        let room = store.create_room("acme", "tok", "vis").await.unwrap();

        let mut first = Map::new();
        first.insert("email".into(), serde_json::json!("a@b.co"));
        store.merge_entities(room.id, "acme", &first).await.unwrap();

        let mut second = Map::new();
        second.insert("name".into(), serde_json::json!("Jane"));
        let ctx = store.merge_entities(room.id, "acme", &second).await.unwrap();

        let entities = ctx.entities();
        assert_eq!(entities.get("email").unwrap(), "a@b.co");
        assert_eq!(entities.get("name").unwrap(), "Jane");
    }

    #[tokio::test]
    async fn handover_flags_clear_without_dropping_entities() {
        let store = MemorySessionStore::new();
        let room = store.create_room("acme", "tok", "vis").await.unwrap();

        let mut updates = Map::new();
        updates.insert("pendingHandover".into(), serde_json::json!(true));
        updates.insert("handoverReason".into(), serde_json::json!("account_issue"));
        updates.insert("email".into(), serde_json::json!("a@b.co"));
        store.merge_entities(room.id, "acme", &updates).await.unwrap();

        let ctx = store.clear_handover_flags(room.id, "acme").await.unwrap();
        let entities = ctx.entities();
        assert!(entities.get("pendingHandover").is_none());
        assert!(entities.get("handoverReason").is_none());
        assert_eq!(entities.get("email").unwrap(), "a@b.co");
    }

    #[tokio::test]
    async fn agent_capacity_filtering() {
        let store = MemorySessionStore::new();
        let agent = store.seed_agent("acme", "Sam", "sam@acme.co", 1).await;

        assert_eq!(store.list_available_agents("acme").await.unwrap().len(), 1);

        store.adjust_user_load(agent.id, 1).await.unwrap();
        assert!(store.list_available_agents("acme").await.unwrap().is_empty());

        store.adjust_user_load(agent.id, -1).await.unwrap();
        assert_eq!(store.list_available_agents("acme").await.unwrap().len(), 1);
    }
}
