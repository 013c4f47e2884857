//! Repository pattern for database operations
//!
//! Provides a clean interface for all data access operations on the
//! conversation side: clients, rooms, messages, session contexts and
//! local agents.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-conversation summary returned by the conversation listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub room_id: Uuid,
    pub started_at: chrono::DateTime<chrono::FixedOffset>,
    pub last_message: Option<String>,
    pub last_message_at: chrono::DateTime<chrono::FixedOffset>,
    pub status: String,
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Client Operations
    // ========================================================================

    /// Find client by tenant id
    pub async fn find_client_by_tenant(&self, tenant_id: &str) -> Result<Option<Client>> {
        ClientEntity::find()
            .filter(ClientColumn::TenantId.eq(tenant_id))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find client by numeric product id
    pub async fn find_client_by_product_id(&self, product_id: i64) -> Result<Option<Client>> {
        ClientEntity::find()
            .filter(ClientColumn::ProductId.eq(product_id))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Create a client
    pub async fn create_client(
        &self,
        tenant_id: &str,
        name: &str,
        product_id: Option<i64>,
    ) -> Result<Client> {
        let client = ClientActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id.to_string()),
            name: Set(name.to_string()),
            product_id: Set(product_id),
            created_at: Set(Utc::now().into()),
        };

        client.insert(self.write_conn()).await.map_err(Into::into)
    }

    // ========================================================================
    // Room Operations
    // ========================================================================

    /// Create a new active room
    pub async fn create_room(
        &self,
        tenant_id: &str,
        session_token: &str,
        visitor_id: &str,
    ) -> Result<ChatRoom> {
        let now = Utc::now();

        let room = ChatRoomActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id.to_string()),
            session_token: Set(session_token.to_string()),
            visitor_id: Set(visitor_id.to_string()),
            status: Set(RoomStatus::Active.as_str().to_string()),
            assigned_agent_id: Set(None),
            agent_source: Set(None),
            takeover: Set(false),
            customer_email: Set(None),
            customer_name: Set(None),
            created_at: Set(now.into()),
            last_activity_at: Set(now.into()),
            closed_at: Set(None),
        };

        room.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find a room by id
    pub async fn find_room(&self, room_id: Uuid) -> Result<Option<ChatRoom>> {
        ChatRoomEntity::find_by_id(room_id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find a room by id, scoped to a tenant
    pub async fn find_room_in_tenant(
        &self,
        tenant_id: &str,
        room_id: Uuid,
    ) -> Result<Option<ChatRoom>> {
        ChatRoomEntity::find_by_id(room_id)
            .filter(ChatRoomColumn::TenantId.eq(tenant_id))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Resolve an active room by its session token
    pub async fn find_active_room_by_token(
        &self,
        tenant_id: &str,
        session_token: &str,
    ) -> Result<Option<ChatRoom>> {
        ChatRoomEntity::find()
            .filter(ChatRoomColumn::TenantId.eq(tenant_id))
            .filter(ChatRoomColumn::SessionToken.eq(session_token))
            .filter(ChatRoomColumn::Status.eq(RoomStatus::Active.as_str()))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// The active room for a visitor, if any
    pub async fn find_active_room_for_visitor(
        &self,
        tenant_id: &str,
        visitor_id: &str,
    ) -> Result<Option<ChatRoom>> {
        ChatRoomEntity::find()
            .filter(ChatRoomColumn::TenantId.eq(tenant_id))
            .filter(ChatRoomColumn::VisitorId.eq(visitor_id))
            .filter(ChatRoomColumn::Status.eq(RoomStatus::Active.as_str()))
            .order_by_desc(ChatRoomColumn::LastActivityAt)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Update a room's last activity timestamp
    pub async fn touch_room(&self, room_id: Uuid) -> Result<()> {
        let room = self
            .find_room(room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let mut active: ChatRoomActiveModel = room.into();
        active.last_activity_at = Set(Utc::now().into());
        active.update(self.write_conn()).await?;
        Ok(())
    }

    /// Mirror collected identity onto the room columns
    pub async fn set_room_identity(
        &self,
        room_id: Uuid,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        if email.is_none() && name.is_none() {
            return Ok(());
        }

        let room = self
            .find_room(room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let mut active: ChatRoomActiveModel = room.into();
        if let Some(email) = email {
            active.customer_email = Set(Some(email.to_string()));
        }
        if let Some(name) = name {
            active.customer_name = Set(Some(name.to_string()));
        }
        active.update(self.write_conn()).await?;
        Ok(())
    }

    /// Assign an agent to a room and mark it taken over
    pub async fn assign_agent_to_room(
        &self,
        room_id: Uuid,
        agent_id: Uuid,
        agent_source: &str,
    ) -> Result<ChatRoom> {
        let room = self
            .find_room(room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let mut active: ChatRoomActiveModel = room.into();
        active.assigned_agent_id = Set(Some(agent_id));
        active.agent_source = Set(Some(agent_source.to_string()));
        active.takeover = Set(true);
        active.last_activity_at = Set(Utc::now().into());
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Close a room
    pub async fn close_room(&self, room_id: Uuid) -> Result<ChatRoom> {
        let room = self
            .find_room(room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let mut active: ChatRoomActiveModel = room.into();
        active.status = Set(RoomStatus::Closed.as_str().to_string());
        active.closed_at = Set(Some(Utc::now().into()));
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// All rooms for a visitor, most recently active first
    pub async fn list_rooms_for_visitor(
        &self,
        tenant_id: &str,
        visitor_id: &str,
    ) -> Result<Vec<ChatRoom>> {
        ChatRoomEntity::find()
            .filter(ChatRoomColumn::TenantId.eq(tenant_id))
            .filter(ChatRoomColumn::VisitorId.eq(visitor_id))
            .order_by_desc(ChatRoomColumn::LastActivityAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Conversation summaries for a visitor (room, started, last message)
    pub async fn conversation_summaries(
        &self,
        tenant_id: &str,
        visitor_id: &str,
    ) -> Result<Vec<ConversationSummary>> {
        let rooms = self.list_rooms_for_visitor(tenant_id, visitor_id).await?;

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let last = self.last_message(room.id).await?;
            summaries.push(ConversationSummary {
                room_id: room.id,
                started_at: room.created_at,
                last_message: last.as_ref().map(|m| m.content.clone()),
                last_message_at: last
                    .map(|m| m.created_at)
                    .unwrap_or(room.last_activity_at),
                status: room.status,
            });
        }

        Ok(summaries)
    }

    /// All active rooms of a tenant, newest activity first
    pub async fn list_active_rooms(&self, tenant_id: &str) -> Result<Vec<ChatRoom>> {
        ChatRoomEntity::find()
            .filter(ChatRoomColumn::TenantId.eq(tenant_id))
            .filter(ChatRoomColumn::Status.eq(RoomStatus::Active.as_str()))
            .order_by_desc(ChatRoomColumn::LastActivityAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Active rooms with no activity since the cutoff
    pub async fn stale_active_rooms(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Vec<ChatRoom>> {
        ChatRoomEntity::find()
            .filter(ChatRoomColumn::Status.eq(RoomStatus::Active.as_str()))
            .filter(ChatRoomColumn::LastActivityAt.lt(cutoff))
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Message Operations
    // ========================================================================

    /// Persist a message
    pub async fn create_message(
        &self,
        room_id: Uuid,
        tenant_id: &str,
        sender_type: SenderType,
        content: &str,
        metadata: Option<serde_json::Value>,
        sender_id: Option<Uuid>,
    ) -> Result<Message> {
        let message = MessageActiveModel {
            id: Set(Uuid::new_v4()),
            room_id: Set(room_id),
            tenant_id: Set(tenant_id.to_string()),
            sender_type: Set(sender_type.as_str().to_string()),
            content: Set(content.to_string()),
            metadata: Set(metadata),
            sender_id: Set(sender_id),
            created_at: Set(Utc::now().into()),
        };

        let message = message.insert(self.write_conn()).await?;
        crate::metrics::record_message(sender_type.as_str());
        Ok(message)
    }

    /// Messages of a room, ascending by (created_at, id)
    pub async fn list_messages(&self, room_id: Uuid, limit: u64) -> Result<Vec<Message>> {
        MessageEntity::find()
            .filter(MessageColumn::RoomId.eq(room_id))
            .order_by_asc(MessageColumn::CreatedAt)
            .order_by_asc(MessageColumn::Id)
            .limit(limit)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// The last `n` messages of a room in chronological order
    pub async fn last_messages(&self, room_id: Uuid, n: u64) -> Result<Vec<Message>> {
        let mut messages = MessageEntity::find()
            .filter(MessageColumn::RoomId.eq(room_id))
            .order_by_desc(MessageColumn::CreatedAt)
            .order_by_desc(MessageColumn::Id)
            .limit(n)
            .all(self.read_conn())
            .await?;

        messages.reverse();
        Ok(messages)
    }

    /// The most recent message of a room
    pub async fn last_message(&self, room_id: Uuid) -> Result<Option<Message>> {
        MessageEntity::find()
            .filter(MessageColumn::RoomId.eq(room_id))
            .order_by_desc(MessageColumn::CreatedAt)
            .order_by_desc(MessageColumn::Id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Session Context Operations
    // ========================================================================

    /// Fetch the room's context, creating an empty one on first access
    pub async fn get_or_create_context(
        &self,
        room_id: Uuid,
        tenant_id: &str,
    ) -> Result<SessionContext> {
        let existing = SessionContextEntity::find()
            .filter(SessionContextColumn::RoomId.eq(room_id))
            .filter(SessionContextColumn::TenantId.eq(tenant_id))
            .one(self.read_conn())
            .await?;

        if let Some(ctx) = existing {
            return Ok(ctx);
        }

        let ctx = SessionContextActiveModel {
            id: Set(Uuid::new_v4()),
            room_id: Set(room_id),
            tenant_id: Set(tenant_id.to_string()),
            collected_entities: Set(serde_json::json!({})),
            current_workflow: Set(None),
            workflow_state: Set(serde_json::json!({})),
            updated_at: Set(Utc::now().into()),
        };

        ctx.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Replace the collected entities map
    pub async fn set_context_entities(
        &self,
        room_id: Uuid,
        tenant_id: &str,
        entities: serde_json::Value,
    ) -> Result<SessionContext> {
        let ctx = self.get_or_create_context(room_id, tenant_id).await?;

        let mut active: SessionContextActiveModel = ctx.into();
        active.collected_entities = Set(entities);
        active.updated_at = Set(Utc::now().into());
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Merge keys into the collected entities map. Existing keys are
    /// overwritten, no key is dropped.
    pub async fn merge_context_entities(
        &self,
        room_id: Uuid,
        tenant_id: &str,
        updates: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<SessionContext> {
        let ctx = self.get_or_create_context(room_id, tenant_id).await?;

        let mut entities = ctx.entities();
        for (k, v) in updates {
            entities.insert(k.clone(), v.clone());
        }

        let mut active: SessionContextActiveModel = ctx.into();
        active.collected_entities = Set(serde_json::Value::Object(entities));
        active.updated_at = Set(Utc::now().into());
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Remove the internal handover flags after resolution
    pub async fn clear_handover_flags(
        &self,
        room_id: Uuid,
        tenant_id: &str,
    ) -> Result<SessionContext> {
        let ctx = self.get_or_create_context(room_id, tenant_id).await?;

        let mut entities = ctx.entities();
        entities.remove("pendingHandover");
        entities.remove("handoverReason");

        let mut active: SessionContextActiveModel = ctx.into();
        active.collected_entities = Set(serde_json::Value::Object(entities));
        active.updated_at = Set(Utc::now().into());
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    // ========================================================================
    // Agent (User) Operations
    // ========================================================================

    /// Online local agents of a tenant with spare capacity
    pub async fn list_available_agents(&self, tenant_id: &str) -> Result<Vec<User>> {
        let agents = UserEntity::find()
            .filter(UserColumn::TenantId.eq(tenant_id))
            .filter(UserColumn::Status.eq(AgentStatus::Online.as_str()))
            .all(self.read_conn())
            .await?;

        Ok(agents.into_iter().filter(|a| a.has_capacity()).collect())
    }

    /// Find a user by id
    pub async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        UserEntity::find_by_id(user_id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find a user by email
    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        UserEntity::find()
            .filter(UserColumn::Email.eq(email))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Create a user row. External agents get one keyed by email so FK
    /// constraints on room assignment hold.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_user(
        &self,
        tenant_id: &str,
        name: &str,
        email: &str,
        status: AgentStatus,
        max_concurrent: i32,
        department: Option<String>,
        skills: Vec<String>,
        source: &str,
    ) -> Result<User> {
        let now = Utc::now();

        let user = UserActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id.to_string()),
            name: Set(name.to_string()),
            email: Set(email.to_string()),
            status: Set(status.as_str().to_string()),
            max_concurrent: Set(max_concurrent),
            current_load: Set(0),
            department: Set(department),
            skills: Set(serde_json::json!(skills)),
            source: Set(source.to_string()),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        user.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Adjust an agent's load, clamped at zero
    pub async fn adjust_user_load(&self, user_id: Uuid, delta: i32) -> Result<User> {
        let user = self
            .find_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "user".to_string(),
                id: user_id.to_string(),
            })?;

        let new_load = (user.current_load + delta).max(0);
        let mut active: UserActiveModel = user.into();
        active.current_load = Set(new_load);
        active.updated_at = Set(Utc::now().into());
        active.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Update an agent's availability status
    pub async fn set_user_status(&self, user_id: Uuid, status: AgentStatus) -> Result<User> {
        let user = self
            .find_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "user".to_string(),
                id: user_id.to_string(),
            })?;

        let mut active: UserActiveModel = user.into();
        active.status = Set(status.as_str().to_string());
        active.updated_at = Set(Utc::now().into());
        active.update(self.write_conn()).await.map_err(Into::into)
    }
}
