//! Session context entity
//!
//! One-to-one with a chat room; `(room_id, tenant_id)` is unique.
//! `collected_entities` accumulates across the session: keys may be added
//! or overwritten, never silently dropped, except for the internal
//! `pendingHandover` / `handoverReason` flags which are cleared on
//! resolution.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "session_contexts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub room_id: Uuid,

    pub tenant_id: String,

    /// Known entities the AI must not re-ask for
    #[sea_orm(column_type = "JsonBinary")]
    pub collected_entities: Json,

    #[sea_orm(nullable)]
    pub current_workflow: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub workflow_state: Json,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::chat_room::Entity",
        from = "Column::RoomId",
        to = "super::chat_room::Column::Id",
        on_delete = "Cascade"
    )]
    ChatRoom,
}

impl Related<super::chat_room::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChatRoom.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// The entity map as a JSON object (empty when the column is not one).
    pub fn entities(&self) -> serde_json::Map<String, serde_json::Value> {
        self.collected_entities
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    /// Look up a collected entity as a string.
    pub fn entity_str(&self, key: &str) -> Option<String> {
        self.collected_entities
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}
