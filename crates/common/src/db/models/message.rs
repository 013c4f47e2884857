//! Message entity
//!
//! Ordering within a room is strictly by `created_at` then `id`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "messages")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub room_id: Uuid,

    pub tenant_id: String,

    /// customer | ai | agent | system
    pub sender_type: String,

    #[sea_orm(column_type = "Text")]
    pub content: String,

    /// Sources, intent, confidence, query duration for ai messages
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub metadata: Option<Json>,

    #[sea_orm(nullable)]
    pub sender_id: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,
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

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Customer,
    Ai,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Customer => "customer",
            SenderType::Ai => "ai",
            SenderType::Agent => "agent",
            SenderType::System => "system",
        }
    }
}

impl std::str::FromStr for SenderType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(SenderType::Customer),
            "ai" => Ok(SenderType::Ai),
            "agent" => Ok(SenderType::Agent),
            "system" => Ok(SenderType::System),
            _ => Err(()),
        }
    }
}
