//! Chat room entity: one conversation between a visitor and the system

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chat_rooms")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: String,

    /// Resolves to at most one active room per (tenant, visitor)
    #[sea_orm(unique)]
    pub session_token: String,

    pub visitor_id: String,

    /// active | closed
    pub status: String,

    #[sea_orm(nullable)]
    pub assigned_agent_id: Option<Uuid>,

    /// local | external, set alongside assigned_agent_id
    #[sea_orm(nullable)]
    pub agent_source: Option<String>,

    /// A human agent is handling this room
    pub takeover: bool,

    #[sea_orm(nullable)]
    pub customer_email: Option<String>,

    #[sea_orm(nullable)]
    pub customer_name: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub last_activity_at: DateTimeWithTimeZone,

    #[sea_orm(nullable)]
    pub closed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::message::Entity")]
    Messages,

    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::AssignedAgentId",
        to = "super::user::Column::Id"
    )]
    AssignedAgent,
}

impl Related<super::message::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Messages.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AssignedAgent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Room lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Closed,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Active => "active",
            RoomStatus::Closed => "closed",
        }
    }
}

impl Model {
    pub fn is_active(&self) -> bool {
        self.status == RoomStatus::Active.as_str()
    }

    /// The realtime channel address for this room
    pub fn channel(&self) -> String {
        format!("room_{}_{}", self.id, self.tenant_id)
    }
}
