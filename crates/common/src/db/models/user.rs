//! User entity: human agents, local or mirrored from the external directory

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: String,

    pub name: String,

    #[sea_orm(unique)]
    pub email: String,

    /// online | offline | busy | away
    pub status: String,

    pub max_concurrent: i32,

    pub current_load: i32,

    #[sea_orm(nullable)]
    pub department: Option<String>,

    /// JSON array of skill tags
    #[sea_orm(column_type = "JsonBinary")]
    pub skills: Json,

    /// local | external
    pub source: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::chat_room::Entity")]
    ChatRooms,
}

impl Related<super::chat_room::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChatRooms.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Agent availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
    Away,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Busy => "busy",
            AgentStatus::Away => "away",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            "busy" => Ok(AgentStatus::Busy),
            "away" => Ok(AgentStatus::Away),
            _ => Err(()),
        }
    }
}

impl Model {
    /// Skills as a plain string list
    pub fn skill_list(&self) -> Vec<String> {
        self.skills
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the agent can take one more conversation
    pub fn has_capacity(&self) -> bool {
        self.status == AgentStatus::Online.as_str() && self.current_load < self.max_concurrent
    }
}
