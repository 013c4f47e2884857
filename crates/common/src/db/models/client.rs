//! Client entity: one row per tenant-owning widget installation

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "clients")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Tenant identifier; also the vector-store namespace
    #[sea_orm(unique)]
    pub tenant_id: String,

    pub name: String,

    /// Numeric product id some widget embeds send instead of a client id
    #[sea_orm(nullable)]
    pub product_id: Option<i64>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
