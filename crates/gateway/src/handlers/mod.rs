pub mod bridge;
pub mod chat;
pub mod documents;
pub mod health;
pub mod query;
pub mod tenants;
