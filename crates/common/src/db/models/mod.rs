//! SeaORM entity models
//!
//! Relational entities for the conversation side of Chatforge:
//! clients, users (agents), chat rooms, messages and session contexts.

mod chat_room;
mod client;
mod message;
mod session_context;
mod user;

pub use chat_room::{
    ActiveModel as ChatRoomActiveModel, Column as ChatRoomColumn, Entity as ChatRoomEntity,
    Model as ChatRoom, RoomStatus,
};

pub use client::{
    ActiveModel as ClientActiveModel, Column as ClientColumn, Entity as ClientEntity,
    Model as Client,
};

pub use message::{
    ActiveModel as MessageActiveModel, Column as MessageColumn, Entity as MessageEntity,
    Model as Message, SenderType,
};

pub use session_context::{
    ActiveModel as SessionContextActiveModel, Column as SessionContextColumn,
    Entity as SessionContextEntity, Model as SessionContext,
};

pub use user::{
    ActiveModel as UserActiveModel, AgentStatus, Column as UserColumn, Entity as UserEntity,
    Model as User,
};
