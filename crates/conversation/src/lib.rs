//! Chatforge conversation core
//!
//! Session/room lifecycle, the per-turn orchestration (persist → detect →
//! extract → answer → fan out), handover arbitration, agent selection and
//! the realtime pub/sub layer.

pub mod directory;
pub mod extraction;
pub mod handover;
pub mod queue;
pub mod realtime;
pub mod service;
pub mod store;

pub use directory::{select_agent, Agent, AgentDirectory, AgentSource, AgentSourceKind, SelectionCriteria};
pub use extraction::{extract_identity_regex, EntityExtractor};
pub use handover::{detect_handover, HandoverConfig, HandoverVerdict, HistoryEntry};
pub use queue::{Priority, QueueEntry, WaitingQueue};
pub use realtime::{AgentBridge, ChannelBridge, NoopBridge, RoomEvent, RoomHub};
pub use service::{ConversationService, SessionHandle, TurnOutcome};
pub use store::{MemorySessionStore, SessionStore};
