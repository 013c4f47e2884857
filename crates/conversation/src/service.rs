//! Conversation orchestration
//!
//! Owns a customer turn end to end: persist the message, arbitrate
//! handover, extract identity, answer through the query core and fan
//! everything out. Turns are serialized per room with a keyed mutex; the
//! lock guards no other resource during external I/O, so cross-room
//! concurrency is bounded only by the query budget.

use crate::directory::{Agent, AgentDirectory, AgentSourceKind, SelectionCriteria};
use crate::extraction::{get_customer_identity, EntityExtractor};
use crate::handover::{detect_handover, HandoverConfig, HandoverVerdict, HistoryEntry};
use crate::queue::{Priority, QueueEntry, WaitingQueue};
use crate::realtime::{
    AgentAssignedPayload, AgentBridge, MessageDto, RoomEvent, RoomHub, WidgetMessagePayload,
};
use crate::store::SessionStore;
use chatforge_common::db::models::{AgentStatus, ChatRoom, Message, SenderType};
use chatforge_common::errors::{AppError, Result};
use chatforge_common::TenantId;
use chatforge_query::classify::{classify, Route, GREETING_REPLY};
use chatforge_query::{HistoryMessage, QueryAnswer, QueryOptions, QueryService, SourceRef};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Message shown when generation fails mid-turn.
const APOLOGY: &str =
    "I apologize, but I encountered an error while processing your message. Please try again.";

/// Message persisted when no agent can take the room.
const AGENTS_BUSY: &str =
    "All our agents are currently busy. Please wait, you have been added to the queue.";

/// Result of one customer turn.
#[derive(Debug)]
pub enum TurnOutcome {
    /// The AI answered.
    Answered {
        customer_message: Message,
        ai_message: Message,
        sources: Vec<SourceRef>,
    },
    /// The turn ended in handover arbitration; the LLM did not run.
    Handover {
        customer_message: Message,
        reason: String,
        assigned_agent: Option<Agent>,
        system_message: Option<Message>,
    },
}

/// A resolved chat session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub room: ChatRoom,
    pub messages: Vec<Message>,
    pub is_new: bool,
}

/// The conversation core.
pub struct ConversationService {
    store: Arc<dyn SessionStore>,
    query: Arc<QueryService>,
    extractor: EntityExtractor,
    hub: Arc<RoomHub>,
    bridge: Arc<dyn AgentBridge>,
    queue: Arc<WaitingQueue>,
    directory: Arc<AgentDirectory>,
    handover_config: HandoverConfig,
    history_limit: u64,
    inactivity_ttl: chrono::Duration,
    skill_based_routing: bool,
    room_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ConversationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        query: Arc<QueryService>,
        extractor: EntityExtractor,
        hub: Arc<RoomHub>,
        bridge: Arc<dyn AgentBridge>,
        queue: Arc<WaitingQueue>,
        directory: Arc<AgentDirectory>,
        session_config: &chatforge_common::config::SessionConfig,
        skill_based_routing: bool,
    ) -> Self {
        Self {
            store,
            query,
            extractor,
            hub,
            bridge,
            queue,
            directory,
            handover_config: HandoverConfig::default(),
            history_limit: session_config.history_limit as u64,
            inactivity_ttl: chrono::Duration::days(session_config.inactivity_ttl_days),
            skill_based_routing,
            room_locks: DashMap::new(),
        }
    }

    fn room_lock(&self, room_id: Uuid) -> Arc<Mutex<()>> {
        self.room_locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Resolve or create the session for a widget connection.
    pub async fn start_session(
        &self,
        tenant: &TenantId,
        session_token: Option<&str>,
        visitor_id: Option<&str>,
        room_id: Option<Uuid>,
    ) -> Result<SessionHandle> {
        if let Some(token) = session_token {
            if let Some(room) = self
                .store
                .find_active_room_by_token(tenant.as_str(), token)
                .await?
            {
                let messages = self.store.list_messages(room.id, 200).await?;
                return Ok(SessionHandle {
                    room,
                    messages,
                    is_new: false,
                });
            }
        }

        if let Some(room_id) = room_id {
            if let Some(room) = self.store.find_room(tenant.as_str(), room_id).await? {
                if room.is_active() {
                    let messages = self.store.list_messages(room.id, 200).await?;
                    return Ok(SessionHandle {
                        room,
                        messages,
                        is_new: false,
                    });
                }
            }
        }

        let visitor = visitor_id
            .map(String::from)
            .unwrap_or_else(|| format!("vis_{}", Uuid::new_v4().simple()));

        if let Some(room) = self
            .store
            .find_active_room_for_visitor(tenant.as_str(), &visitor)
            .await?
        {
            let messages = self.store.list_messages(room.id, 200).await?;
            return Ok(SessionHandle {
                room,
                messages,
                is_new: false,
            });
        }

        let token = format!("sess_{}", Uuid::new_v4().simple());
        let room = self
            .store
            .create_room(tenant.as_str(), &token, &visitor)
            .await?;

        info!(tenant = %tenant, room_id = %room.id, "Session started");
        Ok(SessionHandle {
            room,
            messages: Vec::new(),
            is_new: true,
        })
    }

    /// Close a session: release the agent, leave the queue, stop fan-out.
    pub async fn close_session(&self, tenant: &TenantId, room_id: Uuid) -> Result<ChatRoom> {
        let room = self
            .store
            .find_room(tenant.as_str(), room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let closed = self.store.close_room(room.id).await?;

        if let Some(agent_id) = room.assigned_agent_id {
            if let Err(e) = self.release_agent(tenant, agent_id, room.agent_source.as_deref()).await
            {
                warn!(error = %e, "Agent release failed on close");
            }
        }

        self.queue.remove(room_id).await;
        self.hub.emit(
            room_id,
            tenant.as_str(),
            RoomEvent::SessionUpdate {
                room_id,
                status: closed.status.clone(),
                takeover: closed.takeover,
                assigned_agent_id: closed.assigned_agent_id,
            },
        );
        self.hub.remove_room(room_id, tenant.as_str());
        self.room_locks.remove(&room_id);

        // A freed agent can take the next waiting room.
        self.drive_queue(tenant).await;

        Ok(closed)
    }

    /// Conversation summaries for a visitor, newest activity first.
    pub async fn conversations(
        &self,
        tenant: &TenantId,
        visitor_id: &str,
    ) -> Result<Vec<chatforge_common::db::ConversationSummary>> {
        self.store
            .conversation_summaries(tenant.as_str(), visitor_id)
            .await
    }

    /// Room history, ascending.
    pub async fn history(
        &self,
        tenant: &TenantId,
        room_id: Uuid,
        limit: u64,
    ) -> Result<Vec<Message>> {
        self.store
            .find_room(tenant.as_str(), room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;
        self.store.list_messages(room_id, limit).await
    }

    // ========================================================================
    // The customer turn
    // ========================================================================

    /// Process one customer message. Turns are serialized per room.
    #[instrument(skip(self, content), fields(tenant = %tenant, room_id = %room_id))]
    pub async fn process_message(
        &self,
        tenant: &TenantId,
        room_id: Uuid,
        content: &str,
    ) -> Result<TurnOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::validation("message must not be empty", Some("content")));
        }
        if content.len() > 4000 {
            return Err(AppError::validation("message too long", Some("content")));
        }

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let room = self
            .store
            .find_room(tenant.as_str(), room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;
        if !room.is_active() {
            return Err(AppError::Conflict {
                message: "room is closed".to_string(),
            });
        }

        // Step 1: persist and fan out the customer message before anything
        // can fail.
        let customer_message = self
            .store
            .create_message(room.id, tenant.as_str(), SenderType::Customer, content, None, None)
            .await?;
        self.emit_message(&room, &customer_message);
        self.mirror_to_bridge(&room, &customer_message).await;
        self.store.touch_room(room.id).await?;

        let result = self.turn_body(tenant, &room, &customer_message, content).await;

        // The typing-off edge is emitted on every exit path.
        self.emit_typing(&room, false);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Persist an apology so the customer is not left hanging;
                // the already persisted customer message stays.
                match self
                    .store
                    .create_message(
                        room.id,
                        tenant.as_str(),
                        SenderType::Ai,
                        APOLOGY,
                        Some(json!({"error": true})),
                        None,
                    )
                    .await
                {
                    Ok(apology) => {
                        self.emit_message(&room, &apology);
                        self.mirror_to_bridge(&room, &apology).await;
                    }
                    Err(persist_err) => {
                        warn!(error = %persist_err, "Failed to persist apology message");
                    }
                }
                Err(e)
            }
        }
    }

    async fn turn_body(
        &self,
        tenant: &TenantId,
        room: &ChatRoom,
        customer_message: &Message,
        content: &str,
    ) -> Result<TurnOutcome> {
        // Step 2: history and context, loaded together.
        let (history, context) = tokio::join!(
            self.store.last_messages(room.id, self.history_limit + 1),
            self.store.get_or_create_context(room.id, tenant.as_str()),
        );
        let history = history?;
        let context = context?;

        let mut entities = context.entities();

        // History excludes the message being processed.
        let prior: Vec<Message> = history
            .into_iter()
            .filter(|m| m.id != customer_message.id)
            .collect();
        let detector_history: Vec<HistoryEntry> = prior
            .iter()
            .map(|m| HistoryEntry {
                sender: m.sender_type.clone(),
                content: m.content.clone(),
                confidence: m
                    .metadata
                    .as_ref()
                    .and_then(|meta| meta.get("confidence"))
                    .and_then(|c| c.as_f64())
                    .map(|c| if c > 1.0 { c / 100.0 } else { c }),
            })
            .collect();

        // Step 3: handover arbitration.
        if let Some(verdict) =
            detect_handover(content, &detector_history, &entities, &self.handover_config)
        {
            chatforge_common::metrics::record_handover(&verdict.reason, verdict.immediate);

            if verdict.immediate {
                return self
                    .immediate_handover(tenant, room, customer_message, &verdict, &entities)
                    .await;
            }

            // Assisted: flag the session and let the AI collect identity.
            let mut flags = Map::new();
            flags.insert("pendingHandover".to_string(), json!(true));
            flags.insert("handoverReason".to_string(), json!(verdict.reason));
            let updated = self
                .store
                .merge_entities(room.id, tenant.as_str(), &flags)
                .await?;
            entities = updated.entities();
        }

        // Step 4: the AI is "typing".
        self.emit_typing(room, true);

        // Step 5: entity extraction and the pending-handover unlock.
        let before = get_customer_identity(&entities);
        let extracted = self.extractor.extract(content).await.unwrap_or_default();
        if !extracted.is_empty() {
            let updated = self
                .store
                .merge_entities(room.id, tenant.as_str(), &extracted)
                .await?;
            entities = updated.entities();

            let identity = get_customer_identity(&entities);
            self.store
                .set_room_identity(room.id, identity.email.as_deref(), identity.name.as_deref())
                .await?;

            let newly_collected = (identity.email.is_some() && before.email.is_none())
                || (identity.name.is_some() && before.name.is_none())
                || (identity.phone.is_some() && before.phone.is_none());
            let pending = entities
                .get("pendingHandover")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            if pending && newly_collected {
                let reason = entities
                    .get("handoverReason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("assisted")
                    .to_string();
                let cleared = self
                    .store
                    .clear_handover_flags(room.id, tenant.as_str())
                    .await?;
                entities = cleared.entities();

                if let Some((agent, system_message)) =
                    self.try_assign(tenant, room, &entities).await?
                {
                    return Ok(TurnOutcome::Handover {
                        customer_message: customer_message.clone(),
                        reason,
                        assigned_agent: Some(agent),
                        system_message: Some(system_message),
                    });
                }
                // No agent free: queue the room but keep answering.
                self.enqueue_room(tenant, room, &entities).await;
            }
        }

        // Step 6: answer. Bare greetings shortcut the query core (its
        // validator would reject two-letter questions like "hi").
        let answer = if classify(content) == Route::Greeting {
            QueryAnswer {
                text: GREETING_REPLY.to_string(),
                sources: Vec::new(),
                confidence: None,
                usage: None,
                latency_ms: 0,
                cached: false,
                route: Route::Greeting.as_str().to_string(),
            }
        } else {
            let opts = QueryOptions {
                history: prior
                    .iter()
                    .map(|m| HistoryMessage {
                        sender: m.sender_type.clone(),
                        content: m.content.clone(),
                    })
                    .collect(),
                context: entities.clone(),
                top_k: None,
                prompt_type: "support".to_string(),
            };
            self.query.query(tenant, content, opts).await?
        };

        // Step 7: one response shape; fall back to an apology if the model
        // returned nothing.
        let text = if answer.text.trim().is_empty() {
            APOLOGY.to_string()
        } else {
            answer.text.clone()
        };

        // Step 8: persist and fan out the AI message.
        let metadata = json!({
            "sources": answer.sources,
            "intent": answer.route,
            "confidence": answer.confidence,
            "queryDuration": answer.latency_ms,
        });
        let ai_message = self
            .store
            .create_message(
                room.id,
                tenant.as_str(),
                SenderType::Ai,
                &text,
                Some(metadata),
                None,
            )
            .await?;
        self.emit_message(room, &ai_message);
        self.mirror_to_bridge(room, &ai_message).await;

        Ok(TurnOutcome::Answered {
            customer_message: customer_message.clone(),
            ai_message,
            sources: answer.sources,
        })
    }

    /// Immediate handover: never runs the LLM.
    async fn immediate_handover(
        &self,
        tenant: &TenantId,
        room: &ChatRoom,
        customer_message: &Message,
        verdict: &HandoverVerdict,
        entities: &Map<String, Value>,
    ) -> Result<TurnOutcome> {
        // Already assisted by a human: just remind the room.
        if room.assigned_agent_id.is_some() {
            let reminder = self
                .store
                .create_message(
                    room.id,
                    tenant.as_str(),
                    SenderType::System,
                    "An agent is already assisting this conversation.",
                    None,
                    None,
                )
                .await?;
            self.emit_message(room, &reminder);
            return Ok(TurnOutcome::Handover {
                customer_message: customer_message.clone(),
                reason: verdict.reason.clone(),
                assigned_agent: None,
                system_message: Some(reminder),
            });
        }

        if let Some((agent, system_message)) = self.try_assign(tenant, room, entities).await? {
            return Ok(TurnOutcome::Handover {
                customer_message: customer_message.clone(),
                reason: verdict.reason.clone(),
                assigned_agent: Some(agent),
                system_message: Some(system_message),
            });
        }

        // Nobody free: queue and tell the customer.
        self.enqueue_room(tenant, room, entities).await;
        let waiting = self
            .store
            .create_message(room.id, tenant.as_str(), SenderType::System, AGENTS_BUSY, None, None)
            .await?;
        self.emit_message(room, &waiting);

        Ok(TurnOutcome::Handover {
            customer_message: customer_message.clone(),
            reason: verdict.reason.clone(),
            assigned_agent: None,
            system_message: Some(waiting),
        })
    }

    // ========================================================================
    // Agent assignment
    // ========================================================================

    fn criteria_from(&self, entities: &Map<String, Value>) -> SelectionCriteria {
        let department = entities
            .get("department")
            .and_then(|v| v.as_str())
            .map(String::from);

        let required_skills = if self.skill_based_routing {
            match entities.get("handoverReason").and_then(|v| v.as_str()) {
                Some("account_issue") => vec!["billing".to_string()],
                Some("technical_issue") => vec!["technical".to_string()],
                _ => Vec::new(),
            }
        } else {
            Vec::new()
        };

        SelectionCriteria {
            department,
            required_skills,
        }
    }

    /// Select, assign and announce an agent. Returns `None` when no agent
    /// qualifies.
    async fn try_assign(
        &self,
        tenant: &TenantId,
        room: &ChatRoom,
        entities: &Map<String, Value>,
    ) -> Result<Option<(Agent, Message)>> {
        let criteria = self.criteria_from(entities);
        let Some(agent) = self.directory.select(tenant.as_str(), &criteria).await else {
            return Ok(None);
        };

        // External agents need a local user row so the room FK holds.
        let agent_user_id = match agent.source {
            AgentSourceKind::Local => agent.id.parse().map_err(|_| AppError::Internal {
                message: format!("invalid local agent id {}", agent.id),
            })?,
            AgentSourceKind::External => {
                match self.store.find_user_by_email(&agent.email).await? {
                    Some(user) => user.id,
                    None => {
                        self.store
                            .create_user(
                                tenant.as_str(),
                                &agent.name,
                                &agent.email,
                                AgentStatus::Online,
                                agent.max_concurrent,
                                agent.department.clone(),
                                agent.skills.clone(),
                                AgentSourceKind::External.as_str(),
                            )
                            .await?
                            .id
                    }
                }
            }
        };

        self.directory.update_load(&agent, 1).await?;
        let updated_room = self
            .store
            .assign_agent(room.id, agent_user_id, agent.source.as_str())
            .await?;

        let system_message = self
            .store
            .create_message(
                room.id,
                tenant.as_str(),
                SenderType::System,
                &format!(
                    "You are now connected with {}. How can they help you today?",
                    agent.name
                ),
                None,
                None,
            )
            .await?;
        self.emit_message(&updated_room, &system_message);
        self.hub.emit(
            room.id,
            tenant.as_str(),
            RoomEvent::SessionUpdate {
                room_id: room.id,
                status: updated_room.status.clone(),
                takeover: true,
                assigned_agent_id: Some(agent_user_id),
            },
        );

        let payload = AgentAssignedPayload {
            agent_email: agent.email.clone(),
            agent_name: agent.name.clone(),
            room_id: room.id,
            client_id: tenant.as_str().to_string(),
            customer_email: updated_room.customer_email.clone(),
        };
        if let Err(e) = self.bridge.agent_assigned(payload).await {
            warn!(error = %e, "Bridge agent_assigned failed");
        }

        self.queue.remove(room.id).await;
        self.store
            .clear_handover_flags(room.id, tenant.as_str())
            .await?;

        info!(
            tenant = %tenant,
            room_id = %room.id,
            agent = %agent.email,
            source = agent.source.as_str(),
            "Agent assigned"
        );
        Ok(Some((agent, system_message)))
    }

    /// Inbound `agent_assigned` from the external agent backend: a human
    /// picked the room up in the CRM. Persist the assignment and fan it out.
    pub async fn assign_external_by_email(
        &self,
        tenant: &TenantId,
        room_id: Uuid,
        agent_name: &str,
        agent_email: &str,
    ) -> Result<ChatRoom> {
        let room = self
            .store
            .find_room(tenant.as_str(), room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let user = match self.store.find_user_by_email(agent_email).await? {
            Some(user) => user,
            None => {
                self.store
                    .create_user(
                        tenant.as_str(),
                        agent_name,
                        agent_email,
                        AgentStatus::Online,
                        1,
                        None,
                        Vec::new(),
                        AgentSourceKind::External.as_str(),
                    )
                    .await?
            }
        };

        let updated = self
            .store
            .assign_agent(room.id, user.id, AgentSourceKind::External.as_str())
            .await?;

        let system_message = self
            .store
            .create_message(
                room.id,
                tenant.as_str(),
                SenderType::System,
                &format!(
                    "You are now connected with {agent_name}. How can they help you today?"
                ),
                None,
                None,
            )
            .await?;
        self.emit_message(&updated, &system_message);
        self.hub.emit(
            room.id,
            tenant.as_str(),
            RoomEvent::SessionUpdate {
                room_id: room.id,
                status: updated.status.clone(),
                takeover: true,
                assigned_agent_id: Some(user.id),
            },
        );

        self.queue.remove(room.id).await;
        self.store
            .clear_handover_flags(room.id, tenant.as_str())
            .await?;

        Ok(updated)
    }

    /// Manual escalation (`POST /chat/escalate`).
    pub async fn escalate(&self, tenant: &TenantId, room_id: Uuid) -> Result<TurnOutcome> {
        let room = self
            .store
            .find_room(tenant.as_str(), room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let context = self.store.get_or_create_context(room.id, tenant.as_str()).await?;
        let entities = context.entities();

        let escalation = self
            .store
            .create_message(
                room.id,
                tenant.as_str(),
                SenderType::Customer,
                "Customer requested an agent.",
                Some(json!({"escalation": true})),
                None,
            )
            .await?;

        let verdict = HandoverVerdict {
            immediate: true,
            reason: "explicit_request".to_string(),
            confidence: 1.0,
            message: String::new(),
        };
        self.immediate_handover(tenant, &room, &escalation, &verdict, &entities)
            .await
    }

    /// Persist a human agent's message and fan it out.
    pub async fn agent_message(
        &self,
        tenant: &TenantId,
        room_id: Uuid,
        agent_id: Option<Uuid>,
        content: &str,
    ) -> Result<Message> {
        let room = self
            .store
            .find_room(tenant.as_str(), room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound {
                id: room_id.to_string(),
            })?;

        let message = self
            .store
            .create_message(
                room.id,
                tenant.as_str(),
                SenderType::Agent,
                content,
                None,
                agent_id,
            )
            .await?;
        self.emit_message(&room, &message);
        self.store.touch_room(room.id).await?;
        Ok(message)
    }

    /// Release one unit of an agent's load and try to hand the next queued
    /// room to them.
    pub async fn release_agent(
        &self,
        tenant: &TenantId,
        agent_user_id: Uuid,
        agent_source: Option<&str>,
    ) -> Result<()> {
        let Some(user) = self.store.find_user(agent_user_id).await? else {
            return Ok(());
        };

        let agent = Agent {
            id: if agent_source == Some("external") {
                user.email.clone()
            } else {
                user.id.to_string()
            },
            source: if agent_source == Some("external") {
                AgentSourceKind::External
            } else {
                AgentSourceKind::Local
            },
            name: user.name.clone(),
            email: user.email.clone(),
            status: user.status.clone(),
            max_concurrent: user.max_concurrent,
            current_load: user.current_load,
            department: user.department.clone(),
            skills: user.skill_list(),
        };

        self.directory.update_load(&agent, -1).await?;
        info!(tenant = %tenant, agent = %agent.email, "Agent released");
        Ok(())
    }

    async fn enqueue_room(&self, tenant: &TenantId, room: &ChatRoom, entities: &Map<String, Value>) {
        let priority = match entities.get("vip").and_then(|v| v.as_bool()) {
            Some(true) => Priority::Vip,
            _ => Priority::Normal,
        };
        let criteria = self.criteria_from(entities);

        self.queue
            .enqueue(QueueEntry {
                tenant_id: tenant.as_str().to_string(),
                room_id: room.id,
                priority,
                department: criteria.department,
                required_skills: criteria.required_skills,
                enqueued_at: Utc::now(),
                customer_info: json!({
                    "email": room.customer_email,
                    "name": room.customer_name,
                    "visitor_id": room.visitor_id,
                }),
            })
            .await;
    }

    /// Try to assign the next waiting room of a tenant. Invoked when an
    /// agent frees up.
    pub async fn drive_queue(&self, tenant: &TenantId) {
        let Some(entry) = self.queue.dequeue(tenant.as_str()).await else {
            return;
        };

        let room = match self.store.find_room(tenant.as_str(), entry.room_id).await {
            Ok(Some(room)) if room.is_active() => room,
            _ => return,
        };

        let entities = match self
            .store
            .get_or_create_context(room.id, tenant.as_str())
            .await
        {
            Ok(ctx) => ctx.entities(),
            Err(_) => Map::new(),
        };

        match self.try_assign(tenant, &room, &entities).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                // Still nobody free: put the entry back with its clock.
                self.queue.enqueue(entry).await;
            }
            Err(e) => {
                warn!(error = %e, room_id = %room.id, "Queue-driven assignment failed");
                self.queue.enqueue(entry).await;
            }
        }
    }

    // ========================================================================
    // Background sweeps
    // ========================================================================

    /// Close rooms idle past the TTL. Errors are logged and swallowed.
    pub async fn sweep_inactive_rooms(&self) {
        let cutoff = Utc::now() - self.inactivity_ttl;
        let stale = match self.store.stale_active_rooms(cutoff).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(error = %e, "Stale-room sweep query failed");
                return;
            }
        };

        for room in stale {
            let tenant = match TenantId::parse(&room.tenant_id) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if let Err(e) = self.close_session(&tenant, room.id).await {
                warn!(error = %e, room_id = %room.id, "Stale-room close failed");
            } else {
                info!(room_id = %room.id, "Inactive room closed by sweep");
            }
        }
    }

    /// Drop timed-out queue entries and tell the affected rooms.
    pub async fn sweep_queue(&self) {
        for entry in self.queue.sweep_expired().await {
            let message = self
                .store
                .create_message(
                    entry.room_id,
                    &entry.tenant_id,
                    SenderType::System,
                    "We could not reach an agent in time. Please try again later or leave your email.",
                    None,
                    None,
                )
                .await;
            match message {
                Ok(m) => {
                    if let Ok(Some(room)) =
                        self.store.find_room(&entry.tenant_id, entry.room_id).await
                    {
                        self.emit_message(&room, &m);
                    }
                }
                Err(e) => warn!(error = %e, "Queue-timeout message failed"),
            }
        }
    }

    // ========================================================================
    // Fan-out helpers
    // ========================================================================

    fn emit_message(&self, room: &ChatRoom, message: &Message) {
        self.hub.emit(
            room.id,
            &room.tenant_id,
            RoomEvent::NewMessage {
                message: MessageDto::from(message),
            },
        );
    }

    fn emit_typing(&self, room: &ChatRoom, is_typing: bool) {
        self.hub.emit(
            room.id,
            &room.tenant_id,
            RoomEvent::UserTyping {
                sender: "ai".to_string(),
                is_typing,
            },
        );
    }

    async fn mirror_to_bridge(&self, room: &ChatRoom, message: &Message) {
        let payload = WidgetMessagePayload::from_message(message, room);
        if let Err(e) = self.bridge.widget_message(payload).await {
            warn!(error = %e, "Bridge widget_message failed");
        }
    }

    /// Direct access to the hub for the websocket layer.
    pub fn hub(&self) -> Arc<RoomHub> {
        self.hub.clone()
    }

    /// Waiting-queue position for a room, if queued.
    pub async fn queue_position(&self, tenant: &TenantId, room_id: Uuid) -> Option<usize> {
        self.queue.position(tenant.as_str(), room_id).await
    }
}
