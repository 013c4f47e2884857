//! End-to-end turn flows against in-memory stores.

use chatforge_common::config::{QueryConfig, SessionConfig};
use chatforge_common::embeddings::MockEmbedder;
use chatforge_common::llm::MockLlm;
use chatforge_common::vector::{ChunkPoint, MemoryVectorStore, VectorStore};
use chatforge_common::{Embedder, LlmClient, TenantId};
use chatforge_conversation::directory::LocalAgentSource;
use chatforge_conversation::realtime::RoomEvent;
use chatforge_conversation::{
    AgentDirectory, ChannelBridge, ConversationService, EntityExtractor, MemorySessionStore,
    RoomHub, SessionStore, TurnOutcome, WaitingQueue,
};
use chatforge_query::QueryService;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Fixture {
    service: ConversationService,
    store: Arc<MemorySessionStore>,
    hub: Arc<RoomHub>,
    queue: Arc<WaitingQueue>,
    assigned_rx: tokio::sync::mpsc::UnboundedReceiver<chatforge_conversation::realtime::AgentAssignedPayload>,
    widget_rx: tokio::sync::mpsc::UnboundedReceiver<chatforge_conversation::realtime::WidgetMessagePayload>,
}

async fn fixture_with_llm(llm: Arc<dyn LlmClient>) -> Fixture {
    let store = Arc::new(MemorySessionStore::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(MockEmbedder::new(16));

    // One indexed document for tenant acme.
    let collection = "chatforge_acme";
    vectors.ensure_collection(collection, 16).await.unwrap();
    let text = "Our refund window is 14 days.";
    let mut payload = serde_json::Map::new();
    payload.insert("tenant_id".into(), json!("acme"));
    payload.insert("document_id".into(), json!("policy"));
    payload.insert("chunk_index".into(), json!(0));
    payload.insert("source".into(), json!("policy.txt"));
    payload.insert("text".into(), json!(text));
    vectors
        .upsert(
            collection,
            vec![ChunkPoint {
                id: Uuid::new_v4(),
                vector: embedder.embed(text).await.unwrap(),
                payload,
            }],
        )
        .await
        .unwrap();

    let query = Arc::new(QueryService::new(
        vectors,
        embedder,
        llm.clone(),
        QueryConfig {
            top_k: 3,
            max_concurrent: 10,
            timeout_secs: 30,
            cache_ttl_secs: 1800,
            cache_capacity: 100,
        },
        "chatforge".to_string(),
    ));

    let hub = Arc::new(RoomHub::new());
    let (bridge, widget_rx, assigned_rx) = ChannelBridge::new();
    let queue = Arc::new(WaitingQueue::new(Duration::from_secs(600)));
    let directory = Arc::new(AgentDirectory::new(
        vec![Arc::new(LocalAgentSource::new(store.clone()))],
        true,
    ));

    let service = ConversationService::new(
        store.clone(),
        query,
        EntityExtractor::new(llm),
        hub.clone(),
        Arc::new(bridge),
        queue.clone(),
        directory,
        &SessionConfig {
            history_limit: 10,
            inactivity_ttl_days: 7,
        },
        false,
    );

    Fixture {
        service,
        store,
        hub,
        queue,
        assigned_rx,
        widget_rx,
    }
}

async fn fixture() -> Fixture {
    fixture_with_llm(Arc::new(MockLlm::new("Our refund window is 14 days."))).await
}

fn tenant() -> TenantId {
    TenantId::parse("acme").unwrap()
}

#[tokio::test]
async fn new_session_greeting_only() {
    let mut fx = fixture().await;
    let t = tenant();

    let session = fx
        .service
        .start_session(&t, None, Some("vis_X"), None)
        .await
        .unwrap();
    assert!(session.is_new);
    assert!(session.messages.is_empty());
    assert!(session.room.session_token.starts_with("sess_"));

    let outcome = fx
        .service
        .process_message(&t, session.room.id, "hi")
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Answered { ai_message, sources, .. } => {
            assert!(ai_message.content.starts_with("Hello"));
            assert!(sources.is_empty());
        }
        other => panic!("expected Answered, got {other:?}"),
    }

    // Both messages persisted, strictly ordered.
    let messages = fx.store.list_messages(session.room.id, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender_type, "customer");
    assert_eq!(messages[1].sender_type, "ai");
    assert!(messages[0].created_at <= messages[1].created_at);

    // Customer and AI messages both mirrored to the bridge.
    assert_eq!(fx.widget_rx.recv().await.unwrap().sender_type, "customer");
    assert_eq!(fx.widget_rx.recv().await.unwrap().sender_type, "ai");
}

#[tokio::test]
async fn resumed_session_returns_history() {
    let fx = fixture().await;
    let t = tenant();

    let first = fx
        .service
        .start_session(&t, None, Some("vis_Y"), None)
        .await
        .unwrap();
    fx.service
        .process_message(&t, first.room.id, "hi")
        .await
        .unwrap();

    let resumed = fx
        .service
        .start_session(&t, Some(&first.room.session_token), None, None)
        .await
        .unwrap();
    assert!(!resumed.is_new);
    assert_eq!(resumed.room.id, first.room.id);
    assert_eq!(resumed.messages.len(), 2);
}

#[tokio::test]
async fn rag_turn_answers_with_sources() {
    let fx = fixture().await;
    let t = tenant();

    let session = fx
        .service
        .start_session(&t, None, Some("vis_rag"), None)
        .await
        .unwrap();

    let outcome = fx
        .service
        .process_message(&t, session.room.id, "What colors do your chairs come in?")
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Answered { ai_message, sources, .. } => {
            assert!(ai_message.content.contains("14 days"));
            assert!(!sources.is_empty());
            let meta = ai_message.metadata.unwrap();
            assert!(meta.get("confidence").is_some());
            assert_eq!(meta.get("intent").unwrap(), "vector");
        }
        other => panic!("expected Answered, got {other:?}"),
    }
}

#[tokio::test]
async fn immediate_handover_assigns_an_agent_and_skips_the_llm() {
    let mut fx = fixture_with_llm(Arc::new(MockLlm::new("MUST NOT APPEAR"))).await;
    let t = tenant();
    let agent = fx.store.seed_agent("acme", "Sam Lee", "sam@acme.co", 3).await;

    let session = fx
        .service
        .start_session(&t, None, Some("vis_ho"), None)
        .await
        .unwrap();

    let outcome = fx
        .service
        .process_message(&t, session.room.id, "I want to speak to a human agent")
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Handover {
            reason,
            assigned_agent,
            system_message,
            ..
        } => {
            assert_eq!(reason, "explicit_request");
            assert_eq!(assigned_agent.unwrap().email, "sam@acme.co");
            assert!(system_message
                .unwrap()
                .content
                .starts_with("You are now connected with Sam Lee"));
        }
        other => panic!("expected Handover, got {other:?}"),
    }

    // Room taken over, agent load incremented, bridge notified.
    let room = fx.store.find_room("acme", session.room.id).await.unwrap().unwrap();
    assert!(room.takeover);
    assert_eq!(room.assigned_agent_id, Some(agent.id));
    assert_eq!(room.agent_source.as_deref(), Some("local"));

    let user = fx.store.find_user(agent.id).await.unwrap().unwrap();
    assert_eq!(user.current_load, 1);

    let payload = fx.assigned_rx.recv().await.unwrap();
    assert_eq!(payload.agent_email, "sam@acme.co");

    // The LLM never produced a message.
    let messages = fx.store.list_messages(session.room.id, 10).await.unwrap();
    assert!(messages.iter().all(|m| !m.content.contains("MUST NOT APPEAR")));
    assert!(messages.iter().all(|m| m.sender_type != "ai"));
}

#[tokio::test]
async fn immediate_handover_without_agents_queues_the_room() {
    let fx = fixture().await;
    let t = tenant();

    let session = fx
        .service
        .start_session(&t, None, Some("vis_q"), None)
        .await
        .unwrap();

    let outcome = fx
        .service
        .process_message(&t, session.room.id, "talk to a real person please")
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Handover {
            assigned_agent,
            system_message,
            ..
        } => {
            assert!(assigned_agent.is_none());
            assert!(system_message
                .unwrap()
                .content
                .contains("All our agents are currently busy"));
        }
        other => panic!("expected Handover, got {other:?}"),
    }

    assert_eq!(
        fx.service.queue_position(&t, session.room.id).await,
        Some(0)
    );
}

#[tokio::test]
async fn assisted_handover_unlocks_on_identity() {
    let fx = fixture().await;
    let t = tenant();

    let session = fx
        .service
        .start_session(&t, None, Some("vis_id"), None)
        .await
        .unwrap();

    // Turn one: payment issue with empty context stays with the AI.
    let outcome = fx
        .service
        .process_message(&t, session.room.id, "My payment failed")
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Answered { .. }));

    let ctx = fx
        .store
        .get_or_create_context(session.room.id, "acme")
        .await
        .unwrap();
    let entities = ctx.entities();
    assert_eq!(entities.get("pendingHandover").unwrap(), true);
    assert_eq!(entities.get("handoverReason").unwrap(), "account_issue");

    // An agent comes online before the identity arrives.
    fx.store.seed_agent("acme", "Ana", "ana@acme.co", 2).await;

    // Turn two: identity unlocks the pending handover.
    let outcome = fx
        .service
        .process_message(&t, session.room.id, "I'm Jane Doe, jane@x.co")
        .await
        .unwrap();

    match outcome {
        TurnOutcome::Handover {
            reason,
            assigned_agent,
            ..
        } => {
            assert_eq!(reason, "account_issue");
            assert_eq!(assigned_agent.unwrap().email, "ana@acme.co");
        }
        other => panic!("expected Handover, got {other:?}"),
    }

    // Entities merged, flags cleared, identity mirrored onto the room.
    let ctx = fx
        .store
        .get_or_create_context(session.room.id, "acme")
        .await
        .unwrap();
    let entities = ctx.entities();
    assert_eq!(entities.get("email").unwrap(), "jane@x.co");
    assert_eq!(entities.get("name").unwrap(), "Jane Doe");
    assert!(entities.get("pendingHandover").is_none());

    let room = fx.store.find_room("acme", session.room.id).await.unwrap().unwrap();
    assert_eq!(room.customer_email.as_deref(), Some("jane@x.co"));
    assert_eq!(room.customer_name.as_deref(), Some("Jane Doe"));
}

#[tokio::test]
async fn generation_failure_persists_an_apology() {
    use async_trait::async_trait;
    use chatforge_common::errors::AppError;
    use chatforge_common::llm::{Generation, LlmStream};

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn generate(&self, _prompt: &str) -> chatforge_common::Result<Generation> {
            Err(AppError::Llm {
                message: "provider unavailable".to_string(),
            })
        }
        async fn stream(&self, _prompt: &str) -> chatforge_common::Result<LlmStream> {
            Err(AppError::Llm {
                message: "provider unavailable".to_string(),
            })
        }
        fn model_name(&self) -> &str {
            "failing"
        }
        async fn health(&self) -> chatforge_common::Result<()> {
            Err(AppError::Llm {
                message: "down".to_string(),
            })
        }
    }

    let fx = fixture_with_llm(Arc::new(FailingLlm)).await;
    let t = tenant();

    let session = fx
        .service
        .start_session(&t, None, Some("vis_err"), None)
        .await
        .unwrap();

    let result = fx
        .service
        .process_message(&t, session.room.id, "What is your refund window?")
        .await;
    assert!(result.is_err());

    // Customer message kept, apology persisted after it.
    let messages = fx.store.list_messages(session.room.id, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender_type, "customer");
    assert_eq!(messages[1].sender_type, "ai");
    assert!(messages[1].content.contains("I apologize"));
}

#[tokio::test]
async fn fan_out_emits_typing_edges_around_the_answer() {
    let fx = fixture().await;
    let t = tenant();

    let session = fx
        .service
        .start_session(&t, None, Some("vis_rt"), None)
        .await
        .unwrap();
    let mut rx = fx.hub.subscribe(session.room.id, "acme");

    fx.service
        .process_message(&t, session.room.id, "What is your refund window?")
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            RoomEvent::NewMessage { message } => {
                if message.sender_type == "customer" {
                    "customer"
                } else {
                    "ai"
                }
            }
            RoomEvent::UserTyping { is_typing: true, .. } => "typing_on",
            RoomEvent::UserTyping { is_typing: false, .. } => "typing_off",
            _ => "other",
        })
        .collect();

    assert_eq!(kinds, vec!["customer", "typing_on", "ai", "typing_off"]);
}

#[tokio::test]
async fn close_session_releases_the_agent_and_drives_the_queue() {
    let fx = fixture().await;
    let t = tenant();
    let agent = fx.store.seed_agent("acme", "Sam", "sam@acme.co", 1).await;

    // First room takes the only agent.
    let first = fx
        .service
        .start_session(&t, None, Some("vis_1"), None)
        .await
        .unwrap();
    fx.service
        .process_message(&t, first.room.id, "I need a human agent")
        .await
        .unwrap();
    assert_eq!(fx.store.find_user(agent.id).await.unwrap().unwrap().current_load, 1);

    // Second room queues.
    let second = fx
        .service
        .start_session(&t, None, Some("vis_2"), None)
        .await
        .unwrap();
    fx.service
        .process_message(&t, second.room.id, "talk to a human please")
        .await
        .unwrap();
    assert_eq!(fx.queue.len().await, 1);

    // Closing the first room frees the agent and assigns the second room.
    fx.service.close_session(&t, first.room.id).await.unwrap();

    assert!(fx.queue.is_empty().await);
    let second_room = fx.store.find_room("acme", second.room.id).await.unwrap().unwrap();
    assert!(second_room.takeover);
    assert_eq!(second_room.assigned_agent_id, Some(agent.id));
}

#[tokio::test]
async fn turns_stay_ordered_within_a_room() {
    let fx = fixture().await;
    let t = tenant();

    let session = fx
        .service
        .start_session(&t, None, Some("vis_ord"), None)
        .await
        .unwrap();

    for text in ["hi", "What is your refund window?", "thanks a lot friend"] {
        fx.service
            .process_message(&t, session.room.id, text)
            .await
            .unwrap();
    }

    let messages = fx.store.list_messages(session.room.id, 50).await.unwrap();
    assert_eq!(messages.len(), 6);
    for pair in messages.windows(2) {
        assert!(
            (pair[0].created_at, pair[0].id) < (pair[1].created_at, pair[1].id),
            "messages out of order"
        );
    }
}
