//! Chatforge API Gateway
//!
//! The single entry point for widget, admin and agent traffic. Handles:
//! - Chat session and message routing
//! - Document upload and indexing
//! - RAG query endpoints (blocking, SSE streaming, semantic search)
//! - Tenant administration
//! - Websocket realtime protocol
//! - Observability (logging, metrics, tracing)

mod handlers;
mod middleware;
mod state;
mod ws;

use axum::{
    routing::{delete, get, post},
    Router,
};
use chatforge_common::{config::AppConfig, db::DbPool, metrics};
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    // Initialize tracing
    let filter = EnvFilter::try_new(&config.observability.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if config.observability.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting Chatforge gateway v{}", chatforge_common::VERSION);

    // Initialize metrics
    metrics::register_metrics();

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;

    // Wire up all long-lived components (single construction site).
    let state = AppState::build(Arc::new(config.clone()), db).await?;

    // Background sweeps: queue timeouts and stale-room closing.
    spawn_sweeps(&state);

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let limiter = middleware::rate_limit::create_rate_limiter(
        state.config.rate_limit.requests_per_second,
        state.config.rate_limit.burst,
    );
    let rate_limited = state.config.rate_limit.enabled;

    let api_routes = Router::new()
        // Health (no auth)
        .route("/health", get(handlers::health::health))
        // Chat surface
        .route("/chat/session", post(handlers::chat::start_session))
        .route("/chat/message", post(handlers::chat::send_message))
        .route("/chat/history/{room_id}", get(handlers::chat::history))
        .route(
            "/chat/conversations/{client_id}",
            get(handlers::chat::conversations),
        )
        .route("/chat/escalate", post(handlers::chat::escalate))
        .route("/chat/close", post(handlers::chat::close))
        .route("/chat/agent/message", post(handlers::chat::agent_message))
        // Documents
        .route("/documents/upload", post(handlers::documents::upload))
        .route(
            "/documents/batch-upload",
            post(handlers::documents::batch_upload),
        )
        .route(
            "/documents/{tenant_id}",
            delete(handlers::documents::delete_documents),
        )
        .route(
            "/documents/stats/{tenant_id}",
            get(handlers::documents::stats),
        )
        // Query surface
        .route("/query", post(handlers::query::query))
        .route("/query/stream", post(handlers::query::stream))
        .route(
            "/query/semantic-search",
            post(handlers::query::semantic_search),
        )
        .route("/query/hybrid", post(handlers::query::hybrid))
        // Tenant admin
        .route("/tenants", get(handlers::tenants::list))
        .route("/tenants/{tenant_id}", get(handlers::tenants::stats))
        .route("/tenants/{tenant_id}", delete(handlers::tenants::delete))
        // Inbound bridge events from the external agent backend
        .route(
            "/bridge/widget-message",
            post(handlers::bridge::widget_message_received),
        )
        .route(
            "/bridge/agent-assigned",
            post(handlers::bridge::agent_assigned),
        )
        // Realtime
        .route("/ws", get(ws::ws_handler));

    let mut app = Router::new()
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id);

    if rate_limited {
        app = app.layer(axum::middleware::from_fn(move |req, next| {
            let limiter = limiter.clone();
            middleware::rate_limit::rate_limit_middleware(req, next, limiter)
        }));
    }

    app.with_state(state)
}

/// Background maintenance loops. Errors inside are logged and swallowed by
/// the sweeps themselves.
fn spawn_sweeps(state: &AppState) {
    let conversation = state.conversation.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            conversation.sweep_queue().await;
        }
    });

    let conversation = state.conversation.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tick.tick().await;
            conversation.sweep_inactive_rooms().await;
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
