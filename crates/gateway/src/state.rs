//! Application state
//!
//! The single construction site for every long-lived component: stores,
//! gateways, services, caches and the realtime hub. Tests construct their
//! own instances against in-memory stores.

use chatforge_common::auth::JwtManager;
use chatforge_common::config::AppConfig;
use chatforge_common::db::{DbPool, Repository};
use chatforge_common::embeddings::create_embedder;
use chatforge_common::errors::{AppError, Result};
use chatforge_common::llm::create_llm;
use chatforge_common::vector::{MemoryVectorStore, QdrantStore};
use chatforge_common::{LlmClient, TenantId, VectorStore};
use chatforge_conversation::directory::{
    ExternalAgentSource, ExternalSqlAgentSource, LocalAgentSource,
};
use chatforge_conversation::{
    AgentDirectory, AgentSource, ConversationService, EntityExtractor, NoopBridge, RoomHub,
    WaitingQueue,
};
use chatforge_conversation::realtime::{AgentBridge, HttpBridge};
use chatforge_ingestion::media::OllamaMediaGateway;
use chatforge_ingestion::{IndexService, TenantAdmin};
use chatforge_query::QueryService;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Repository,
    pub index: Arc<IndexService>,
    pub query: Arc<QueryService>,
    pub conversation: Arc<ConversationService>,
    pub admin: Arc<TenantAdmin>,
    pub hub: Arc<RoomHub>,
    pub vector: Arc<dyn VectorStore>,
    pub llm: Arc<dyn LlmClient>,
    pub jwt: Option<Arc<JwtManager>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component from configuration.
    pub async fn build(config: Arc<AppConfig>, db: DbPool) -> Result<Self> {
        let repo = Repository::new(db);

        // Vector store: a memory: URL keeps local development self-contained.
        let vector: Arc<dyn VectorStore> = if config.vector.url.starts_with("memory:") {
            warn!("Using the in-memory vector store; data will not survive a restart");
            Arc::new(MemoryVectorStore::new())
        } else {
            Arc::new(QdrantStore::new(&config.vector)?)
        };

        let embedder = create_embedder(&config.embedding);
        let llm = create_llm(&config.llm);

        let media = Arc::new(OllamaMediaGateway::new(
            config.llm.base_url.clone(),
            config.llm.model.clone(),
            Duration::from_secs(config.llm.timeout_secs),
        ));

        let index = Arc::new(IndexService::new(
            vector.clone(),
            embedder.clone(),
            media,
            config.ingestion.clone(),
            config.vector.collection_prefix.clone(),
            config.embedding.batch_size,
        ));

        let query = Arc::new(QueryService::new(
            vector.clone(),
            embedder.clone(),
            llm.clone(),
            config.query.clone(),
            config.vector.collection_prefix.clone(),
        ));

        let admin = Arc::new(TenantAdmin::new(
            vector.clone(),
            config.vector.collection_prefix.clone(),
        ));

        let hub = Arc::new(RoomHub::new());
        let queue = Arc::new(WaitingQueue::new(Duration::from_millis(
            config.agents.queue_timeout_ms,
        )));

        let mut sources: Vec<Arc<dyn AgentSource>> =
            vec![Arc::new(LocalAgentSource::new(Arc::new(repo.clone())))];
        if config.agents.external.enabled {
            match config.agents.external.kind.as_str() {
                "sql" => match ExternalSqlAgentSource::connect(config.agents.external.clone()).await
                {
                    Ok(source) => sources.push(Arc::new(source)),
                    Err(e) => warn!(error = %e, "External SQL agent source disabled"),
                },
                _ => sources.push(Arc::new(ExternalAgentSource::new(
                    config.agents.external.clone(),
                ))),
            }
        }
        let directory = Arc::new(AgentDirectory::new(sources, config.agents.prefer_local));

        let bridge: Arc<dyn AgentBridge> = match config.agents.external.api_url.clone() {
            Some(url) if config.agents.external.enabled => Arc::new(HttpBridge::new(
                url,
                config.agents.external.api_key.clone(),
            )),
            _ => Arc::new(NoopBridge),
        };

        let conversation = Arc::new(ConversationService::new(
            Arc::new(repo.clone()),
            query.clone(),
            EntityExtractor::new(llm.clone()),
            hub.clone(),
            bridge,
            queue,
            directory,
            &config.session,
            config.agents.skill_based_routing,
        ));

        let jwt = config
            .auth
            .jwt_secret
            .as_ref()
            .map(|secret| Arc::new(JwtManager::new(secret, config.auth.jwt_expiration_secs)));
        if jwt.is_none() {
            warn!("JWT_SECRET not set; tenant admin routes are unprotected");
        }

        info!("Application state constructed");

        Ok(Self {
            config,
            repo,
            index,
            query,
            conversation,
            admin,
            hub,
            vector,
            llm,
            jwt,
            started_at: Instant::now(),
        })
    }

    /// Resolve the tenant for a widget request: a client id, or a numeric
    /// product id mapped through the clients table.
    pub async fn resolve_tenant(
        &self,
        client_id: Option<&str>,
        product_id: Option<i64>,
    ) -> Result<TenantId> {
        if let Some(client_id) = client_id {
            let tenant = TenantId::parse(client_id)?;
            return Ok(tenant);
        }

        if let Some(product_id) = product_id {
            let client = self
                .repo
                .find_client_by_product_id(product_id)
                .await?
                .ok_or_else(|| AppError::NotFound {
                    resource_type: "client".to_string(),
                    id: product_id.to_string(),
                })?;
            return TenantId::parse(&client.tenant_id);
        }

        Err(AppError::MissingField {
            field: "clientId".to_string(),
        })
    }
}
