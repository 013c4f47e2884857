//! Configuration management for Chatforge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{env}.toml)
//! - Default values
//!
//! The flat, documented environment keys (`VECTOR_URL`, `LLM_PROVIDER`,
//! `CHUNK_SIZE`, ...) are applied as explicit overrides on top, so a bare
//! `.env` is enough to run the server.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Vector store configuration
    #[serde(default)]
    pub vector: VectorConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// LLM provider configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Ingestion pipeline configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Query pipeline configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Conversation / session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Agent directory configuration
    #[serde(default)]
    pub agents: AgentConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    #[serde(default = "default_db_url")]
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorConfig {
    /// Vector store URL
    #[serde(default = "default_vector_url")]
    pub url: String,

    /// API key (optional)
    pub api_key: Option<String>,

    /// Collection name prefix; tenant collections are `{prefix}_{tenant_id}`
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,

    /// Client pool size (handles are picked at random per call)
    #[serde(default = "default_vector_pool")]
    pub pool_size: usize,

    /// Timeout for point-level operations in seconds
    #[serde(default = "default_vector_timeout")]
    pub timeout_secs: u64,

    /// Timeout for scroll/scan operations in seconds
    #[serde(default = "default_scroll_timeout")]
    pub scroll_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: ollama, gemini, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for hosted providers
    pub api_key: Option<String>,

    /// API base URL (for self-hosted endpoints)
    pub base_url: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Batch size for embedding requests
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// LLM provider: ollama, gemini, mock
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Model identifier
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// API base URL
    pub base_url: Option<String>,

    /// API key for hosted providers
    pub api_key: Option<String>,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum output tokens
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries for transient provider failures
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between chunks in characters
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Maximum concurrent indexing jobs
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: usize,

    /// Per-job wall-clock timeout in seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Maximum concurrent embedding batch groups
    #[serde(default = "default_embed_groups")]
    pub max_embedding_groups: usize,

    /// Directory for the on-disk chunk cache
    #[serde(default = "default_chunk_cache_dir")]
    pub chunk_cache_dir: String,

    /// Maximum upload size in bytes
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    /// Maximum upload size for plain-text formats in bytes
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Number of chunks retrieved per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Maximum concurrent queries
    #[serde(default = "default_query_concurrency")]
    pub max_concurrent: usize,

    /// Per-query wall-clock timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub timeout_secs: u64,

    /// Answer cache TTL in seconds
    #[serde(default = "default_answer_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Answer cache capacity (entries)
    #[serde(default = "default_answer_cache_capacity")]
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Messages of history passed to the LLM per turn
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Days of inactivity before a room is closed by the sweep
    #[serde(default = "default_room_ttl_days")]
    pub inactivity_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Prefer local agents when scoring
    #[serde(default = "default_prefer_local")]
    pub prefer_local: bool,

    /// Enable skill-based routing
    #[serde(default)]
    pub skill_based_routing: bool,

    /// Waiting-queue entry timeout in milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// External directory integration
    #[serde(default)]
    pub external: ExternalAgentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExternalAgentConfig {
    /// Enable the external agent source
    #[serde(default)]
    pub enabled: bool,

    /// Transport: api or sql
    #[serde(default = "default_external_kind")]
    pub kind: String,

    /// REST API base URL (api transport)
    pub api_url: Option<String>,

    /// REST API key (api transport)
    pub api_key: Option<String>,

    /// Database URI (sql transport)
    pub db_uri: Option<String>,

    /// Table holding agents (sql transport)
    #[serde(default = "default_external_table")]
    pub table_name: String,

    /// Column/field mappings onto the normalized Agent shape
    #[serde(default)]
    pub fields: ExternalAgentFields,
}

impl Default for ExternalAgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: default_external_kind(),
            api_url: None,
            api_key: None,
            db_uri: None,
            table_name: default_external_table(),
            fields: ExternalAgentFields::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExternalAgentFields {
    #[serde(default = "f_id")]
    pub id: String,
    #[serde(default = "f_name")]
    pub name: String,
    #[serde(default = "f_email")]
    pub email: String,
    #[serde(default = "f_status")]
    pub status: String,
    #[serde(default = "f_max_concurrent")]
    pub max_concurrent: String,
    #[serde(default = "f_current_load")]
    pub current_load: String,
    #[serde(default = "f_department")]
    pub department: String,
    #[serde(default = "f_skills")]
    pub skills: String,
}

impl Default for ExternalAgentFields {
    fn default() -> Self {
        Self {
            id: f_id(),
            name: f_name(),
            email: f_email(),
            status: f_status(),
            max_concurrent: f_max_concurrent(),
            current_load: f_current_load(),
            department: f_department(),
            skills: f_skills(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// JWT secret for token verification
    pub jwt_secret: Option<String>,

    /// JWT expiration in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Deployment environment label reported by /health
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3000 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_db_url() -> String { "postgres://localhost/chatforge".to_string() }
fn default_max_connections() -> u32 { 50 }
fn default_min_connections() -> u32 { 5 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_vector_url() -> String { "http://localhost:6334".to_string() }
fn default_collection_prefix() -> String { "chatforge".to_string() }
fn default_vector_pool() -> usize { 10 }
fn default_vector_timeout() -> u64 { 10 }
fn default_scroll_timeout() -> u64 { 60 }
fn default_embedding_provider() -> String { "ollama".to_string() }
fn default_embedding_model() -> String { crate::DEFAULT_EMBEDDING_MODEL.to_string() }
fn default_embedding_dimension() -> usize { crate::DEFAULT_EMBEDDING_DIMENSION }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_embedding_batch_size() -> usize { 50 }
fn default_llm_provider() -> String { "ollama".to_string() }
fn default_llm_model() -> String { "llama3.1".to_string() }
fn default_temperature() -> f32 { 0.2 }
fn default_max_output_tokens() -> u32 { 1024 }
fn default_llm_timeout() -> u64 { 30 }
fn default_llm_retries() -> u32 { 3 }
fn default_chunk_size() -> usize { 1000 }
fn default_chunk_overlap() -> usize { 100 }
fn default_max_jobs() -> usize { 3 }
fn default_job_timeout() -> u64 { 300 }
fn default_embed_groups() -> usize { 3 }
fn default_chunk_cache_dir() -> String { ".chatforge/chunk-cache".to_string() }
fn default_max_file_bytes() -> usize { 50 * 1024 * 1024 }
fn default_max_text_bytes() -> usize { 10 * 1024 * 1024 }
fn default_top_k() -> usize { 3 }
fn default_query_concurrency() -> usize { 10 }
fn default_query_timeout() -> u64 { 30 }
fn default_answer_cache_ttl() -> u64 { 1800 }
fn default_answer_cache_capacity() -> usize { 1000 }
fn default_history_limit() -> usize { 10 }
fn default_room_ttl_days() -> i64 { 7 }
fn default_prefer_local() -> bool { true }
fn default_queue_timeout_ms() -> u64 { 600_000 }
fn default_external_kind() -> String { "api".to_string() }
fn default_external_table() -> String { "agents".to_string() }
fn f_id() -> String { "id".to_string() }
fn f_name() -> String { "name".to_string() }
fn f_email() -> String { "email".to_string() }
fn f_status() -> String { "status".to_string() }
fn f_max_concurrent() -> String { "max_concurrent".to_string() }
fn f_current_load() -> String { "current_load".to_string() }
fn f_department() -> String { "department".to_string() }
fn f_skills() -> String { "skills".to_string() }
fn default_jwt_expiration() -> u64 { 3600 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_service_name() -> String { "chatforge".to_string() }
fn default_environment() -> String { "development".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: AppConfig = config.try_deserialize().or_else(|_| {
            // No config files and no APP__ vars: start from defaults
            Ok::<AppConfig, ConfigError>(AppConfig::default())
        })?;

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Apply the documented flat environment keys on top of whatever the
    /// layered sources produced.
    pub fn apply_env_overrides(&mut self) {
        fn var(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = var("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = var("ALLOWED_ORIGINS") {
            self.server.allowed_origins =
                v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(v) = var("CLIENT_URL") {
            if !self.server.allowed_origins.contains(&v) {
                self.server.allowed_origins.push(v);
            }
        }
        if let Some(v) = var("DB_URI") {
            self.database.url = v;
        }
        if let Some(v) = var("VECTOR_URL") {
            self.vector.url = v;
        }
        if let Some(v) = var("VECTOR_API_KEY") {
            self.vector.api_key = Some(v);
        }
        if let Some(v) = var("VECTOR_COLLECTION_DEFAULT") {
            self.vector.collection_prefix = v;
        }
        if let Some(v) = var("EMBEDDING_PROVIDER") {
            self.embedding.provider = v;
        }
        if let Some(v) = var("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = var("EMBEDDING_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.embedding.batch_size = v;
        }
        if let Some(v) = var("LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Some(v) = var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = var("LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = var("TEMPERATURE").and_then(|v| v.parse().ok()) {
            self.llm.temperature = v;
        }
        if let Some(v) = var("MAX_OUTPUT_TOKENS").and_then(|v| v.parse().ok()) {
            self.llm.max_output_tokens = v;
        }
        if let Some(v) = var("CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.ingestion.chunk_size = v;
        }
        if let Some(v) = var("CHUNK_OVERLAP").and_then(|v| v.parse().ok()) {
            self.ingestion.chunk_overlap = v;
        }
        if let Some(v) = var("K_DOCUMENTS").and_then(|v| v.parse().ok()) {
            self.query.top_k = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.observability.log_level = v;
        }
        if let Some(v) = var("JWT_SECRET") {
            self.auth.jwt_secret = Some(v);
        }
        if let Some(v) = var("PREFER_LOCAL_AGENTS").and_then(|v| v.parse().ok()) {
            self.agents.prefer_local = v;
        }
        if let Some(v) = var("SKILL_BASED_ROUTING").and_then(|v| v.parse().ok()) {
            self.agents.skill_based_routing = v;
        }
        if let Some(v) = var("QUEUE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.agents.queue_timeout_ms = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_DB_ENABLED").and_then(|v| v.parse().ok()) {
            self.agents.external.enabled = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_DB_TYPE") {
            self.agents.external.kind = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_DB_URI") {
            self.agents.external.db_uri = Some(v);
        }
        if let Some(v) = var("EXTERNAL_AGENT_API_URL") {
            self.agents.external.api_url = Some(v);
        }
        if let Some(v) = var("EXTERNAL_AGENT_API_KEY") {
            self.agents.external.api_key = Some(v);
        }
        if let Some(v) = var("EXTERNAL_AGENT_TABLE_NAME") {
            self.agents.external.table_name = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_ID") {
            self.agents.external.fields.id = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_NAME") {
            self.agents.external.fields.name = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_EMAIL") {
            self.agents.external.fields.email = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_STATUS") {
            self.agents.external.fields.status = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_MAX_CONCURRENT") {
            self.agents.external.fields.max_concurrent = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_CURRENT_LOAD") {
            self.agents.external.fields.current_load = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_DEPARTMENT") {
            self.agents.external.fields.department = v;
        }
        if let Some(v) = var("EXTERNAL_AGENT_FIELD_SKILLS") {
            self.agents.external.fields.skills = v;
        }
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            vector: VectorConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            ingestion: IngestionConfig::default(),
            query: QueryConfig::default(),
            session: SessionConfig::default(),
            agents: AgentConfig::default(),
            auth: AuthConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: default_vector_url(),
            api_key: None,
            collection_prefix: default_collection_prefix(),
            pool_size: default_vector_pool(),
            timeout_secs: default_vector_timeout(),
            scroll_timeout_secs: default_scroll_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            base_url: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            batch_size: default_embedding_batch_size(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: None,
            api_key: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_concurrent_jobs: default_max_jobs(),
            job_timeout_secs: default_job_timeout(),
            max_embedding_groups: default_embed_groups(),
            chunk_cache_dir: default_chunk_cache_dir(),
            max_file_bytes: default_max_file_bytes(),
            max_text_bytes: default_max_text_bytes(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_concurrent: default_query_concurrency(),
            timeout_secs: default_query_timeout(),
            cache_ttl_secs: default_answer_cache_ttl(),
            cache_capacity: default_answer_cache_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            inactivity_ttl_days: default_room_ttl_days(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prefer_local: default_prefer_local(),
            skill_based_routing: false,
            queue_timeout_ms: default_queue_timeout_ms(),
            external: ExternalAgentConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_expiration_secs: default_jwt_expiration(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            service_name: default_service_name(),
            environment: default_environment(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.ingestion.chunk_size, 1000);
        assert_eq!(config.ingestion.chunk_overlap, 100);
        assert_eq!(config.query.top_k, 3);
        assert_eq!(config.embedding.batch_size, 50);
        assert_eq!(config.agents.queue_timeout_ms, 600_000);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/chatforge");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        std::env::set_var("CHUNK_SIZE", "512");
        std::env::set_var("K_DOCUMENTS", "5");
        std::env::set_var("LLM_PROVIDER", "gemini");
        config.apply_env_overrides();
        std::env::remove_var("CHUNK_SIZE");
        std::env::remove_var("K_DOCUMENTS");
        std::env::remove_var("LLM_PROVIDER");

        assert_eq!(config.ingestion.chunk_size, 512);
        assert_eq!(config.query.top_k, 5);
        assert_eq!(config.llm.provider, "gemini");
    }
}
