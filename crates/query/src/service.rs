//! Query service
//!
//! The coupled retrieve → compose → generate pipeline with answer caching,
//! a concurrency budget and per-query wall-clock timeout. Streaming queries
//! bypass the answer cache and close on completion, error or caller
//! cancellation.

use crate::classify::{classify, Route, GREETING_REPLY};
use crate::metrics::QueryMetrics;
use crate::prompt::compose_support_prompt;
use chatforge_common::cache::TtlCache;
use chatforge_common::config::QueryConfig;
use chatforge_common::errors::{AppError, Result};
use chatforge_common::llm::{LlmStreamEvent, TokenUsage};
use chatforge_common::vector::{PayloadFilter, RetrievedPoint, VectorStore};
use chatforge_common::{Embedder, LlmClient, TenantId};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info};

const SEARCH_CACHE_TTL: Duration = Duration::from_secs(300);
const MAX_QUESTION_LEN: usize = 1000;
const MIN_QUESTION_LEN: usize = 3;
const MAX_SEARCH_LIMIT: usize = 50;

/// One prior message handed to prompt composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// customer | ai | agent | system
    pub sender: String,
    pub content: String,
}

/// Options accompanying a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Last messages of the conversation, oldest first
    #[serde(default)]
    pub history: Vec<HistoryMessage>,

    /// Known customer entities injected into the prompt
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,

    /// Override for the retrieval depth
    #[serde(default)]
    pub top_k: Option<usize>,

    /// Prompt flavor; only `support` is defined today
    #[serde(default = "default_prompt_type")]
    pub prompt_type: String,
}

fn default_prompt_type() -> String {
    "support".to_string()
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            history: Vec::new(),
            context: serde_json::Map::new(),
            top_k: None,
            prompt_type: default_prompt_type(),
        }
    }
}

/// A citation attached to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub source: String,
    pub chunk_index: i64,
    pub score: f32,
}

/// A semantic-search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub text: String,
    pub document_id: String,
    pub source: String,
    pub chunk_index: i64,
    pub score: f32,
}

/// A completed answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub text: String,
    pub sources: Vec<SourceRef>,
    /// `round(max_score * 100)`, absent when retrieval had no hits
    pub confidence: Option<u32>,
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
    pub cached: bool,
    /// greeting | vector
    pub route: String,
}

/// One frame of a streaming answer. The first frame carries the sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRef>>,
}

pub type AnswerStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// The query core service.
pub struct QueryService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    config: QueryConfig,
    collection_prefix: String,
    answer_cache: TtlCache<String, QueryAnswer>,
    search_cache: TtlCache<String, Vec<ScoredDocument>>,
    semaphore: Arc<Semaphore>,
    metrics: Arc<QueryMetrics>,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
        config: QueryConfig,
        collection_prefix: String,
    ) -> Self {
        let answer_cache = TtlCache::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_capacity,
        );
        let search_cache = TtlCache::new(SEARCH_CACHE_TTL, config.cache_capacity);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Self {
            store,
            embedder,
            llm,
            config,
            collection_prefix,
            answer_cache,
            search_cache,
            semaphore,
            metrics: Arc::new(QueryMetrics::new()),
        }
    }

    /// Query metrics handle (shared with the HTTP surface).
    pub fn metrics(&self) -> Arc<QueryMetrics> {
        self.metrics.clone()
    }

    fn validate_question(question: &str) -> Result<&str> {
        let trimmed = question.trim();
        if trimmed.len() < MIN_QUESTION_LEN {
            return Err(AppError::validation(
                format!("question must be at least {MIN_QUESTION_LEN} characters"),
                Some("question"),
            ));
        }
        if trimmed.len() > MAX_QUESTION_LEN {
            return Err(AppError::validation(
                format!("question must be at most {MAX_QUESTION_LEN} characters"),
                Some("question"),
            ));
        }
        Ok(trimmed)
    }

    fn cache_key(tenant: &TenantId, question: &str, opts: &QueryOptions) -> String {
        let normalized = question.trim().to_lowercase();
        let opts_json = serde_json::to_string(opts).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(tenant.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(normalized.as_bytes());
        hasher.update(b"|");
        hasher.update(opts_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Run a full query. Greeting-classified input returns a canned reply
    /// without retrieval; everything else embeds, retrieves and generates.
    pub async fn query(
        &self,
        tenant: &TenantId,
        question: &str,
        opts: QueryOptions,
    ) -> Result<QueryAnswer> {
        let question = Self::validate_question(question)?;
        let start = Instant::now();

        if classify(question) == Route::Greeting {
            let answer = QueryAnswer {
                text: GREETING_REPLY.to_string(),
                sources: Vec::new(),
                confidence: None,
                usage: None,
                latency_ms: start.elapsed().as_millis() as u64,
                cached: false,
                route: Route::Greeting.as_str().to_string(),
            };
            self.metrics.record(answer.latency_ms as f64, false);
            chatforge_common::metrics::record_query(
                start.elapsed().as_secs_f64(),
                "greeting",
                false,
            );
            return Ok(answer);
        }

        let key = Self::cache_key(tenant, question, &opts);
        if let Some(mut cached) = self.answer_cache.get(&key).await {
            cached.cached = true;
            cached.latency_ms = start.elapsed().as_millis() as u64;
            self.metrics.record(cached.latency_ms as f64, true);
            chatforge_common::metrics::record_cache(true, "answers");
            debug!(tenant = %tenant, "Answer cache hit");
            return Ok(cached);
        }
        chatforge_common::metrics::record_cache(false, "answers");

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let result = tokio::time::timeout(timeout, self.query_inner(tenant, question, &opts)).await;

        match result {
            Ok(Ok(mut answer)) => {
                answer.latency_ms = start.elapsed().as_millis() as u64;
                self.answer_cache.set(key, answer.clone()).await;
                self.metrics.record(answer.latency_ms as f64, false);
                chatforge_common::metrics::record_query(
                    start.elapsed().as_secs_f64(),
                    "vector",
                    false,
                );
                Ok(answer)
            }
            Ok(Err(e)) => {
                self.metrics.record_error();
                chatforge_common::metrics::record_query(
                    start.elapsed().as_secs_f64(),
                    "vector",
                    true,
                );
                Err(e)
            }
            Err(_) => {
                self.metrics.record_error();
                chatforge_common::metrics::record_query(
                    start.elapsed().as_secs_f64(),
                    "vector",
                    true,
                );
                Err(AppError::Timeout {
                    operation: "query".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Exposed hybrid entry point. Returns vector results; a structured
    /// retrieval source would slot in beside the vector path.
    pub async fn hybrid_query(
        &self,
        tenant: &TenantId,
        question: &str,
        opts: QueryOptions,
    ) -> Result<QueryAnswer> {
        self.query(tenant, question, opts).await
    }

    async fn query_inner(
        &self,
        tenant: &TenantId,
        question: &str,
        opts: &QueryOptions,
    ) -> Result<QueryAnswer> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AppError::ServiceUnavailable {
                message: "query pipeline shut down".to_string(),
            })?;

        let top_k = opts.top_k.unwrap_or(self.config.top_k).clamp(1, MAX_SEARCH_LIMIT);
        let hits = self.retrieve(tenant, question, top_k).await?;

        let confidence = hits
            .iter()
            .map(|h| h.score)
            .fold(None::<f32>, |acc, s| Some(acc.map_or(s, |a| a.max(s))))
            .map(|max| (max * 100.0).round() as u32);

        let sources: Vec<SourceRef> = hits.iter().map(source_ref).collect();
        let chunks: Vec<String> = hits.iter().map(|h| h.text().to_string()).collect();

        let prompt = compose_support_prompt(&opts.context, &chunks, &opts.history, question);
        let generation = self.llm.generate(&prompt).await?;

        info!(
            tenant = %tenant,
            sources = sources.len(),
            confidence = ?confidence,
            "Query answered"
        );

        Ok(QueryAnswer {
            text: generation.text,
            sources,
            confidence,
            usage: Some(generation.usage),
            latency_ms: 0,
            cached: false,
            route: Route::Vector.as_str().to_string(),
        })
    }

    /// Streaming query. Bypasses the answer cache; the first frame carries
    /// the sources, subsequent frames the text deltas.
    pub async fn stream_query(
        &self,
        tenant: &TenantId,
        question: &str,
        opts: QueryOptions,
    ) -> Result<AnswerStream> {
        let question = Self::validate_question(question)?;

        if classify(question) == Route::Greeting {
            let frames = vec![
                Ok(StreamChunk {
                    delta: String::new(),
                    sources: Some(Vec::new()),
                }),
                Ok(StreamChunk {
                    delta: GREETING_REPLY.to_string(),
                    sources: None,
                }),
            ];
            return Ok(Box::pin(futures::stream::iter(frames)));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AppError::ServiceUnavailable {
                message: "query pipeline shut down".to_string(),
            })?;

        let top_k = opts.top_k.unwrap_or(self.config.top_k).clamp(1, MAX_SEARCH_LIMIT);
        let hits = self.retrieve(tenant, question, top_k).await?;
        let sources: Vec<SourceRef> = hits.iter().map(source_ref).collect();
        let chunks: Vec<String> = hits.iter().map(|h| h.text().to_string()).collect();

        let prompt = compose_support_prompt(&opts.context, &chunks, &opts.history, question);
        let llm_stream = self.llm.stream(&prompt).await?;

        let header = futures::stream::once(async move {
            Ok(StreamChunk {
                delta: String::new(),
                sources: Some(sources),
            })
        });

        let body = llm_stream.filter_map(|event| async move {
            match event {
                Ok(LlmStreamEvent::Delta(delta)) => Some(Ok(StreamChunk {
                    delta,
                    sources: None,
                })),
                Ok(LlmStreamEvent::Done { .. }) => None,
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(header.chain(body)))
    }

    /// Plain semantic search without generation.
    pub async fn semantic_search(
        &self,
        tenant: &TenantId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let query = Self::validate_question(query)?;
        if limit < 1 || limit > MAX_SEARCH_LIMIT {
            return Err(AppError::validation(
                format!("limit must be between 1 and {MAX_SEARCH_LIMIT}"),
                Some("limit"),
            ));
        }

        let cache_key = format!(
            "{}:{}:{}",
            tenant.as_str(),
            limit,
            hex::encode(Sha256::digest(query.trim().to_lowercase().as_bytes()))
        );
        if let Some(cached) = self.search_cache.get(&cache_key).await {
            chatforge_common::metrics::record_cache(true, "semantic_search");
            return Ok(cached);
        }
        chatforge_common::metrics::record_cache(false, "semantic_search");

        let hits = self.retrieve(tenant, query, limit).await?;
        let documents: Vec<ScoredDocument> = hits
            .iter()
            .map(|h| ScoredDocument {
                text: h.text().to_string(),
                document_id: h.payload_str("document_id").unwrap_or_default().to_string(),
                source: h.payload_str("source").unwrap_or_default().to_string(),
                chunk_index: h
                    .payload
                    .get("chunk_index")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_default(),
                score: h.score,
            })
            .collect();

        self.search_cache.set(cache_key, documents.clone()).await;
        Ok(documents)
    }

    /// Embed once and search the tenant collection. A missing collection
    /// yields no hits rather than an error.
    async fn retrieve(
        &self,
        tenant: &TenantId,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPoint>> {
        let collection = tenant.collection_name(&self.collection_prefix);
        if !self.store.collection_exists(&collection).await? {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(question).await?;
        let filter = PayloadFilter::tenant(tenant.as_str());
        self.store
            .search(&collection, &vector, top_k, Some(&filter))
            .await
    }
}

fn source_ref(hit: &RetrievedPoint) -> SourceRef {
    SourceRef {
        document_id: hit.payload_str("document_id").unwrap_or_default().to_string(),
        source: hit.payload_str("source").unwrap_or_default().to_string(),
        chunk_index: hit
            .payload
            .get("chunk_index")
            .and_then(|v| v.as_i64())
            .unwrap_or_default(),
        score: hit.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatforge_common::embeddings::MockEmbedder;
    use chatforge_common::llm::MockLlm;
    use chatforge_common::vector::{ChunkPoint, MemoryVectorStore};
    use serde_json::json;
    use uuid::Uuid;

    fn config() -> QueryConfig {
        QueryConfig {
            top_k: 3,
            max_concurrent: 10,
            timeout_secs: 30,
            cache_ttl_secs: 1800,
            cache_capacity: 100,
        }
    }

    fn tenant(name: &str) -> TenantId {
        TenantId::parse(name).unwrap()
    }

    /// Seed a tenant collection with chunks embedded by the same mock
    /// embedder the service uses.
    async fn seed(store: &MemoryVectorStore, embedder: &MockEmbedder, t: &str, texts: &[&str]) {
        let collection = format!("chatforge_{t}");
        store
            .ensure_collection(&collection, embedder.dimension())
            .await
            .unwrap();
        let mut points = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let mut payload = serde_json::Map::new();
            payload.insert("tenant_id".into(), json!(t));
            payload.insert("document_id".into(), json!(format!("doc{i}")));
            payload.insert("chunk_index".into(), json!(0));
            payload.insert("source".into(), json!(format!("doc{i}.txt")));
            payload.insert("text".into(), json!(text));
            points.push(ChunkPoint {
                id: Uuid::new_v4(),
                vector: embedder.embed(text).await.unwrap(),
                payload,
            });
        }
        store.upsert(&collection, points).await.unwrap();
    }

    fn service_with(
        store: Arc<MemoryVectorStore>,
        embedder: Arc<MockEmbedder>,
        llm: Arc<MockLlm>,
        cfg: QueryConfig,
    ) -> QueryService {
        QueryService::new(store, embedder, llm, cfg, "chatforge".to_string())
    }

    #[tokio::test]
    async fn question_length_boundaries() {
        let svc = service_with(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MockEmbedder::new(16)),
            Arc::new(MockLlm::new("ok")),
            config(),
        );
        let t = tenant("acme");

        assert!(svc.query(&t, "ab", QueryOptions::default()).await.is_err());
        assert!(svc.query(&t, "abc", QueryOptions::default()).await.is_ok());
        let long = "x".repeat(1001);
        assert!(svc.query(&t, &long, QueryOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn greeting_skips_retrieval() {
        // No collection seeded: retrieval would return nothing anyway, but
        // the route must be greeting with the canned reply.
        let svc = service_with(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MockEmbedder::new(16)),
            Arc::new(MockLlm::new("should not be called")),
            config(),
        );
        let t = tenant("acme");

        let answer = svc.query(&t, "hi", QueryOptions::default()).await.unwrap();
        assert!(answer.text.starts_with("Hello"));
        assert_eq!(answer.route, "greeting");
        assert!(answer.sources.is_empty());
        assert!(answer.confidence.is_none());
    }

    #[tokio::test]
    async fn rag_answer_carries_sources_and_confidence() {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        seed(&store, &embedder, "acme", &["What is your refund window?"]).await;

        let svc = service_with(
            store,
            embedder,
            Arc::new(MockLlm::new("Our refund window is 14 days.")),
            config(),
        );
        let t = tenant("acme");

        let answer = svc
            .query(&t, "What is your refund window?", QueryOptions::default())
            .await
            .unwrap();

        assert!(answer.text.contains("14 days"));
        assert!(!answer.sources.is_empty());
        assert!(answer.confidence.unwrap() >= 50);
        assert_eq!(answer.route, "vector");
        assert!(answer.usage.is_some());
    }

    #[tokio::test]
    async fn tenant_isolation_in_retrieval() {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        seed(&store, &embedder, "a", &["shared question text"]).await;
        seed(&store, &embedder, "b", &["shared question text"]).await;

        let svc = service_with(store, embedder, Arc::new(MockLlm::new("answer")), config());

        let hits_a = svc
            .semantic_search(&tenant("a"), "shared question text", 10)
            .await
            .unwrap();
        assert!(!hits_a.is_empty());

        // Searching tenant a never returns tenant b's points and vice versa;
        // the memory store would happily mix them without the filter.
        let hits_b = svc
            .semantic_search(&tenant("b"), "shared question text", 10)
            .await
            .unwrap();
        assert_eq!(hits_a.len(), 1);
        assert_eq!(hits_b.len(), 1);
    }

    #[tokio::test]
    async fn identical_queries_hit_the_cache() {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        seed(&store, &embedder, "acme", &["Our refund window is 14 days."]).await;

        let svc = service_with(
            store,
            embedder,
            Arc::new(MockLlm::new("Our refund window is 14 days.")),
            config(),
        );
        let t = tenant("acme");

        let first = svc
            .query(&t, "What is your refund window?", QueryOptions::default())
            .await
            .unwrap();
        assert!(!first.cached);

        let second = svc
            .query(&t, "What is your refund window?", QueryOptions::default())
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(first.text, second.text);
        assert_eq!(first.confidence, second.confidence);

        let snap = svc.metrics().snapshot();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
    }

    #[tokio::test]
    async fn streaming_reassembles_and_reports_sources() {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        seed(&store, &embedder, "acme", &["Shipping takes 3 days."]).await;

        let svc = service_with(
            store,
            embedder,
            Arc::new(MockLlm::new("Shipping takes 3 days.")),
            config(),
        );
        let t = tenant("acme");

        let mut stream = svc
            .stream_query(&t, "How long does shipping take?", QueryOptions::default())
            .await
            .unwrap();

        let mut text = String::new();
        let mut sources = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if chunk.sources.is_some() {
                sources = chunk.sources;
            }
            text.push_str(&chunk.delta);
        }

        assert_eq!(text, "Shipping takes 3 days.");
        assert_eq!(sources.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn semantic_search_limit_bounds() {
        let svc = service_with(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MockEmbedder::new(16)),
            Arc::new(MockLlm::new("x")),
            config(),
        );
        let t = tenant("acme");

        assert!(svc.semantic_search(&t, "query text", 0).await.is_err());
        assert!(svc.semantic_search(&t, "query text", 51).await.is_err());
        assert!(svc.semantic_search(&t, "query text", 1).await.is_ok());
        assert!(svc.semantic_search(&t, "query text", 50).await.is_ok());
    }

    #[tokio::test]
    async fn timeout_records_an_error() {
        use async_trait::async_trait;
        use chatforge_common::llm::{Generation, LlmStream};

        struct SlowLlm;

        #[async_trait]
        impl chatforge_common::LlmClient for SlowLlm {
            async fn generate(&self, _prompt: &str) -> chatforge_common::Result<Generation> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("sleep outlives the test timeout")
            }
            async fn stream(&self, _prompt: &str) -> chatforge_common::Result<LlmStream> {
                unimplemented!()
            }
            fn model_name(&self) -> &str {
                "slow"
            }
            async fn health(&self) -> chatforge_common::Result<()> {
                Ok(())
            }
        }

        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        seed(&store, &embedder, "acme", &["anything"]).await;

        let cfg = QueryConfig {
            timeout_secs: 0,
            ..config()
        };
        let svc = QueryService::new(store, embedder, Arc::new(SlowLlm), cfg, "chatforge".into());
        let t = tenant("acme");

        let result = svc.query(&t, "a question", QueryOptions::default()).await;
        assert!(matches!(result, Err(AppError::Timeout { .. })));
        assert_eq!(svc.metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn hybrid_matches_vector_results() {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbedder::new(16));
        seed(&store, &embedder, "acme", &["Our refund window is 14 days."]).await;

        let svc = service_with(
            store,
            embedder,
            Arc::new(MockLlm::new("Our refund window is 14 days.")),
            config(),
        );
        let t = tenant("acme");

        let hybrid = svc
            .hybrid_query(&t, "What is your refund window?", QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(hybrid.route, "vector");
        assert!(!hybrid.sources.is_empty());
    }
}
