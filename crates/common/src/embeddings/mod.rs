//! Embedding service abstraction
//!
//! Provides a unified interface for multiple embedding providers:
//! - Ollama (self-hosted, `/api/embed`)
//! - Gemini (`batchEmbedContents`)
//! - Mock (tests)

use crate::errors::{AppError, Result};
use crate::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Configured embedding dimension
    fn dimension(&self) -> usize;

    /// Probe the provider for the actual dimension by embedding a token.
    async fn probe_dimension(&self) -> Result<usize> {
        Ok(self.embed("dimension probe").await?.len())
    }

    /// Reachability check for /health.
    async fn health(&self) -> Result<()> {
        self.embed("ping").await.map(|_| ())
    }
}

// ============================================================================
// Ollama
// ============================================================================

/// Ollama embedding client
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(
        base_url: Option<String>,
        model: String,
        dimension: usize,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
            dimension,
            retry: RetryPolicy::new(max_retries.max(1)),
        }
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let request = OllamaEmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Embedding {
                message: format!("Request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Embedding {
                message: format!("API error {status}: {body}"),
            });
        }

        let result: OllamaEmbedResponse =
            response.json().await.map_err(|e| AppError::Embedding {
                message: format!("Failed to parse response: {e}"),
            })?;

        if result.embeddings.len() != texts.len() {
            return Err(AppError::Embedding {
                message: format!(
                    "Provider returned {} vectors for {} inputs",
                    result.embeddings.len(),
                    texts.len()
                ),
            });
        }

        Ok(result.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding {
                message: "Empty response".to_string(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let start = std::time::Instant::now();
        let result = with_retry(&self.retry, "ollama_embed", || self.request(texts)).await;
        crate::metrics::record_embedding(
            start.elapsed().as_secs_f64(),
            &self.model,
            texts.len(),
            result.is_ok(),
        );
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Gemini
// ============================================================================

/// Gemini embedding client
pub struct GeminiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct GeminiBatchRequest {
    requests: Vec<GeminiEmbedRequest>,
}

#[derive(Serialize)]
struct GeminiEmbedRequest {
    model: String,
    content: GeminiContent,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiBatchResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

impl GeminiEmbedder {
    pub fn new(
        api_key: String,
        model: String,
        dimension: usize,
        base_url: Option<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
            model,
            dimension,
            retry: RetryPolicy::new(max_retries.max(1)),
        }
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            self.base_url, self.model, self.api_key
        );

        let request = GeminiBatchRequest {
            requests: texts
                .iter()
                .map(|t| GeminiEmbedRequest {
                    model: format!("models/{}", self.model),
                    content: GeminiContent {
                        parts: vec![GeminiPart { text: t.clone() }],
                    },
                })
                .collect(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Embedding {
                message: format!("Request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Embedding {
                message: format!("API error {status}: {body}"),
            });
        }

        let result: GeminiBatchResponse =
            response.json().await.map_err(|e| AppError::Embedding {
                message: format!("Failed to parse response: {e}"),
            })?;

        Ok(result.embeddings.into_iter().map(|e| e.values).collect())
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding {
                message: "Empty response".to_string(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let start = std::time::Instant::now();
        let result = with_retry(&self.retry, "gemini_embed", || self.request(texts)).await;
        crate::metrics::record_embedding(
            start.elapsed().as_secs_f64(),
            &self.model,
            texts.len(),
            result.is_ok(),
        );
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Mock
// ============================================================================

/// Deterministic embedder for testing. Similar texts share a prefix hash so
/// identical inputs always produce identical vectors.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        (0..self.dimension)
            .map(|i| {
                let byte = digest[i % digest.len()];
                (byte as f32 / 255.0) * 2.0 - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder from configuration.
pub fn create_embedder(config: &crate::config::EmbeddingConfig) -> Arc<dyn Embedder> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider.as_str() {
        "ollama" => Arc::new(OllamaEmbedder::new(
            config.base_url.clone(),
            config.model.clone(),
            config.dimension,
            timeout,
            config.max_retries,
        )),
        "gemini" => {
            let key = config
                .api_key
                .clone()
                .unwrap_or_else(|| std::env::var("GEMINI_API_KEY").unwrap_or_default());
            Arc::new(GeminiEmbedder::new(
                key,
                config.model.clone(),
                config.dimension,
                config.base_url.clone(),
                timeout,
                config.max_retries,
            ))
        }
        "mock" => Arc::new(MockEmbedder::new(config.dimension)),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using mock");
            Arc::new(MockEmbedder::new(config.dimension))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_mock_embedder_deterministic() {
        let embedder = MockEmbedder::new(768);
        let a = embedder.embed("test text").await.unwrap();
        let b = embedder.embed("test text").await.unwrap();
        assert_eq!(a.len(), 768);
        assert_eq!(a, b);

        let c = embedder.embed("different").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_mock_batch() {
        let embedder = MockEmbedder::new(64);
        let texts = vec!["text1".to_string(), "text2".to_string()];
        let embeddings = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].len(), 64);
    }

    #[tokio::test]
    async fn test_probe_dimension() {
        let embedder = MockEmbedder::new(32);
        assert_eq!(embedder.probe_dimension().await.unwrap(), 32);
    }

    #[tokio::test]
    async fn test_ollama_embedder_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2], [0.3, 0.4]]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(
            Some(server.uri()),
            "nomic-embed-text".to_string(),
            2,
            Duration::from_secs(5),
            1,
        );

        let texts = vec!["a".to_string(), "b".to_string()];
        let out = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(out, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn test_ollama_embedder_count_mismatch_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2]]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(
            Some(server.uri()),
            "nomic-embed-text".to_string(),
            2,
            Duration::from_secs(5),
            1,
        );

        let texts = vec!["a".to_string(), "b".to_string()];
        assert!(embedder.embed_batch(&texts).await.is_err());
    }
}
