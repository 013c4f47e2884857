//! LLM gateway
//!
//! Blocking and streaming generation behind one trait, with token
//! accounting. Providers return exactly one response shape ([`Generation`])
//! so internal layers never probe for `text` vs `answer` vs `content`.
//!
//! Providers:
//! - Ollama (`/api/generate`, NDJSON streaming)
//! - Gemini (`generateContent` / `streamGenerateContent` SSE)
//! - Mock (tests)

use crate::errors::{AppError, Result};
use crate::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Token accounting for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    /// True when the provider did not report counts and `ceil(len/4)` was
    /// used instead.
    pub estimated: bool,
}

impl TokenUsage {
    pub fn reported(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated: false,
        }
    }

    /// Character-count estimate at four characters per token.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let input = prompt.len().div_ceil(4) as u32;
        let output = completion.len().div_ceil(4) as u32;
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            estimated: true,
        }
    }
}

/// A completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

/// Events of a streaming generation. The stream is finite and closes after
/// `Done` (or an error item).
#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    /// Incremental text.
    Delta(String),
    /// Generation finished.
    Done { usage: Option<TokenUsage> },
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmStreamEvent>> + Send>>;

/// Trait for text generation
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single-shot generation returning the full text with usage.
    async fn generate(&self, prompt: &str) -> Result<Generation>;

    /// Streaming generation. Dropping the stream cancels the provider call.
    async fn stream(&self, prompt: &str) -> Result<LlmStream>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Reachability check for /health.
    async fn health(&self) -> Result<()>;
}

// ============================================================================
// Ollama
// ============================================================================

/// Ollama generation client
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

impl OllamaClient {
    pub fn new(
        base_url: Option<String>,
        model: String,
        temperature: f32,
        max_output_tokens: u32,
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
            temperature,
            max_output_tokens,
            retry: RetryPolicy::new(max_retries.max(1)),
        }
    }

    fn request_body<'a>(&'a self, prompt: &'a str, stream: bool) -> OllamaGenerateRequest<'a> {
        OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_output_tokens,
            },
        }
    }

    /// Send one generate request, mapping transport and status failures.
    async fn send_request(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, stream))
            .send()
            .await
            .map_err(|e| AppError::Llm {
                message: format!("Request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Llm {
                message: format!("API error {status}: {body}"),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn generate(&self, prompt: &str) -> Result<Generation> {
        let response = with_retry(&self.retry, "ollama_generate", || {
            self.send_request(prompt, false)
        })
        .await?;

        let result: OllamaGenerateResponse =
            response.json().await.map_err(|e| AppError::Llm {
                message: format!("Failed to parse response: {e}"),
            })?;

        let usage = match (result.prompt_eval_count, result.eval_count) {
            (Some(input), Some(output)) => TokenUsage::reported(input, output),
            _ => TokenUsage::estimate(prompt, &result.response),
        };

        Ok(Generation {
            text: result.response,
            usage,
        })
    }

    async fn stream(&self, prompt: &str) -> Result<LlmStream> {
        // Retries cover establishing the stream; once deltas flow the call
        // is not restartable.
        let response = with_retry(&self.retry, "ollama_stream", || {
            self.send_request(prompt, true)
        })
        .await?;

        // NDJSON: one JSON object per line, `done:true` on the last one.
        let byte_stream = response.bytes_stream();
        let stream = async_stream_ndjson(byte_stream);
        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| AppError::Llm {
            message: format!("Health check failed: {e}"),
        })?;
        if !response.status().is_success() {
            return Err(AppError::Llm {
                message: format!("Health check status {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Convert an NDJSON byte stream into LLM stream events.
fn async_stream_ndjson(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<LlmStreamEvent>> + Send {
    futures::stream::unfold(
        (Box::pin(byte_stream), String::new(), false),
        |(mut bytes, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                // Emit any complete line already buffered.
                if let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<OllamaGenerateResponse>(line) {
                        Ok(chunk) if chunk.done => {
                            let usage = match (chunk.prompt_eval_count, chunk.eval_count) {
                                (Some(i), Some(o)) => Some(TokenUsage::reported(i, o)),
                                _ => None,
                            };
                            return Some((Ok(LlmStreamEvent::Done { usage }), (bytes, buffer, true)));
                        }
                        Ok(chunk) => {
                            if chunk.response.is_empty() {
                                continue;
                            }
                            return Some((
                                Ok(LlmStreamEvent::Delta(chunk.response)),
                                (bytes, buffer, false),
                            ));
                        }
                        Err(e) => {
                            return Some((
                                Err(AppError::Llm {
                                    message: format!("Bad stream chunk: {e}"),
                                }),
                                (bytes, buffer, true),
                            ));
                        }
                    }
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(AppError::Llm {
                                message: format!("Stream error: {e}"),
                            }),
                            (bytes, buffer, true),
                        ));
                    }
                    None => {
                        // Provider closed without a done frame.
                        return Some((Ok(LlmStreamEvent::Done { usage: None }), (bytes, buffer, true)));
                    }
                }
            }
        },
    )
}

// ============================================================================
// Gemini
// ============================================================================

/// Gemini generation client
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct GeminiGenerateRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiTextPart>,
}

#[derive(Serialize)]
struct GeminiTextPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiGenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Deserialize)]
struct GeminiCandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        model: String,
        temperature: f32,
        max_output_tokens: u32,
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
            temperature,
            max_output_tokens,
            retry: RetryPolicy::new(max_retries.max(1)),
        }
    }

    /// Send one request, mapping transport and status failures.
    async fn post_request(&self, url: &str, prompt: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| AppError::Llm {
                message: format!("Request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Llm {
                message: format!("API error {status}: {body}"),
            });
        }

        Ok(response)
    }

    fn request_body(&self, prompt: &str) -> GeminiGenerateRequest {
        GeminiGenerateRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiTextPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        }
    }

    fn extract_text(response: &GeminiGenerateResponse) -> String {
        response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<Generation> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = with_retry(&self.retry, "gemini_generate", || {
            self.post_request(&url, prompt)
        })
        .await?;

        let result: GeminiGenerateResponse =
            response.json().await.map_err(|e| AppError::Llm {
                message: format!("Failed to parse response: {e}"),
            })?;

        let text = Self::extract_text(&result);
        let usage = match result.usage_metadata {
            Some(u) => TokenUsage::reported(u.prompt_token_count, u.candidates_token_count),
            None => TokenUsage::estimate(prompt, &text),
        };

        Ok(Generation { text, usage })
    }

    async fn stream(&self, prompt: &str) -> Result<LlmStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.model, self.api_key
        );

        // Retries cover establishing the stream; once deltas flow the call
        // is not restartable.
        let response = with_retry(&self.retry, "gemini_stream", || {
            self.post_request(&url, prompt)
        })
        .await?;

        let event_stream = response.bytes_stream().eventsource();

        let mapped = event_stream.filter_map(|result| async move {
            match result {
                Ok(event) => {
                    match serde_json::from_str::<GeminiGenerateResponse>(&event.data) {
                        Ok(chunk) => {
                            let text = GeminiClient::extract_text(&chunk);
                            // The usage-bearing final frame doubles as Done.
                            if let Some(u) = chunk.usage_metadata {
                                let usage = TokenUsage::reported(
                                    u.prompt_token_count,
                                    u.candidates_token_count,
                                );
                                if text.is_empty() {
                                    return Some(Ok(LlmStreamEvent::Done { usage: Some(usage) }));
                                }
                                return Some(Ok(LlmStreamEvent::Delta(text)));
                            }
                            if text.is_empty() {
                                return None;
                            }
                            Some(Ok(LlmStreamEvent::Delta(text)))
                        }
                        Err(e) => Some(Err(AppError::Llm {
                            message: format!("Bad SSE chunk: {e}"),
                        })),
                    }
                }
                Err(e) => Some(Err(AppError::Llm {
                    message: format!("SSE stream error: {e}"),
                })),
            }
        });

        // Append a terminal Done for providers that close without one.
        let with_done = mapped.chain(futures::stream::once(async {
            Ok(LlmStreamEvent::Done { usage: None })
        }));

        Ok(Box::pin(with_done))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> Result<()> {
        let url = format!(
            "{}/models/{}?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self.client.get(&url).send().await.map_err(|e| AppError::Llm {
            message: format!("Health check failed: {e}"),
        })?;
        if !response.status().is_success() {
            return Err(AppError::Llm {
                message: format!("Health check status {}", response.status()),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Mock
// ============================================================================

/// Scriptable LLM for tests. Responses are served in order; the last one
/// repeats once the script is exhausted.
pub struct MockLlm {
    responses: std::sync::Mutex<Vec<String>>,
    fallback: String,
}

impl MockLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(Vec::new()),
            fallback: response.into(),
        }
    }

    /// Queue scripted responses, served before the fallback.
    pub fn with_script(responses: Vec<String>, fallback: impl Into<String>) -> Self {
        let mut queue = responses;
        queue.reverse();
        Self {
            responses: std::sync::Mutex::new(queue),
            fallback: fallback.into(),
        }
    }

    fn next_response(&self) -> String {
        self.responses
            .lock()
            .expect("mock lock")
            .pop()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn generate(&self, prompt: &str) -> Result<Generation> {
        let text = self.next_response();
        let usage = TokenUsage::estimate(prompt, &text);
        Ok(Generation { text, usage })
    }

    async fn stream(&self, prompt: &str) -> Result<LlmStream> {
        let text = self.next_response();
        let usage = TokenUsage::estimate(prompt, &text);

        let words: Vec<String> = text
            .split_inclusive(' ')
            .map(|w| w.to_string())
            .collect();

        let deltas = futures::stream::iter(
            words
                .into_iter()
                .map(|w| Ok(LlmStreamEvent::Delta(w)))
                .collect::<Vec<_>>(),
        );
        let done = futures::stream::once(async move {
            Ok(LlmStreamEvent::Done { usage: Some(usage) })
        });

        Ok(Box::pin(deltas.chain(done)))
    }

    fn model_name(&self) -> &str {
        "mock-llm"
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Create an LLM client from configuration.
pub fn create_llm(config: &crate::config::LlmConfig) -> Arc<dyn LlmClient> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider.as_str() {
        "ollama" => Arc::new(OllamaClient::new(
            config.base_url.clone(),
            config.model.clone(),
            config.temperature,
            config.max_output_tokens,
            timeout,
            config.max_retries,
        )),
        "gemini" => {
            let key = config
                .api_key
                .clone()
                .unwrap_or_else(|| std::env::var("GEMINI_API_KEY").unwrap_or_default());
            Arc::new(GeminiClient::new(
                key,
                config.model.clone(),
                config.temperature,
                config.max_output_tokens,
                config.base_url.clone(),
                timeout,
                config.max_retries,
            ))
        }
        "mock" => Arc::new(MockLlm::new("This is a mock response.")),
        other => {
            tracing::warn!(provider = other, "Unknown LLM provider, using mock");
            Arc::new(MockLlm::new("This is a mock response."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn usage_estimate_is_ceil_len_over_4() {
        let usage = TokenUsage::estimate("12345678", "123");
        assert_eq!(usage.input_tokens, 2);
        assert_eq!(usage.output_tokens, 1);
        assert_eq!(usage.total_tokens, 3);
        assert!(usage.estimated);
    }

    #[tokio::test]
    async fn mock_llm_scripted_responses() {
        let llm = MockLlm::with_script(
            vec!["first".to_string(), "second".to_string()],
            "fallback",
        );
        assert_eq!(llm.generate("p").await.unwrap().text, "first");
        assert_eq!(llm.generate("p").await.unwrap().text, "second");
        assert_eq!(llm.generate("p").await.unwrap().text, "fallback");
    }

    #[tokio::test]
    async fn mock_llm_stream_reassembles() {
        let llm = MockLlm::new("hello streaming world");
        let mut stream = llm.stream("p").await.unwrap();

        let mut text = String::new();
        let mut done = false;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                LlmStreamEvent::Delta(d) => text.push_str(&d),
                LlmStreamEvent::Done { usage } => {
                    assert!(usage.is_some());
                    done = true;
                }
            }
        }
        assert!(done);
        assert_eq!(text, "hello streaming world");
    }

    #[tokio::test]
    async fn ollama_generate_reports_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "Hi there!",
                "done": true,
                "prompt_eval_count": 12,
                "eval_count": 4
            })))
            .mount(&server)
            .await;

        let llm = OllamaClient::new(
            Some(server.uri()),
            "llama3.1".to_string(),
            0.2,
            256,
            Duration::from_secs(5),
            1,
        );

        let gen = llm.generate("hello").await.unwrap();
        assert_eq!(gen.text, "Hi there!");
        assert_eq!(gen.usage.input_tokens, 12);
        assert_eq!(gen.usage.output_tokens, 4);
        assert!(!gen.usage.estimated);
    }

    #[tokio::test]
    async fn ollama_generate_retries_transient_errors() {
        let server = MockServer::start().await;

        // First attempt fails, the retry succeeds.
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "response": "Recovered.",
                "done": true
            })))
            .mount(&server)
            .await;

        let llm = OllamaClient::new(
            Some(server.uri()),
            "llama3.1".to_string(),
            0.2,
            256,
            Duration::from_secs(5),
            3,
        );

        let gen = llm.generate("hello").await.unwrap();
        assert_eq!(gen.text, "Recovered.");
    }

    #[tokio::test]
    async fn ollama_stream_parses_ndjson() {
        let body = concat!(
            "{\"response\":\"Hel\",\"done\":false}\n",
            "{\"response\":\"lo\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true,\"prompt_eval_count\":3,\"eval_count\":2}\n",
        );

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/x-ndjson")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let llm = OllamaClient::new(
            Some(server.uri()),
            "llama3.1".to_string(),
            0.2,
            256,
            Duration::from_secs(5),
            1,
        );

        let mut stream = llm.stream("hi").await.unwrap();
        let mut text = String::new();
        let mut usage = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                LlmStreamEvent::Delta(d) => text.push_str(&d),
                LlmStreamEvent::Done { usage: u } => usage = u,
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(usage.unwrap().output_tokens, 2);
    }
}
