//! Media gateway
//!
//! Images and audio are not indexed directly; they are converted to captions
//! and transcripts by a provider behind this trait, then chunked like any
//! other text with `modality` set accordingly.

use crate::errors::IngestionError;
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Caption/transcription capability consumed by the document loader.
#[async_trait]
pub trait MediaGateway: Send + Sync {
    /// Describe an image for retrieval purposes.
    async fn caption_image(&self, bytes: &[u8], filename: &str) -> Result<String, IngestionError>;

    /// Transcribe an audio file.
    async fn transcribe_audio(&self, bytes: &[u8], filename: &str)
        -> Result<String, IngestionError>;
}

/// Ollama-backed captioner using a multimodal model. Audio transcription is
/// not offered by the generate API, so audio files are rejected per-file and
/// the batch continues.
pub struct OllamaMediaGateway {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct CaptionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Deserialize)]
struct CaptionResponse {
    #[serde(default)]
    response: String,
}

impl OllamaMediaGateway {
    pub fn new(base_url: Option<String>, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
        }
    }
}

#[async_trait]
impl MediaGateway for OllamaMediaGateway {
    async fn caption_image(&self, bytes: &[u8], filename: &str) -> Result<String, IngestionError> {
        let url = format!("{}/api/generate", self.base_url);
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

        let request = CaptionRequest {
            model: &self.model,
            prompt: "Describe this image in detail for a searchable knowledge base.",
            images: vec![encoded],
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| IngestionError::MediaError(format!("caption request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(IngestionError::MediaError(format!(
                "caption API error {} for {filename}",
                response.status()
            )));
        }

        let result: CaptionResponse = response
            .json()
            .await
            .map_err(|e| IngestionError::MediaError(format!("bad caption response: {e}")))?;

        if result.response.trim().is_empty() {
            return Err(IngestionError::MediaError(format!(
                "empty caption for {filename}"
            )));
        }

        Ok(result.response)
    }

    async fn transcribe_audio(
        &self,
        _bytes: &[u8],
        filename: &str,
    ) -> Result<String, IngestionError> {
        Err(IngestionError::MediaError(format!(
            "no transcription provider configured for {filename}"
        )))
    }
}

/// Fixed-output gateway for tests.
pub struct MockMediaGateway {
    pub caption: String,
    pub transcript: String,
}

impl Default for MockMediaGateway {
    fn default() -> Self {
        Self {
            caption: "A screenshot of the product dashboard.".to_string(),
            transcript: "Hello, I need help with my order.".to_string(),
        }
    }
}

#[async_trait]
impl MediaGateway for MockMediaGateway {
    async fn caption_image(&self, _bytes: &[u8], _filename: &str) -> Result<String, IngestionError> {
        Ok(self.caption.clone())
    }

    async fn transcribe_audio(
        &self,
        _bytes: &[u8],
        _filename: &str,
    ) -> Result<String, IngestionError> {
        Ok(self.transcript.clone())
    }
}
