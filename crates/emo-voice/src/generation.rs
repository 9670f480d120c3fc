//! **Response generation**: the `ResponseGenerator` capability and the Gemini backend.

use crate::config::GenerationConfig;
use crate::error::{GenerationError, VoiceError, VoiceResult};
use serde::Deserialize;
use std::time::Duration;

/// Backend that turns a prompt into reply text.
pub trait ResponseGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Production generator: Google Gemini `generateContent` over blocking HTTP.
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    /// Base URL without trailing slash (e.g. https://generativelanguage.googleapis.com/v1beta).
    pub base_url: String,
    api_key: String,
    pub model: String,
    client: reqwest::blocking::Client,
}

impl GeminiGenerator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Generation(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// `Ok(None)` when no API key is configured.
    pub fn from_config(cfg: &GenerationConfig) -> VoiceResult<Option<Self>> {
        if !cfg.has_credential() {
            return Ok(None);
        }
        Self::new(
            cfg.base_url.clone(),
            cfg.api_key.trim(),
            cfg.model.clone(),
            Duration::from_secs(cfg.timeout_secs.max(1)),
        )
        .map(Some)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

impl ResponseGenerator for GeminiGenerator {
    fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let res = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .map_err(|e| GenerationError::Network(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().unwrap_or_default();
            return Err(GenerationError::Api { status, body });
        }
        let parsed: GenerateResponse = res
            .json()
            .map_err(|e| GenerationError::Network(e.to_string()))?;
        extract_reply(parsed).ok_or(GenerationError::EmptyReply)
    }
}

fn extract_reply(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
