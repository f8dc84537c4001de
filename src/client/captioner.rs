//! Core `Captioner` trait and the HTTP-backed `ApiCaptioner`.
//!
//! `ApiCaptioner` calls an OpenAI-compatible `/chat/completions` endpoint
//! that accepts audio as an `audio_url` content part (vLLM and friends).
//! All connection details come from [`EndpointConfig`]; nothing is hardcoded.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::audio::to_data_url;
use crate::config::EndpointConfig;

/// Response bodies quoted in errors are cut to this many characters.
const ERROR_BODY_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// CaptionError
// ---------------------------------------------------------------------------

/// Errors that can occur during a single captioning call.
#[derive(Debug, Error)]
pub enum CaptionError {
    /// HTTP transport or connection error.
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// The call did not complete within the configured timeout.
    #[error("captioning request timed out")]
    Timeout,

    /// The endpoint answered with a non-2xx status.
    #[error("endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The HTTP response could not be parsed as expected JSON.
    #[error("failed to parse endpoint response: {0}")]
    Parse(String),

    /// The response carried no generated text.
    #[error("endpoint returned no caption")]
    EmptyResponse,
}

impl From<reqwest::Error> for CaptionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CaptionError::Timeout
        } else {
            CaptionError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Caption
// ---------------------------------------------------------------------------

/// Generated text plus the endpoint's usage counters.
#[derive(Debug, Clone, PartialEq)]
pub struct Caption {
    pub text: String,
    /// Token counters as reported (`prompt_tokens`, `completion_tokens`, …);
    /// empty when the endpoint does not report usage.
    pub usage: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Captioner trait
// ---------------------------------------------------------------------------

/// Async trait for remote captioning backends.
///
/// Implementors must be `Send + Sync` so one instance can be shared by every
/// worker behind an `Arc<dyn Captioner>`.
///
/// # Arguments
/// * `audio` – Encoded clip bytes, borrowed straight from the shard store.
/// * `mime`  – Container MIME type of `audio`.
#[async_trait]
pub trait Captioner: Send + Sync {
    async fn caption(&self, audio: &[u8], mime: &str) -> Result<Caption, CaptionError>;
}

// ---------------------------------------------------------------------------
// ApiCaptioner
// ---------------------------------------------------------------------------

/// Calls `<base_url>/chat/completions` with the clip as a base64 data URL.
pub struct ApiCaptioner {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl ApiCaptioner {
    /// Build an `ApiCaptioner` whose HTTP client enforces
    /// `config.timeout_secs` on every call.
    ///
    /// The client keeps idle connections around so that a large worker pool
    /// reuses sockets instead of reconnecting per item.
    pub fn from_config(config: &EndpointConfig) -> Result<Self, CaptionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(usize::MAX)
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn endpoint_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request_body(&self, data_url: &str) -> Value {
        json!({
            "model": self.config.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "audio_url", "audio_url": { "url": data_url } }
                ]
            }],
            "temperature": self.config.temperature,
            "max_tokens":  self.config.max_tokens
        })
    }
}

#[async_trait]
impl Captioner for ApiCaptioner {
    /// The `Authorization: Bearer …` header is attached only when
    /// `config.api_key` is a non-empty string.
    async fn caption(&self, audio: &[u8], mime: &str) -> Result<Caption, CaptionError> {
        let body = self.request_body(&to_data_url(audio, mime));

        let mut req = self.client.post(self.endpoint_url()).json(&body);
        let key = self.config.api_key.as_deref().unwrap_or("");
        if !key.is_empty() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CaptionError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| CaptionError::Parse(e.to_string()))?;
        parse_completion(&json)
    }
}

/// Pull the caption and usage counters out of a chat-completions response.
pub fn parse_completion(json: &Value) -> Result<Caption, CaptionError> {
    let text = json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or(CaptionError::EmptyResponse)?
        .to_string();

    let usage = match &json["usage"] {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    Ok(Caption { text, usage })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
