//! Chat-completions adapter for OpenAI-compatible endpoints.
//!
//! Speaks `POST {base_url}/chat/completions` with either
//! `response_format: {"type": "json_schema", ...}` (strict) or
//! `{"type": "json_object"}`. Each call is a single HTTP attempt; failures are
//! mapped onto [`GatewayError`] and retrying transient ones is up to the
//! caller.

use std::time::Duration;

use async_trait::async_trait;
use packet::{ChatRequest, ChatResponse, GatewayError, LlmGateway, ResponseFormat};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::LlmConfigError;

/// Longest response body kept in a [`GatewayError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Connection settings for one provider/model pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Label used for capability lookup and packet metadata.
    pub provider: String,
    pub model: String,
    /// Endpoint root, without the `/chat/completions` suffix.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: Option<f32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            timeout_secs: 120,
            temperature: Some(0.2),
        }
    }
}

/// [`LlmGateway`] over an OpenAI-compatible HTTP API.
#[derive(Clone)]
pub struct OpenAiGateway {
    client: reqwest::Client,
    config: ProviderConfig,
    api_key: String,
    endpoint: String,
}

impl OpenAiGateway {
    pub fn new(config: ProviderConfig, api_key: String) -> Result<Self, LlmConfigError> {
        if config.model.trim().is_empty() {
            return Err(LlmConfigError::MissingModel);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmConfigError::Client(e.to_string()))?;
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Ok(Self { client, config, api_key, endpoint })
    }

    /// Reads the API key from the environment variable named in `config`.
    pub fn from_env(config: ProviderConfig) -> Result<Self, LlmConfigError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| LlmConfigError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(config, api_key)
    }

    async fn post(&self, body: &Value) -> Result<ChatResponse, GatewayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify(status, &text));
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let text = completion_text(&raw).ok_or(GatewayError::EmptyResponse)?;
        Ok(ChatResponse { text, raw: Some(raw) })
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn chat_json(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        let body = request_body(&self.config, &request);
        debug!(model = %self.config.model, endpoint = %self.endpoint, "chat completion");
        self.post(&body).await
    }

    fn provider_name(&self) -> &str {
        &self.config.provider
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

impl std::fmt::Debug for OpenAiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGateway")
            .field("endpoint", &self.endpoint)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

pub fn request_body(config: &ProviderConfig, request: &ChatRequest) -> Value {
    let response_format = match &request.response_format {
        ResponseFormat::JsonObject => json!({"type": "json_object"}),
        ResponseFormat::JsonSchema { name, schema } => json!({
            "type": "json_schema",
            "json_schema": {"name": name, "strict": true, "schema": schema},
        }),
    };
    let mut body = json!({
        "model": config.model,
        "messages": request.messages,
        "max_tokens": request.max_tokens,
        "response_format": response_format,
    });
    if let Some(t) = config.temperature {
        body["temperature"] = json!(t);
    }
    body
}

fn completion_text(raw: &Value) -> Option<String> {
    raw.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Maps a non-success answer onto a gateway error. A 400 that mentions the
/// response format means the model cannot do strict structured output.
pub fn classify(status: StatusCode, body: &str) -> GatewayError {
    let lower = body.to_lowercase();
    if status == StatusCode::BAD_REQUEST
        && (lower.contains("response_format") || lower.contains("json_schema"))
    {
        return GatewayError::SchemaUnsupported(truncate(body));
    }
    GatewayError::Status { status: status.as_u16(), body: truncate(body) }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}
