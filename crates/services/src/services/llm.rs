//! Text-in/text-out boundary to the AI provider.
//!
//! The analyzer treats whatever comes back as untrusted input; nothing in
//! this module validates the content beyond transport-level concerns.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

const ENDPOINT_ENV: &str = "GREENLIGHT_LLM_URL";
const MODEL_ENV: &str = "GREENLIGHT_LLM_MODEL";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Response parse error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProviderError {
    /// Transport-level failures worth another attempt. Config problems and
    /// client-side API errors are not going to fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RequestFailed(_) => true,
            ProviderError::ApiError { status, .. } => *status == 429 || *status >= 500,
            ProviderError::ParseError(_) | ProviderError::ConfigError(_) => false,
        }
    }
}

/// Opaque completion capability: one prompt in, raw text out.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> Result<String, ProviderError>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiProvider {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    model: String,
}

impl OpenAiProvider {
    pub fn from_env() -> Self {
        let api_key = std::env::var(API_KEY_ENV).ok();
        if api_key.is_none() {
            tracing::warn!("{API_KEY_ENV} not set, AI analysis will fail until configured");
        }

        Self {
            client: Client::new(),
            api_key,
            endpoint: std::env::var(ENDPOINT_ENV).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
            model: std::env::var(MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> Result<String, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::ConfigError(format!("{API_KEY_ENV} is not set")))?;

        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_text},
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                ProviderError::ParseError("response has no message content".to_string())
            })
    }
}

/// Test double: replays a fixed script of responses.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, String>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, text: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(text.to_string()));
    }

    pub fn push_err(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String, ProviderError> {
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(ProviderError::RequestFailed(message)),
            None => Err(ProviderError::RequestFailed("script exhausted".to_string())),
        }
    }
}
