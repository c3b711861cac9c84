//! Shared OpenAI-compatible chat-completion client used by the
//! `Validator`, `Enhancer`, `SummaryGenerator`, and `ChatTool`. Grounded
//! on the provider-agnostic HTTP client pattern: one `reqwest::Client`,
//! one `chat_completion` entry point generic over request/response
//! shape, a typed error enum driving retry decisions upstream.

use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::LlmConfig;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API key not configured")]
    NoApiKey,
    #[error("LLM API error: {0}")]
    ApiError(String),
    #[error("failed to parse LLM response: {0}")]
    ParseError(String),
    #[error("LLM call timed out after {0}s")]
    Timeout(u64),
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("request serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::ApiError(_))
    }
}

/// A single chat call: which model, what system/user content, whether
/// the response must be a JSON object (structured-output calls from
/// `Validator`/`Enhancer`/`SummaryGenerator`) or free text (`ChatTool`).
pub struct ChatCall<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_content: String,
    pub json_mode: bool,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

pub struct LlmClient {
    http_client: reqwest::Client,
    config: LlmConfig,
    /// Bounds concurrent outbound calls across every caller sharing this
    /// client's concurrency limit (Validator, Enhancer, SummaryGenerator,
    /// ChatTool each hold their own `LlmClient` but are constructed with
    /// the same configured limit).
    call_permits: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, concurrency: usize) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .expect("failed to build LLM HTTP client");
        Self { http_client, config, call_permits: Arc::new(Semaphore::new(concurrency.max(1))) }
    }

    pub fn is_available(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Send a chat completion call and deserialize the textual content
    /// into `Resp`. Structured-output callers pass `json_mode: true`
    /// and a `Resp` matching the expected schema; `ChatTool` passes
    /// `json_mode: false` and deserializes into a plain string wrapper.
    pub async fn chat<Resp: DeserializeOwned>(&self, call: ChatCall<'_>) -> Result<Resp, LlmError> {
        let content = self.chat_text(call).await?;
        serde_json::from_str(&content)
            .map_err(|e| LlmError::ParseError(format!("{e}. content: {content}")))
    }

    /// Send a chat completion call and return the raw text content.
    pub async fn chat_text(&self, call: ChatCall<'_>) -> Result<String, LlmError> {
        let api_key = self.config.api_key.as_ref().ok_or(LlmError::NoApiKey)?;

        let request = ChatCompletionRequest {
            model: call.model.to_string(),
            messages: vec![
                ChatMessage { role: "system".to_string(), content: call.system_prompt.to_string() },
                ChatMessage { role: "user".to_string(), content: call.user_content },
            ],
            max_tokens: call.max_tokens,
            temperature: Some(call.temperature),
            response_format: call
                .json_mode
                .then(|| ResponseFormat { r#type: "json_object".to_string() }),
        };

        let url = format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'));
        tracing::debug!(url = %url, model = call.model, "calling LLM API");

        let permit = self.call_permits.acquire().await.expect("semaphore not closed");
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.config.request_timeout_seconds)
                } else {
                    LlmError::ApiError(e.to_string())
                }
            })?;
        drop(permit);

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            return Err(LlmError::ApiError(format!("API error {status}: {text}")));
        }

        let parsed: ChatCompletionResponse =
            response.json().await.map_err(|e| LlmError::ParseError(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::ParseError("empty response from LLM".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, serde::Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, serde::Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, serde::Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_without_api_key() {
        let client = LlmClient::new(LlmConfig { api_key: None, ..Default::default() }, 4);
        assert!(!client.is_available());
    }

    #[test]
    fn available_with_api_key() {
        let client =
            LlmClient::new(LlmConfig { api_key: Some("sk-test".to_string()), ..Default::default() }, 4);
        assert!(client.is_available());
    }

    #[test]
    fn retryable_errors() {
        assert!(LlmError::Timeout(60).is_retryable());
        assert!(LlmError::RateLimited(30).is_retryable());
        assert!(!LlmError::NoApiKey.is_retryable());
    }
}
