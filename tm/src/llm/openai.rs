//! OpenAI-compatible chat client
//!
//! Implements [`LlmClient`] against any Chat Completions-shaped endpoint
//! (the `llm_endpoint` config value). Transient HTTP failures retry with
//! exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{LlmClient, LlmError, LlmRequest};

/// Maximum number of retries for transient errors
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// OpenAI-compatible API client
pub struct OpenAiClient {
    endpoint: String,
    api_key: String,
    model: String,
    http: Client,
}

impl OpenAiClient {
    /// Create a new client
    ///
    /// `endpoint` is the full chat-completions URL; `api_key` may be empty
    /// for unauthenticated local endpoints.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(LlmError::Network)?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            http,
        })
    }

    fn build_body(&self, request: &LlmRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if !request.system.is_empty() {
            messages.push(serde_json::json!({"role": "system", "content": request.system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if request.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
        debug!(endpoint = %self.endpoint, model = %self.model, "OpenAiClient::complete");
        let body = self.build_body(&request);

        let mut backoff = INITIAL_BACKOFF_MS;
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                warn!(attempt, backoff_ms = backoff, "OpenAiClient: retrying after transient error");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff *= 2;
            }

            let mut req = self.http.post(&self.endpoint).json(&body);
            if !self.api_key.is_empty() {
                req = req.bearer_auth(&self.api_key);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(LlmError::Network(e));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                let error = LlmError::Api {
                    status: status.as_u16(),
                    message,
                };
                if is_retryable_status(status.as_u16()) {
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }

            let parsed: ChatResponse = response.json().await.map_err(LlmError::Network)?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| LlmError::InvalidResponse("empty choices in chat response".to_string()))?;
            return Ok(content);
        }

        Err(last_error.unwrap_or_else(|| LlmError::InvalidResponse("retries exhausted".to_string())))
    }
}
