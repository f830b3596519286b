//! OpenAI-compatible chat-completions client.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::{LlmClient, LlmResponse};
use crate::store::rollups::LlmTelemetry;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 150;

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn new(api_key: SecretString, base_url: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete_json(&self, system: &str, user: &str) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "max_tokens": 900,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let backoff = BACKOFF_BASE_MS * (1 << (attempt - 2));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let started = Instant::now();
            let response = self
                .http
                .post(&url)
                .bearer_auth(self.api_key.expose_secret())
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    last_error = format!("request error: {e}");
                    warn!(attempt, error = %last_error, "LLM request failed");
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                last_error = format!("retryable status {status}");
                warn!(attempt, %status, "LLM returned retryable status");
                continue;
            }
            if !status.is_success() {
                return Err(LlmError::RequestFailed {
                    reason: format!("status {status}"),
                });
            }

            let latency_ms = started.elapsed().as_millis() as u64;
            let parsed: ChatResponse = response.json().await.map_err(|e| {
                LlmError::RequestFailed {
                    reason: format!("response decode: {e}"),
                }
            })?;
            let content = parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| LlmError::RequestFailed {
                    reason: "response had no choices".to_string(),
                })?;

            debug!(latency_ms, "LLM call completed");
            return Ok(LlmResponse {
                content,
                model: parsed.model.unwrap_or_else(|| self.model.clone()),
                telemetry: LlmTelemetry {
                    input_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
                    output_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
                    latency_ms: Some(latency_ms),
                },
            });
        }

        Err(LlmError::RequestFailed { reason: last_error })
    }
}
