//! LLM rollup generation.
//!
//! The LLM is an optional enhancement layered on top of the deterministic
//! rollup; every outcome is an explicit [`RollupGeneration`] variant that
//! the caller matches on. No LLM failure can fail a rollup job.

pub mod context;
pub mod openai;
pub mod prompts;
pub mod redaction;
pub mod schema;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::LlmError;
use crate::store::rollups::LlmTelemetry;

/// One raw model response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub telemetry: LlmTelemetry,
}

/// JSON-mode chat completion capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete_json(&self, system: &str, user: &str) -> Result<LlmResponse, LlmError>;
}

/// Outcome of one LLM rollup attempt.
#[derive(Debug)]
pub enum RollupGeneration {
    /// The LLM was never called.
    Skipped { reason: &'static str },
    /// The model produced output that passed strict validation.
    Succeeded {
        validated: schema::RollupOutput,
        raw: String,
        model: String,
        telemetry: LlmTelemetry,
    },
    /// The model answered but the output failed validation.
    ValidationFailed {
        raw: String,
        error: String,
        model: String,
        telemetry: LlmTelemetry,
    },
    /// The request itself failed (network, credential, rate limit).
    TransientError { cause: String },
}

/// Call the model and validate its output.
pub async fn generate_rollup(
    client: &dyn LlmClient,
    system_prompt: &str,
    user_prompt: &str,
) -> RollupGeneration {
    let response = match client.complete_json(system_prompt, user_prompt).await {
        Ok(response) => response,
        Err(e) => {
            return RollupGeneration::TransientError {
                cause: e.to_string(),
            };
        }
    };

    match schema::validate_rollup_output(&response.content) {
        Ok(validated) => RollupGeneration::Succeeded {
            validated,
            raw: response.content,
            model: response.model,
            telemetry: response.telemetry,
        },
        Err(error) => RollupGeneration::ValidationFailed {
            raw: response.content,
            error,
            model: response.model,
            telemetry: response.telemetry,
        },
    }
}

/// Scripted client for tests: each call pops the next response.
pub struct FakeLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
}

impl FakeLlmClient {
    pub fn with_responses(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn with_content(content: &str) -> Self {
        Self::with_responses(vec![Ok(content.to_string())])
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn complete_json(&self, _system: &str, _user: &str) -> Result<LlmResponse, LlmError> {
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(LlmResponse {
                content,
                model: "fake".to_string(),
                telemetry: LlmTelemetry {
                    input_tokens: Some(100),
                    output_tokens: Some(50),
                    latency_ms: Some(5),
                },
            }),
            Some(Err(e)) => Err(e),
            None => Err(LlmError::RequestFailed {
                reason: "fake client has no scripted responses left".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_output() -> String {
        json!({
            "summary_md": "### What happened this week\n- Intro call",
            "highlights": { "events": ["Intro call"], "risks": [], "next_actions": ["Send quote"] },
            "confidence": 0.8,
            "field_deltas": []
        })
        .to_string()
    }

    #[tokio::test]
    async fn valid_output_succeeds() {
        let client = FakeLlmClient::with_content(&valid_output());
        let outcome = generate_rollup(&client, "sys", "user").await;
        let RollupGeneration::Succeeded { validated, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert!(validated.summary_md.contains("Intro call"));
    }

    #[tokio::test]
    async fn invalid_json_is_a_validation_failure() {
        let client = FakeLlmClient::with_content("not json at all");
        let outcome = generate_rollup(&client, "sys", "user").await;
        assert!(matches!(outcome, RollupGeneration::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn request_failure_is_transient() {
        let client = FakeLlmClient::with_responses(vec![Err(LlmError::RequestFailed {
            reason: "503 from upstream".to_string(),
        })]);
        let outcome = generate_rollup(&client, "sys", "user").await;
        let RollupGeneration::TransientError { cause } = outcome else {
            panic!("expected transient error");
        };
        assert!(cause.contains("503"));
    }
}
