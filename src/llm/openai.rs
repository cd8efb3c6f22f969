//! OpenAI-compatible chat completion provider over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};

/// Provider for any endpoint speaking the OpenAI chat completion format.
pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    name: String,
}

impl OpenAiCompatProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            name: "openai".to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = temperature.into();
        }
        if request.json_output {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        body
    }

    fn transport_error(&self, e: &reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                provider: self.name.clone(),
            }
        } else {
            LlmError::RequestFailed {
                provider: self.name.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model).unwrap_or_else(costs::default_cost)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(
            provider = %self.name,
            model = %self.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );

        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.request_body(&request))
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = parse_retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            let err = map_error_status(&self.name, status, &body, retry_after);
            warn!(provider = %self.name, status, error = %err, "chat completion failed");
            return Err(err);
        }

        let parsed: ApiResponse = response.json().await.map_err(|e| {
            LlmError::InvalidResponse {
                provider: self.name.clone(),
                reason: format!("failed to parse response: {e}"),
            }
        })?;
        into_completion(&self.name, parsed)
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        let response = self
            .http
            .get(self.url("models"))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(map_error_status(&self.name, status, &body, None))
    }
}

impl std::fmt::Debug for OpenAiCompatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"***")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn into_completion(provider: &str, parsed: ApiResponse) -> Result<CompletionResponse, LlmError> {
    let usage = parsed.usage.unwrap_or_default();
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "response has no choices".to_string(),
        })?;
    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
        response_id: parsed.id,
    })
}

/// Translate a non-success HTTP status into an [`LlmError`].
fn map_error_status(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> LlmError {
    let provider = provider.to_string();
    match status {
        429 if is_quota_exhausted(body) => LlmError::QuotaExhausted {
            provider,
            reason: extract_error_message(body)
                .unwrap_or_else(|| "credits exhausted or spending limit reached".into()),
        },
        429 => LlmError::RateLimited {
            provider,
            retry_after: retry_after.or_else(|| parse_retry_after_body(body)),
        },
        401 | 403 => LlmError::AuthFailed { provider },
        408 => LlmError::Timeout { provider },
        500..=599 => LlmError::ServerError {
            provider,
            status,
            body: body.to_string(),
        },
        _ => LlmError::Rejected {
            provider,
            status,
            body: extract_error_message(body).unwrap_or_else(|| body.to_string()),
        },
    }
}

fn is_quota_exhausted(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("quota exceeded")
        || lower.contains("spending limit")
        || lower.contains("billing")
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("error").and_then(|v| {
        v.get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .or_else(|| v.as_str().map(String::from))
    })
}

fn parse_retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    let raw = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())?;
    parse_seconds(raw)
}

fn parse_retry_after_body(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("retry_after_ms")
        .and_then(|v| v.as_u64())
        .map(Duration::from_millis)
        .or_else(|| {
            value
                .get("retry_after")
                .and_then(|v| v.as_f64())
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        })
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
