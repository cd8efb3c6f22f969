//! LLM provider trait and request/response types.

use std::ops::AddAssign;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the provider to constrain output to a JSON object.
    pub json_output: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
            json_output: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown,
}

impl FinishReason {
    pub fn from_api(raw: Option<&str>) -> Self {
        match raw {
            Some("stop") => Self::Stop,
            Some("length") => Self::Length,
            Some("content_filter") => Self::ContentFilter,
            _ => Self::Unknown,
        }
    }
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
    pub response_id: Option<String>,
}

/// Tokens and money spent by one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: Decimal,
}

impl CallUsage {
    /// Price a response against a provider's per-token rates.
    pub fn priced(response: &CompletionResponse, rates: (Decimal, Decimal)) -> Self {
        let (input_rate, output_rate) = rates;
        Self {
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            cost: input_rate * Decimal::from(response.input_tokens)
                + output_rate * Decimal::from(response.output_tokens),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

impl AddAssign for CallUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens = self.input_tokens.saturating_add(rhs.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(rhs.output_tokens);
        self.cost += rhs.cost;
    }
}

/// A chat completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier sent with each request.
    fn model_name(&self) -> &str;

    /// Provider label used in logs and the cost ledger.
    fn provider_name(&self) -> &str {
        "llm"
    }

    /// Per-token (input, output) price.
    fn cost_per_token(&self) -> (Decimal, Decimal);

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn usage_is_priced_per_token() {
        let response = CompletionResponse {
            content: "{}".into(),
            input_tokens: 1000,
            output_tokens: 200,
            finish_reason: FinishReason::Stop,
            response_id: None,
        };
        let usage = CallUsage::priced(&response, (dec!(0.00000015), dec!(0.0000006)));
        assert_eq!(usage.cost, dec!(0.00027));
        assert_eq!(usage.total_tokens(), 1200);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = CallUsage::default();
        total += CallUsage {
            input_tokens: 10,
            output_tokens: 5,
            cost: dec!(0.01),
        };
        total += CallUsage {
            input_tokens: 1,
            output_tokens: 1,
            cost: dec!(0.02),
        };
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 6);
        assert_eq!(total.cost, dec!(0.03));
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::from_api(Some("stop")), FinishReason::Stop);
        assert_eq!(FinishReason::from_api(Some("length")), FinishReason::Length);
        assert_eq!(FinishReason::from_api(None), FinishReason::Unknown);
    }
}
