//! LLM-backed analysis engine.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::analysis::schema::parse_analysis_response;
use crate::analysis::{AnalysisEngine, AnalysisOutput, MinIntervalLimiter};
use crate::error::AnalysisError;
use crate::llm::{CallUsage, ChatMessage, CompletionRequest, FinishReason, LlmProvider};
use crate::pipeline::types::ItemContent;
use crate::source::mail::truncate_chars;

/// Max tokens for one analysis answer.
const ANALYSIS_MAX_TOKENS: u32 = 800;

const ANALYSIS_TEMPERATURE: f32 = 0.2;

const DIGEST_MAX_TOKENS: u32 = 400;

const DIGEST_TEMPERATURE: f32 = 0.3;

/// Body characters sent to the model.
const PROMPT_BODY_CHARS: usize = 4000;

/// Scores, summarizes and extracts tasks with a single JSON-mode call.
pub struct LlmAnalyzer {
    llm: Arc<dyn LlmProvider>,
    limiter: Arc<MinIntervalLimiter>,
}

impl LlmAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>, limiter: Arc<MinIntervalLimiter>) -> Self {
        Self { llm, limiter }
    }
}

#[async_trait]
impl AnalysisEngine for LlmAnalyzer {
    fn provider(&self) -> &str {
        self.llm.provider_name()
    }

    fn model(&self) -> &str {
        self.llm.model_name()
    }

    async fn analyze(&self, content: &ItemContent) -> Result<AnalysisOutput, AnalysisError> {
        self.limiter.acquire().await;

        let request = CompletionRequest::new(vec![
            ChatMessage::system(ANALYSIS_SYSTEM_PROMPT),
            ChatMessage::user(build_analysis_prompt(content)),
        ])
        .with_temperature(ANALYSIS_TEMPERATURE)
        .with_max_tokens(ANALYSIS_MAX_TOKENS)
        .with_json_output();

        let response = self.llm.complete(request).await?;
        let usage = CallUsage::priced(&response, self.llm.cost_per_token());

        if response.finish_reason == FinishReason::Length {
            return Err(AnalysisError::InvalidContent {
                reason: "answer truncated at max_tokens".to_string(),
                usage: Some(usage),
            });
        }

        match parse_analysis_response(&response.content, content.received_at.date_naive()) {
            Ok(result) => {
                debug!(
                    importance = result.importance_score,
                    candidates = result.candidates.len(),
                    tokens = usage.total_tokens(),
                    "Analysis parsed"
                );
                Ok(AnalysisOutput { result, usage })
            }
            Err(reason) => {
                warn!(
                    raw_response = %truncate_chars(&response.content, 500),
                    error = %reason,
                    "Analysis answer failed validation"
                );
                Err(AnalysisError::InvalidContent {
                    reason,
                    usage: Some(usage),
                })
            }
        }
    }

    async fn digest(&self, prompt: &str) -> Result<(String, CallUsage), AnalysisError> {
        self.limiter.acquire().await;

        let request = CompletionRequest::new(vec![
            ChatMessage::system(DIGEST_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ])
        .with_temperature(DIGEST_TEMPERATURE)
        .with_max_tokens(DIGEST_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let usage = CallUsage::priced(&response, self.llm.cost_per_token());
        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(AnalysisError::InvalidContent {
                reason: "empty digest".to_string(),
                usage: Some(usage),
            });
        }
        Ok((text, usage))
    }

    async fn health_check(&self) -> Result<(), AnalysisError> {
        self.llm.health_check().await.map_err(AnalysisError::from)
    }
}

const ANALYSIS_SYSTEM_PROMPT: &str = "You are an email analyst. Read one email and answer with ONLY a JSON object:\n\
{\"importance_score\": 0.0, \"sentiment\": \"...\", \"summary\": \"...\", \"tasks\": [{\"title\": \"...\", \"description\": \"...\", \"due_date\": \"YYYY-MM-DD\", \"priority\": \"...\", \"confidence\": 0.0}]}\n\n\
Fields:\n\
- importance_score: 0.0 to 1.0. Deadlines, clients, managers and direct requests score high; newsletters and notifications score low.\n\
- sentiment: one of \"positive\", \"negative\", \"neutral\", \"urgent\".\n\
- summary: 2-3 sentences, under 150 words, naming any deadline.\n\
- tasks: actionable items addressed to the recipient. Empty array when there are none.\n\
  - title: short imperative phrase\n\
  - description: optional detail\n\
  - due_date: ISO date if one is stated, otherwise null\n\
  - priority: one of \"low\", \"medium\", \"high\", \"urgent\"\n\
  - confidence: 0.0 to 1.0, how sure you are this is a real task\n\n\
Do not invent tasks from FYI mail.";

const DIGEST_SYSTEM_PROMPT: &str = "You write a short daily digest of processed email for a busy professional. \
Use 3-5 sentences. Lead with what needs attention, then notable themes. No greetings.";

fn build_analysis_prompt(content: &ItemContent) -> String {
    format!(
        "From: {}\nSubject: {}\nReceived: {}\n\n{}",
        content.sender,
        content.subject,
        content.received_at.format("%Y-%m-%d %H:%M UTC (%A)"),
        truncate_chars(&content.body, PROMPT_BODY_CHARS)
    )
}
