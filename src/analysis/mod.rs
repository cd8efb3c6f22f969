//! Analysis engine: turns an item's content into a validated result.

pub mod analyzer;
pub mod rate_limiter;
pub mod schema;

pub use analyzer::LlmAnalyzer;
pub use rate_limiter::MinIntervalLimiter;

use async_trait::async_trait;

use crate::error::AnalysisError;
use crate::llm::CallUsage;
use crate::pipeline::types::{AnalysisResult, ItemContent};

/// A successful analysis together with what it cost.
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub result: AnalysisResult,
    pub usage: CallUsage,
}

/// Remote capability that scores, summarizes and extracts tasks.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Provider label recorded in the cost ledger.
    fn provider(&self) -> &str;

    /// Model label recorded in the cost ledger.
    fn model(&self) -> &str;

    /// Analyze one item. Failures that consumed tokens report that usage
    /// through [`AnalysisError::usage`].
    async fn analyze(&self, content: &ItemContent) -> Result<AnalysisOutput, AnalysisError>;

    /// Free-form generation used for daily digests.
    async fn digest(&self, prompt: &str) -> Result<(String, CallUsage), AnalysisError>;

    async fn health_check(&self) -> Result<(), AnalysisError>;
}
