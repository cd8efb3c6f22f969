//! LLM integration.
//!
//! A single OpenAI-compatible HTTP provider sits behind the [`LlmProvider`]
//! trait so analysis code never depends on a concrete vendor.

mod costs;
pub mod openai;
pub mod provider;

pub use costs::{default_cost, model_cost};
pub use openai::OpenAiCompatProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
pub fn create_provider(
    config: &LlmConfig,
    timeout: Duration,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiCompatProvider::new(
        &config.base_url,
        config.api_key.clone(),
        &config.model,
        timeout,
    )?;
    tracing::info!(model = %config.model, base_url = %config.base_url, "Using OpenAI-compatible provider");
    Ok(Arc::new(provider))
}
