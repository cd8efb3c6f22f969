//! Email agent: ingest mail, analyze it, and keep a task list in step.

pub mod analysis;
pub mod config;
pub mod error;
pub mod llm;
pub mod monitor;
pub mod pipeline;
pub mod reconciler;
pub mod source;
pub mod store;
pub mod summary;
