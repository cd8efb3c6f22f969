//! Persistence layer: the `Database` trait and its libSQL implementation.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AnalysisHistoryEntry, CallPurpose, CostSummary, Database, LlmCallRecord, ProcessingLogEntry,
};
