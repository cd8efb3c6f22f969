//! Item processing pipeline.
//!
//! Items flow `Unprocessed -> Analyzing -> Analyzed -> TaskSyncing -> Done`,
//! or end in `Failed`. The [`Orchestrator`] owns every transition; storage
//! enforces them with compare-and-set writes.

pub mod orchestrator;
pub mod retry;
pub mod types;

pub use orchestrator::Orchestrator;
pub use retry::RetryPolicy;
pub use types::{
    CycleReport, IngestReport, Item, ItemFilter, ItemState, ReanalysisOutcome, SyncReport,
    TaskRecord,
};
