//! `Database` trait: the single async interface for all persistence.
//!
//! Every method is one unit of work. Multi-row writes commit together or
//! not at all, and state changes are compare-and-set on the current state,
//! so a concurrent caller never observes or overwrites a half-applied
//! transition.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::llm::CallUsage;
use crate::pipeline::types::{
    AnalysisResult, Item, ItemFilter, ItemState, NewTaskRecord, Priority, TaskRecord, TaskStatus,
};
use crate::source::RawItem;
use crate::summary::DailySummary;

/// Why a model call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Analysis,
    Reanalysis,
    Digest,
}

impl CallPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Reanalysis => "reanalysis",
            Self::Digest => "digest",
        }
    }
}

/// One row of the cost ledger.
#[derive(Debug, Clone)]
pub struct LlmCallRecord {
    pub id: Uuid,
    pub item_id: Option<Uuid>,
    pub provider: String,
    pub model: String,
    pub purpose: CallPurpose,
    pub usage: CallUsage,
    /// False when the call's answer was discarded.
    pub succeeded: bool,
    pub created_at: DateTime<Utc>,
}

/// Spend over a period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CostSummary {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: Decimal,
}

/// One row of the processing log.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingLogEntry {
    pub id: Uuid,
    pub operation: String,
    /// `success`, `partial` or `error`.
    pub status: String,
    pub message: String,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub cost: Decimal,
    pub created_at: DateTime<Utc>,
}

/// An analysis replaced by a re-analysis.
#[derive(Debug, Clone)]
pub struct AnalysisHistoryEntry {
    pub item_id: Uuid,
    pub version: u32,
    pub analysis: AnalysisResult,
    pub archived_at: DateTime<Utc>,
}

/// Backend-agnostic persistence for the pipeline.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Cheapest possible round trip.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Items ───────────────────────────────────────────────────────

    /// Insert a fetched item as `Unprocessed`. Returns `None` when the
    /// external id is already known.
    async fn insert_item(&self, raw: &RawItem) -> Result<Option<Uuid>, DatabaseError>;

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>, DatabaseError>;

    async fn get_item_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Item>, DatabaseError>;

    /// Items in `state` matching `filter`, oldest received first.
    async fn list_items_by_state(
        &self,
        state: ItemState,
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<Item>, DatabaseError>;

    /// Items received in `[start, end)`.
    async fn list_items_received_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Item>, DatabaseError>;

    async fn count_items_by_state(&self) -> Result<Vec<(ItemState, u64)>, DatabaseError>;

    /// `Unprocessed → Analyzing`. False if someone else holds the item.
    async fn claim_item(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// `Analyzing → Unprocessed`.
    async fn release_item(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Return `Analyzing` claims taken before `claimed_before` to
    /// `Unprocessed`. Returns how many were released.
    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    /// `Analyzing → Analyzed`, writing result and cost in the same
    /// statement. False if the claim was lost.
    async fn commit_analysis(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        usage: &CallUsage,
    ) -> Result<bool, DatabaseError>;

    /// `Analyzing → Failed(reason)`.
    async fn fail_item(&self, id: Uuid, reason: &str) -> Result<bool, DatabaseError>;

    /// Insert task records and move `Analyzed → TaskSyncing` together.
    /// Records whose candidate index already exists are skipped. Returns
    /// `None` if the item was not `Analyzed`.
    async fn materialize_tasks(
        &self,
        item_id: Uuid,
        tasks: &[NewTaskRecord],
    ) -> Result<Option<usize>, DatabaseError>;

    /// Replace the analysis of an item at `expected_version`: archive the
    /// old result, store the new one, add cost, insert `tasks` and move to
    /// `TaskSyncing`. False if the item changed underneath.
    async fn apply_reanalysis(
        &self,
        item_id: Uuid,
        expected_version: u32,
        result: &AnalysisResult,
        usage: &CallUsage,
        tasks: &[NewTaskRecord],
    ) -> Result<bool, DatabaseError>;

    /// `TaskSyncing → Done` if every record is synced or exhausted.
    async fn finalize_item(&self, item_id: Uuid) -> Result<bool, DatabaseError>;

    async fn list_analysis_history(
        &self,
        item_id: Uuid,
    ) -> Result<Vec<AnalysisHistoryEntry>, DatabaseError>;

    // ── Task records ────────────────────────────────────────────────

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    async fn list_tasks_for_item(&self, item_id: Uuid) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Records of items received in `[start, end)`.
    async fn list_tasks_for_items_received_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Records without an external id that may still be retried, oldest
    /// first.
    async fn list_unsynced_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError>;

    async fn list_synced_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Take the right to push a record remotely. False if it is synced,
    /// exhausted, or claimed by someone else since `stale_before`.
    async fn claim_task_sync(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Drop a sync claim without recording an attempt.
    async fn release_task_sync(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Overwrite the due date and priority of a record.
    async fn update_task_details(
        &self,
        id: Uuid,
        due_date: Option<NaiveDate>,
        priority: Priority,
    ) -> Result<bool, DatabaseError>;

    /// Set the external id and `Synced`, dropping the sync claim. False if
    /// the record already had an external id.
    async fn mark_task_synced(&self, id: Uuid, external_id: &str) -> Result<bool, DatabaseError>;

    /// Record a failed create attempt and drop the sync claim. `exhausted`
    /// stops further retries.
    async fn mark_task_sync_failed(
        &self,
        id: Uuid,
        reason: &str,
        exhausted: bool,
    ) -> Result<(), DatabaseError>;

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<bool, DatabaseError>;

    // ── Ledger, log, summaries ──────────────────────────────────────

    async fn record_llm_call(&self, call: &LlmCallRecord) -> Result<(), DatabaseError>;

    /// Spend recorded in `[start, end)`.
    async fn cost_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CostSummary, DatabaseError>;

    async fn append_processing_log(&self, entry: &ProcessingLogEntry) -> Result<(), DatabaseError>;

    /// Most recent entries first.
    async fn recent_processing_log(
        &self,
        limit: usize,
    ) -> Result<Vec<ProcessingLogEntry>, DatabaseError>;

    /// Insert or replace the summary for its day.
    async fn upsert_daily_summary(&self, summary: &DailySummary) -> Result<(), DatabaseError>;

    async fn get_daily_summary(&self, day: NaiveDate) -> Result<Option<DailySummary>, DatabaseError>;
}
