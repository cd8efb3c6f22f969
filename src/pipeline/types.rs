//! Pipeline domain types: items, analysis results, task records, reports.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every idempotency key handed to a reconciler.
pub const IDEMPOTENCY_PREFIX: &str = "email-agent";

/// Idempotency key for the candidate at `candidate_index` of an item.
///
/// Stable across retries, restarts and re-runs: it depends only on the
/// item's internal id and the candidate's position.
pub fn idempotency_key(item_id: Uuid, candidate_index: u32) -> String {
    format!("{IDEMPOTENCY_PREFIX}:{item_id}:{candidate_index}")
}

/// Lifecycle state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting to be claimed by a cycle.
    Unprocessed,
    /// Claimed by a worker; an analysis call is in flight.
    Analyzing,
    /// Analysis committed; task records not yet materialized.
    Analyzed,
    /// Task records exist and are being pushed to the reconciler.
    TaskSyncing,
    /// Every task record is synced or has exhausted its attempts.
    Done,
    /// Analysis failed permanently. The reason lives on the item.
    Failed,
}

impl ItemState {
    /// Every state change the store performs, and nothing else.
    pub fn can_transition_to(&self, target: ItemState) -> bool {
        use ItemState::*;

        matches!(
            (self, target),
            (Unprocessed, Analyzing) |
            // Claim released on halt or stale recovery
            (Analyzing, Unprocessed) |
            (Analyzing, Analyzed) |
            (Analyzing, Failed) |
            (Analyzed, TaskSyncing) |
            (TaskSyncing, Done) |
            // Re-analysis
            (TaskSyncing, TaskSyncing) | (Done, TaskSyncing) | (Failed, TaskSyncing)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// States from which a manual re-analysis may start. Re-analysis ends
    /// in `TaskSyncing`.
    pub fn allows_reanalysis(&self) -> bool {
        self.can_transition_to(Self::TaskSyncing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
            Self::TaskSyncing => "task_syncing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub const ALL: [ItemState; 6] = [
        Self::Unprocessed,
        Self::Analyzing,
        Self::Analyzed,
        Self::TaskSyncing,
        Self::Done,
        Self::Failed,
    ];
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown item state: {s}"))
    }
}

/// Overall tone of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
    Urgent,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "neutral" => Ok(Self::Neutral),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown sentiment: {other}")),
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn is_high(&self) -> bool {
        matches!(self, Self::High | Self::Urgent)
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A task proposed by analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCandidate {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    /// Always within [0, 1].
    pub confidence: f64,
}

/// Validated output of one analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Always within [0, 1].
    pub importance_score: f64,
    pub sentiment: Sentiment,
    pub summary: String,
    pub candidates: Vec<TaskCandidate>,
}

impl AnalysisResult {
    /// Canonical serialization used to detect byte-identical re-analyses.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The fields of an item an analysis engine reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemContent {
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// One ingested message.
#[derive(Debug, Clone)]
pub struct Item {
    pub id: Uuid,
    /// Source-assigned id, unique across items.
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub state: ItemState,
    /// Set exactly when `state` is `Failed`.
    pub failure_reason: Option<String>,
    pub analysis: Option<AnalysisResult>,
    /// Bumped each time a re-analysis overwrites the stored result.
    pub analysis_version: u32,
    pub tokens_used: u64,
    pub cost: Decimal,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn content(&self) -> ItemContent {
        ItemContent {
            sender: self.sender.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            received_at: self.received_at,
        }
    }
}

/// Selection filter for a cycle. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Case-insensitive substring match on the sender.
    pub sender: Option<String>,
    pub received_after: Option<DateTime<Utc>>,
    pub received_before: Option<DateTime<Utc>>,
}

/// Status of a task on the task list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Sync state of a task record against the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Pending,
    Synced,
    /// Last attempt failed. The reason lives on the record.
    SyncFailed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::SyncFailed => "sync_failed",
        }
    }
}

impl std::str::FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "sync_failed" => Ok(Self::SyncFailed),
            other => Err(format!("unknown sync state: {other}")),
        }
    }
}

/// A task record about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskRecord {
    pub candidate_index: u32,
    pub candidate: TaskCandidate,
}

/// A materialized task owned by an item.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub item_id: Uuid,
    pub candidate_index: u32,
    pub idempotency_key: String,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub confidence: f64,
    pub status: TaskStatus,
    /// Non-null exactly when `sync_state` is `Synced`.
    pub external_id: Option<String>,
    pub sync_state: SyncState,
    pub sync_error: Option<String>,
    pub sync_attempts: u32,
    /// No further create attempts will be made.
    pub sync_exhausted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Synced, or given up on. Either way the owning item may finish.
    pub fn is_settled(&self) -> bool {
        self.sync_state == SyncState::Synced || self.sync_exhausted
    }

    pub fn needs_sync(&self) -> bool {
        self.external_id.is_none() && !self.sync_exhausted
    }
}

/// An item that ended a cycle in `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct FailedItem {
    pub item_id: Uuid,
    pub reason: String,
}

/// Outcome of one processing cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Unprocessed items selected by the batch query.
    pub selected: usize,
    /// Stale Analyzing claims returned to Unprocessed before selection.
    pub recovered_stale: usize,
    /// Selected items another worker claimed first.
    pub skipped_claimed: usize,
    /// Claims returned to Unprocessed because the cycle halted.
    pub released: usize,
    pub analyzed: usize,
    pub done: usize,
    pub failed: Vec<FailedItem>,
    pub tasks_created: usize,
    pub tasks_synced: usize,
    pub tasks_sync_failed: usize,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub quota_exhausted: bool,
    pub auth_expired: bool,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            elapsed: Duration::ZERO,
            selected: 0,
            recovered_stale: 0,
            skipped_claimed: 0,
            released: 0,
            analyzed: 0,
            done: 0,
            failed: Vec::new(),
            tasks_created: 0,
            tasks_synced: 0,
            tasks_sync_failed: 0,
            total_tokens: 0,
            total_cost: Decimal::ZERO,
            quota_exhausted: false,
            auth_expired: false,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Outcome of a standalone sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Records that hit their attempt ceiling during this pass.
    pub exhausted: usize,
    pub items_finalized: usize,
    pub completed_remotely: usize,
    pub reopened_remotely: usize,
    pub quota_exhausted: bool,
    pub auth_expired: bool,
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

/// Outcome of a manual re-analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReanalysisOutcome {
    /// The new result is identical to the stored one.
    Unchanged,
    /// The stored result was replaced. `revised_tasks` counts existing
    /// records whose due date or priority changed.
    Updated {
        version: u32,
        new_tasks: usize,
        revised_tasks: usize,
    },
}

/// Normalized form used to match task titles across analyses.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_stable() {
        let id = Uuid::parse_str("6f1c5a3e-2b1d-4c9a-9e7f-0a1b2c3d4e5f").unwrap();
        assert_eq!(
            idempotency_key(id, 0),
            "email-agent:6f1c5a3e-2b1d-4c9a-9e7f-0a1b2c3d4e5f:0"
        );
        assert_eq!(idempotency_key(id, 3), idempotency_key(id, 3));
        assert_ne!(idempotency_key(id, 0), idempotency_key(id, 1));
    }

    #[test]
    fn transitions_match_store_updates() {
        use ItemState::*;
        let allowed = [
            (Unprocessed, Analyzing),
            (Analyzing, Unprocessed),
            (Analyzing, Analyzed),
            (Analyzing, Failed),
            (Analyzed, TaskSyncing),
            (TaskSyncing, Done),
            (TaskSyncing, TaskSyncing),
            (Done, TaskSyncing),
            (Failed, TaskSyncing),
        ];
        for from in ItemState::ALL {
            for to in ItemState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn reanalysis_needs_a_settled_analysis() {
        use ItemState::*;
        let starts: Vec<ItemState> = ItemState::ALL
            .into_iter()
            .filter(ItemState::allows_reanalysis)
            .collect();
        assert_eq!(starts, vec![Analyzed, TaskSyncing, Done, Failed]);
    }

    #[test]
    fn terminal_states() {
        assert!(ItemState::Done.is_terminal());
        assert!(ItemState::Failed.is_terminal());
        assert!(!ItemState::TaskSyncing.is_terminal());
        assert!(!ItemState::Unprocessed.allows_reanalysis());
        assert!(!ItemState::Analyzing.allows_reanalysis());
        assert!(ItemState::Done.allows_reanalysis());
    }

    #[test]
    fn state_string_roundtrip() {
        for state in ItemState::ALL {
            assert_eq!(state.as_str().parse::<ItemState>().unwrap(), state);
        }
        assert!("bogus".parse::<ItemState>().is_err());
    }

    #[test]
    fn parse_enums_case_insensitive() {
        assert_eq!("URGENT".parse::<Sentiment>().unwrap(), Sentiment::Urgent);
        assert_eq!(" High ".parse::<Priority>().unwrap(), Priority::High);
        assert!("angry".parse::<Sentiment>().is_err());
    }

    #[test]
    fn fingerprint_ignores_nothing() {
        let a = AnalysisResult {
            importance_score: 0.5,
            sentiment: Sentiment::Neutral,
            summary: "Weekly sync notes".into(),
            candidates: vec![],
        };
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.summary.push('.');
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn title_normalization() {
        assert_eq!(normalize_title("  Pay   Invoice #123 "), "pay invoice #123");
    }
}
