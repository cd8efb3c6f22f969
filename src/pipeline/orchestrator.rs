//! Pipeline orchestrator: drives items through their state machine.
//!
//! A cycle runs in four phases:
//! 1. Recover stale `Analyzing` claims left behind by a dead cycle.
//! 2. Claim and analyze a FIFO batch of `Unprocessed` items with bounded
//!    concurrency. Each successful result is committed together with its
//!    cost; that write is the commit point.
//! 3. Materialize qualifying candidates of every `Analyzed` item as task
//!    records and move the item to `TaskSyncing`.
//! 4. Push unsynced task records to the reconciler and finalize items whose
//!    records are all settled.
//!
//! Only storage errors abort a cycle. Collaborator failures are classified
//! and handled per item; quota and auth failures stop further calls to that
//! collaborator for the rest of the cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisEngine, AnalysisOutput};
use crate::config::PipelineConfig;
use crate::error::{
    AnalysisError, DatabaseError, FailureClass, PipelineError, ReconcilerError, SourceError,
};
use crate::llm::CallUsage;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::types::{
    AnalysisResult, CycleReport, FailedItem, IngestReport, Item, ItemContent, ItemFilter,
    ItemState, NewTaskRecord, ReanalysisOutcome, SyncReport, TaskRecord, TaskStatus,
    normalize_title,
};
use crate::reconciler::{RemoteStatus, TaskReconciler, TaskSpec};
use crate::source::{FetchFilter, SourceConnector};
use crate::store::{CallPurpose, Database, LlmCallRecord, ProcessingLogEntry};

/// SQLite reads a negative LIMIT as "no limit".
const NO_LIMIT: usize = i64::MAX as usize;

/// Set by any worker that hits a quota or auth failure. Other workers check
/// it before issuing their next call.
#[derive(Debug, Default)]
struct Halt {
    quota: AtomicBool,
    auth: AtomicBool,
}

impl Halt {
    fn is_set(&self) -> bool {
        self.quota.load(Ordering::SeqCst) || self.auth.load(Ordering::SeqCst)
    }

    /// Trip the halt for quota/auth classes. Returns false for other classes.
    fn trip(&self, class: FailureClass) -> bool {
        match class {
            FailureClass::QuotaExceeded => self.quota.store(true, Ordering::SeqCst),
            FailureClass::AuthExpired => self.auth.store(true, Ordering::SeqCst),
            FailureClass::Transient | FailureClass::Permanent => return false,
        }
        true
    }

    fn quota(&self) -> bool {
        self.quota.load(Ordering::SeqCst)
    }

    fn auth(&self) -> bool {
        self.auth.load(Ordering::SeqCst)
    }
}

/// Result of an analysis call after retries.
enum Attempt {
    Success(AnalysisOutput),
    Failed { error: AnalysisError, attempts: u32 },
    /// Another worker halted the cycle before the next retry.
    Halted,
}

/// What happened to one selected item in the analysis phase.
enum ItemOutcome {
    Analyzed,
    Failed(FailedItem),
    /// Claim returned to `Unprocessed` because the cycle halted.
    Released,
    /// Another worker owned the item.
    Skipped,
    /// Not claimed because the cycle had already halted.
    NotAttempted,
}

struct ItemRun {
    outcome: ItemOutcome,
    spent: CallUsage,
}

/// What happened to one task record in the sync phase.
enum RecordOutcome {
    Synced,
    Failed { exhausted: bool },
    /// Not attempted: already synced, or the run halted.
    Skipped,
}

/// Drives items from `Unprocessed` to `Done`.
pub struct Orchestrator {
    config: PipelineConfig,
    retry: RetryPolicy,
    store: Arc<dyn Database>,
    analyzer: Arc<dyn AnalysisEngine>,
    reconciler: Arc<dyn TaskReconciler>,
    source: Option<Arc<dyn SourceConnector>>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Database>,
        analyzer: Arc<dyn AnalysisEngine>,
        reconciler: Arc<dyn TaskReconciler>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            store,
            analyzer,
            reconciler,
            source: None,
        }
    }

    /// Attach the connector `ingest` pulls from.
    pub fn with_source(mut self, source: Arc<dyn SourceConnector>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Cycle ───────────────────────────────────────────────────────

    /// Run one processing cycle over up to `batch_limit` unprocessed items.
    pub async fn run_cycle(
        &self,
        batch_limit: usize,
        filter: &ItemFilter,
    ) -> Result<CycleReport, PipelineError> {
        let clock = Instant::now();
        let mut report = CycleReport::new(Utc::now());
        info!(run_id = %report.run_id, batch_limit, "Starting processing cycle");

        if let Err(e) = self.execute_cycle(batch_limit, filter, &mut report).await {
            error!(run_id = %report.run_id, error = %e, "Cycle aborted");
            self.log_run("cycle", "error", &e.to_string(), clock, 0, Decimal::ZERO)
                .await;
            return Err(e.into());
        }

        report.elapsed = clock.elapsed();
        let halted = report.quota_exhausted || report.auth_expired;
        let status = if report.failed.is_empty() && !halted {
            "success"
        } else {
            "partial"
        };
        let message = format!(
            "selected={} analyzed={} done={} failed={} tasks_created={} tasks_synced={}",
            report.selected,
            report.analyzed,
            report.done,
            report.failed_count(),
            report.tasks_created,
            report.tasks_synced,
        );
        self.log_run(
            "cycle",
            status,
            &message,
            clock,
            report.total_tokens,
            report.total_cost,
        )
        .await;

        info!(
            run_id = %report.run_id,
            selected = report.selected,
            analyzed = report.analyzed,
            done = report.done,
            failed = report.failed_count(),
            released = report.released,
            tasks_created = report.tasks_created,
            tasks_synced = report.tasks_synced,
            cost = %report.total_cost,
            elapsed_ms = report.elapsed.as_millis() as u64,
            quota_exhausted = report.quota_exhausted,
            auth_expired = report.auth_expired,
            "Cycle complete"
        );
        Ok(report)
    }

    async fn execute_cycle(
        &self,
        batch_limit: usize,
        filter: &ItemFilter,
        report: &mut CycleReport,
    ) -> Result<(), DatabaseError> {
        report.recovered_stale = self.recover_stale().await?;

        let batch = self
            .store
            .list_items_by_state(ItemState::Unprocessed, filter, batch_limit)
            .await?;
        report.selected = batch.len();
        debug!(run_id = %report.run_id, selected = batch.len(), "Batch selected");

        let halt = Halt::default();
        let runs: Vec<ItemRun> = stream::iter(batch)
            .map(|item| self.analyze_item(item, &halt))
            .buffer_unordered(self.config.analysis_workers.max(1))
            .try_collect()
            .await?;

        let mut spent = CallUsage::default();
        for run in runs {
            spent += run.spent;
            match run.outcome {
                ItemOutcome::Analyzed => report.analyzed += 1,
                ItemOutcome::Failed(failed) => report.failed.push(failed),
                ItemOutcome::Released => report.released += 1,
                ItemOutcome::Skipped => report.skipped_claimed += 1,
                ItemOutcome::NotAttempted => {}
            }
        }
        report.total_tokens = spent.total_tokens();
        report.total_cost = spent.cost;
        report.quota_exhausted = halt.quota();
        report.auth_expired = halt.auth();

        report.tasks_created = self.materialize_analyzed().await?;

        let sync_halt = Halt::default();
        let sync = self.sync_phase(&sync_halt).await?;
        report.tasks_synced = sync.synced;
        report.tasks_sync_failed = sync.failed;
        report.done = sync.items_finalized;
        report.quota_exhausted |= sync.quota_exhausted;
        report.auth_expired |= sync.auth_expired;
        Ok(())
    }

    /// Return `Analyzing` claims older than the staleness threshold to
    /// `Unprocessed`.
    pub async fn recover_stale(&self) -> Result<usize, DatabaseError> {
        self.store.release_stale_claims(self.stale_cutoff()).await
    }

    /// Claims taken before this instant are considered abandoned.
    fn stale_cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.stale_claim_threshold)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    // ── Analysis ────────────────────────────────────────────────────

    async fn analyze_item(&self, item: Item, halt: &Halt) -> Result<ItemRun, DatabaseError> {
        let id = item.id;
        if halt.is_set() {
            return Ok(ItemRun {
                outcome: ItemOutcome::NotAttempted,
                spent: CallUsage::default(),
            });
        }
        if !self.store.claim_item(id).await? {
            debug!(item_id = %id, "Item claimed elsewhere, skipping");
            return Ok(ItemRun {
                outcome: ItemOutcome::Skipped,
                spent: CallUsage::default(),
            });
        }
        debug!(item_id = %id, "Item claimed");

        let content = item.content();
        let mut spent = CallUsage::default();
        let attempt = self
            .analyze_with_retry(id, &content, CallPurpose::Analysis, Some(halt), &mut spent)
            .await?;

        let outcome = match attempt {
            Attempt::Success(output) => {
                if self
                    .store
                    .commit_analysis(id, &output.result, &output.usage)
                    .await?
                {
                    info!(
                        item_id = %id,
                        importance = output.result.importance_score,
                        candidates = output.result.candidates.len(),
                        cost = %output.usage.cost,
                        "Item analyzed"
                    );
                    ItemOutcome::Analyzed
                } else {
                    warn!(item_id = %id, "Claim lost before commit, result discarded");
                    ItemOutcome::Skipped
                }
            }
            Attempt::Halted => {
                self.store.release_item(id).await?;
                ItemOutcome::Released
            }
            Attempt::Failed { error, attempts } => {
                let class = error.classify();
                if halt.trip(class) {
                    warn!(item_id = %id, error = %error, "Analysis halted for this cycle");
                    self.store.release_item(id).await?;
                    ItemOutcome::Released
                } else {
                    let reason = match class {
                        FailureClass::Transient => {
                            format!("gave up after {attempts} attempts: {error}")
                        }
                        _ => error.to_string(),
                    };
                    self.store.fail_item(id, &reason).await?;
                    warn!(item_id = %id, reason = %reason, "Item failed");
                    ItemOutcome::Failed(FailedItem { item_id: id, reason })
                }
            }
        };
        Ok(ItemRun { outcome, spent })
    }

    /// Call the analysis engine, retrying transient failures with backoff.
    /// Every call that reports usage is written to the cost ledger.
    async fn analyze_with_retry(
        &self,
        item_id: Uuid,
        content: &ItemContent,
        purpose: CallPurpose,
        halt: Option<&Halt>,
        spent: &mut CallUsage,
    ) -> Result<Attempt, DatabaseError> {
        let mut attempt = 0u32;
        loop {
            if halt.is_some_and(Halt::is_set) {
                return Ok(Attempt::Halted);
            }

            let call = tokio::time::timeout(self.config.call_timeout, self.analyzer.analyze(content))
                .await
                .unwrap_or(Err(AnalysisError::Timeout));

            match call {
                Ok(output) => {
                    *spent += output.usage;
                    self.record_call(Some(item_id), purpose, output.usage, true)
                        .await?;
                    return Ok(Attempt::Success(output));
                }
                Err(error) => {
                    if let Some(usage) = error.usage() {
                        *spent += *usage;
                        self.record_call(Some(item_id), purpose, *usage, false)
                            .await?;
                    }
                    if error.classify() == FailureClass::Transient
                        && self.retry.should_retry(attempt)
                    {
                        let delay = self.retry.delay_for(attempt, error.retry_after());
                        warn!(
                            item_id = %item_id,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Transient analysis failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(Attempt::Failed {
                        error,
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }

    async fn record_call(
        &self,
        item_id: Option<Uuid>,
        purpose: CallPurpose,
        usage: CallUsage,
        succeeded: bool,
    ) -> Result<(), DatabaseError> {
        self.store
            .record_llm_call(&LlmCallRecord {
                id: Uuid::new_v4(),
                item_id,
                provider: self.analyzer.provider().to_string(),
                model: self.analyzer.model().to_string(),
                purpose,
                usage,
                succeeded,
                created_at: Utc::now(),
            })
            .await
    }

    // ── Task materialization ────────────────────────────────────────

    /// Materialize every `Analyzed` item, including ones a previous cycle
    /// committed but never got to.
    async fn materialize_analyzed(&self) -> Result<usize, DatabaseError> {
        let analyzed = self
            .store
            .list_items_by_state(ItemState::Analyzed, &ItemFilter::default(), NO_LIMIT)
            .await?;

        let mut created = 0;
        for item in analyzed {
            let tasks = item
                .analysis
                .as_ref()
                .map(|result| qualifying(result, self.config.confidence_threshold))
                .unwrap_or_default();
            match self.store.materialize_tasks(item.id, &tasks).await? {
                Some(count) => {
                    debug!(item_id = %item.id, tasks = count, "Task records materialized");
                    created += count;
                }
                None => debug!(item_id = %item.id, "Item moved on before materializing"),
            }
        }
        Ok(created)
    }

    // ── Task sync ───────────────────────────────────────────────────

    /// Retry every unsynced record, then sync remote completion state back.
    pub async fn sync_pending_tasks(&self) -> Result<SyncReport, PipelineError> {
        let clock = Instant::now();
        let halt = Halt::default();
        let mut report = match self.sync_phase(&halt).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Task sync aborted");
                self.log_run("sync", "error", &e.to_string(), clock, 0, Decimal::ZERO)
                    .await;
                return Err(e.into());
            }
        };

        if !halt.is_set() {
            self.mirror_remote_status(&mut report).await?;
        }

        let status = if report.failed == 0 && !report.quota_exhausted && !report.auth_expired {
            "success"
        } else {
            "partial"
        };
        let message = format!(
            "attempted={} synced={} failed={} finalized={} completed_remotely={}",
            report.attempted,
            report.synced,
            report.failed,
            report.items_finalized,
            report.completed_remotely,
        );
        self.log_run("sync", status, &message, clock, 0, Decimal::ZERO)
            .await;
        info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            finalized = report.items_finalized,
            "Task sync complete"
        );
        Ok(report)
    }

    /// Push unsynced records, grouped per item, then finalize settled items.
    async fn sync_phase(&self, halt: &Halt) -> Result<SyncReport, DatabaseError> {
        let unsynced = self.store.list_unsynced_tasks().await?;
        let mut groups: Vec<(Uuid, Vec<TaskRecord>)> = Vec::new();
        let mut index: HashMap<Uuid, usize> = HashMap::new();
        for record in unsynced {
            let slot = *index.entry(record.item_id).or_insert_with(|| {
                groups.push((record.item_id, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(record);
        }

        let outcomes: Vec<Vec<RecordOutcome>> = stream::iter(groups)
            .map(|(_, records)| self.sync_records(records, halt))
            .buffer_unordered(self.config.sync_workers.max(1))
            .try_collect()
            .await?;

        let mut report = SyncReport::default();
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                RecordOutcome::Synced => {
                    report.attempted += 1;
                    report.synced += 1;
                }
                RecordOutcome::Failed { exhausted } => {
                    report.attempted += 1;
                    report.failed += 1;
                    if exhausted {
                        report.exhausted += 1;
                    }
                }
                RecordOutcome::Skipped => {}
            }
        }
        report.quota_exhausted = halt.quota();
        report.auth_expired = halt.auth();
        report.items_finalized = self.finalize_syncing().await?;
        Ok(report)
    }

    async fn sync_records(
        &self,
        records: Vec<TaskRecord>,
        halt: &Halt,
    ) -> Result<Vec<RecordOutcome>, DatabaseError> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.sync_record(&record, halt).await?);
        }
        Ok(outcomes)
    }

    async fn sync_record(
        &self,
        record: &TaskRecord,
        halt: &Halt,
    ) -> Result<RecordOutcome, DatabaseError> {
        // Never create for a record that already holds a remote id.
        if !record.needs_sync() || halt.is_set() {
            return Ok(RecordOutcome::Skipped);
        }
        if !self.store.claim_task_sync(record.id, self.stale_cutoff()).await? {
            debug!(task_id = %record.id, "Task sync claimed elsewhere, skipping");
            return Ok(RecordOutcome::Skipped);
        }
        // The listing may predate another worker's attempt.
        let record = match self.store.get_task(record.id).await? {
            Some(fresh) if fresh.needs_sync() => fresh,
            _ => {
                self.store.release_task_sync(record.id).await?;
                return Ok(RecordOutcome::Skipped);
            }
        };

        let spec = TaskSpec::from(&record);
        let call = tokio::time::timeout(
            self.config.call_timeout,
            self.reconciler.create_task(&record.idempotency_key, &spec),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ReconcilerError::Transient {
                reason: format!("timed out after {:?}", self.config.call_timeout),
            })
        });

        match call {
            Ok(external_id) => {
                if self.store.mark_task_synced(record.id, &external_id).await? {
                    info!(
                        task_id = %record.id,
                        item_id = %record.item_id,
                        external_id = %external_id,
                        "Task synced"
                    );
                }
                Ok(RecordOutcome::Synced)
            }
            Err(error) => {
                let class = error.classify();
                if halt.trip(class) {
                    warn!(task_id = %record.id, error = %error, "Task sync halted for this run");
                    self.store.release_task_sync(record.id).await?;
                    return Ok(RecordOutcome::Skipped);
                }
                let attempts = record.sync_attempts + 1;
                let exhausted = class == FailureClass::Permanent
                    || attempts >= self.config.max_sync_attempts;
                self.store
                    .mark_task_sync_failed(record.id, &error.to_string(), exhausted)
                    .await?;
                warn!(
                    task_id = %record.id,
                    item_id = %record.item_id,
                    attempt = attempts,
                    exhausted,
                    error = %error,
                    "Task sync failed"
                );
                Ok(RecordOutcome::Failed { exhausted })
            }
        }
    }

    async fn finalize_syncing(&self) -> Result<usize, DatabaseError> {
        let syncing = self
            .store
            .list_items_by_state(ItemState::TaskSyncing, &ItemFilter::default(), NO_LIMIT)
            .await?;
        let mut finalized = 0;
        for item in syncing {
            if self.store.finalize_item(item.id).await? {
                debug!(item_id = %item.id, "Item done");
                finalized += 1;
            }
        }
        Ok(finalized)
    }

    /// Mirror remote completion onto synced local records.
    async fn mirror_remote_status(&self, report: &mut SyncReport) -> Result<(), DatabaseError> {
        let list_id = self.reconciler.default_list_id().to_string();
        let listed = tokio::time::timeout(self.config.call_timeout, self.reconciler.list_tasks(&list_id))
            .await
            .unwrap_or_else(|_| {
                Err(ReconcilerError::Transient {
                    reason: "list timed out".to_string(),
                })
            });
        let remote = match listed {
            Ok(remote) => remote,
            Err(error) => {
                match error.classify() {
                    FailureClass::QuotaExceeded => report.quota_exhausted = true,
                    FailureClass::AuthExpired => report.auth_expired = true,
                    _ => {}
                }
                warn!(error = %error, "Could not list remote tasks, skipping status mirror");
                return Ok(());
            }
        };

        let remote: HashMap<String, RemoteStatus> = remote
            .into_iter()
            .map(|task| (task.external_id, task.status))
            .collect();

        for record in self.store.list_synced_tasks().await? {
            let Some(external_id) = record.external_id.as_deref() else {
                continue;
            };
            match (remote.get(external_id), record.status) {
                (Some(RemoteStatus::Completed), TaskStatus::Pending) => {
                    self.store
                        .set_task_status(record.id, TaskStatus::Completed)
                        .await?;
                    debug!(task_id = %record.id, "Completed remotely");
                    report.completed_remotely += 1;
                }
                (Some(RemoteStatus::NeedsAction), TaskStatus::Completed) => {
                    self.store
                        .set_task_status(record.id, TaskStatus::Pending)
                        .await?;
                    debug!(task_id = %record.id, "Reopened remotely");
                    report.reopened_remotely += 1;
                }
                (None, _) => {
                    warn!(task_id = %record.id, external_id, "Synced task missing remotely");
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Ingest, re-analysis, completion ─────────────────────────────

    /// Fetch new items from the source and store the unknown ones.
    pub async fn ingest(
        &self,
        filter: &FetchFilter,
        max_count: usize,
    ) -> Result<IngestReport, PipelineError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| PipelineError::NotConfigured("source connector".to_string()))?;

        let fetched = tokio::time::timeout(self.config.call_timeout, source.fetch_new(filter, max_count))
            .await
            .map_err(|_| SourceError::Timeout {
                name: source.name().to_string(),
                timeout: self.config.call_timeout,
            })??;

        let mut report = IngestReport {
            fetched: fetched.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for raw in &fetched {
            if !seen.insert(raw.external_id.as_str()) {
                report.duplicates += 1;
                continue;
            }
            match self.store.insert_item(raw).await? {
                Some(_) => report.inserted += 1,
                None => report.duplicates += 1,
            }
        }
        info!(
            source = source.name(),
            fetched = report.fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "Ingest complete"
        );
        Ok(report)
    }

    /// Analyze an item again and overwrite its stored result.
    ///
    /// Identical results leave the item untouched. Otherwise the old result
    /// is archived, the version bumps, and only candidates whose title is not
    /// already tracked become new task records.
    pub async fn reanalyze(&self, item_id: Uuid) -> Result<ReanalysisOutcome, PipelineError> {
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "item".to_string(),
                id: item_id.to_string(),
            })?;
        if !item.state.allows_reanalysis() {
            return Err(PipelineError::InvalidState {
                id: item_id,
                state: item.state.to_string(),
                operation: "re-analyze".to_string(),
            });
        }

        let mut spent = CallUsage::default();
        let output = match self
            .analyze_with_retry(item_id, &item.content(), CallPurpose::Reanalysis, None, &mut spent)
            .await?
        {
            Attempt::Success(output) => output,
            Attempt::Failed { error, .. } => return Err(error.into()),
            Attempt::Halted => {
                return Err(PipelineError::Conflict { id: item_id });
            }
        };

        if item
            .analysis
            .as_ref()
            .is_some_and(|previous| previous.fingerprint() == output.result.fingerprint())
        {
            info!(item_id = %item_id, "Re-analysis unchanged");
            return Ok(ReanalysisOutcome::Unchanged);
        }

        let existing = self.store.list_tasks_for_item(item_id).await?;
        let by_title: HashMap<String, &TaskRecord> = existing
            .iter()
            .map(|t| (normalize_title(&t.title), t))
            .collect();
        let mut known: HashSet<String> = by_title.keys().cloned().collect();
        let mut next_index = existing
            .iter()
            .map(|t| t.candidate_index + 1)
            .max()
            .unwrap_or(0);
        let mut tasks = Vec::new();
        let mut revisions: Vec<(TaskRecord, TaskSpec)> = Vec::new();
        for candidate in qualifying(&output.result, self.config.confidence_threshold) {
            let title = normalize_title(&candidate.candidate.title);
            if let Some(record) = by_title.get(&title) {
                let c = &candidate.candidate;
                if (record.due_date != c.due_date || record.priority != c.priority)
                    && !revisions.iter().any(|(r, _)| r.id == record.id)
                {
                    let mut spec = TaskSpec::from(*record);
                    spec.due = c.due_date;
                    spec.priority = c.priority;
                    revisions.push(((*record).clone(), spec));
                }
                continue;
            }
            if !known.insert(title) {
                continue;
            }
            tasks.push(NewTaskRecord {
                candidate_index: next_index,
                candidate: candidate.candidate,
            });
            next_index += 1;
        }

        let applied = self
            .store
            .apply_reanalysis(
                item_id,
                item.analysis_version,
                &output.result,
                &output.usage,
                &tasks,
            )
            .await?;
        if !applied {
            return Err(PipelineError::Conflict { id: item_id });
        }
        let version = item.analysis_version + 1;
        info!(item_id = %item_id, version, new_tasks = tasks.len(), "Item re-analyzed");

        let mut revised = 0;
        for (record, spec) in &revisions {
            if self.revise_task(record, spec).await? {
                revised += 1;
            }
        }

        let pending: Vec<TaskRecord> = self
            .store
            .list_tasks_for_item(item_id)
            .await?
            .into_iter()
            .filter(TaskRecord::needs_sync)
            .collect();
        self.sync_records(pending, &Halt::default()).await?;
        self.store.finalize_item(item_id).await?;

        Ok(ReanalysisOutcome::Updated {
            version,
            new_tasks: tasks.len(),
            revised_tasks: revised,
        })
    }

    /// Push a changed due date or priority to the remote task, then store
    /// it. Unsynced records are only updated locally; their eventual create
    /// carries the new values. A remote failure leaves both sides as they
    /// were.
    async fn revise_task(
        &self,
        record: &TaskRecord,
        spec: &TaskSpec,
    ) -> Result<bool, DatabaseError> {
        if let Some(external_id) = record.external_id.as_deref() {
            let call = tokio::time::timeout(
                self.config.call_timeout,
                self.reconciler.update_task(external_id, &record.idempotency_key, spec),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ReconcilerError::Transient {
                    reason: format!("timed out after {:?}", self.config.call_timeout),
                })
            });
            if let Err(error) = call {
                warn!(
                    task_id = %record.id,
                    external_id,
                    error = %error,
                    "Remote task update failed"
                );
                return Ok(false);
            }
        }
        let updated = self
            .store
            .update_task_details(record.id, spec.due, spec.priority)
            .await?;
        if updated {
            info!(
                task_id = %record.id,
                due = ?spec.due,
                priority = spec.priority.as_str(),
                "Task revised"
            );
        }
        Ok(updated)
    }

    /// Complete a synced task remotely, then locally.
    pub async fn complete_task(&self, task_id: Uuid) -> Result<TaskRecord, PipelineError> {
        let record = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            })?;
        let Some(external_id) = record.external_id.as_deref() else {
            return Err(PipelineError::InvalidState {
                id: task_id,
                state: record.sync_state.as_str().to_string(),
                operation: "complete an unsynced task".to_string(),
            });
        };

        tokio::time::timeout(self.config.call_timeout, self.reconciler.complete_task(external_id))
            .await
            .unwrap_or_else(|_| {
                Err(ReconcilerError::Transient {
                    reason: "complete timed out".to_string(),
                })
            })?;

        self.store
            .set_task_status(task_id, TaskStatus::Completed)
            .await?;
        info!(task_id = %task_id, external_id, "Task completed");

        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            })
    }

    async fn log_run(
        &self,
        operation: &str,
        status: &str,
        message: &str,
        clock: Instant,
        tokens_used: u64,
        cost: Decimal,
    ) {
        let entry = ProcessingLogEntry {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            status: status.to_string(),
            message: message.to_string(),
            duration_ms: clock.elapsed().as_millis() as u64,
            tokens_used,
            cost,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_processing_log(&entry).await {
            warn!(operation, error = %e, "Failed to write processing log");
        }
    }
}

/// Candidates at or above `threshold`, keyed by their position in the
/// analysis result.
fn qualifying(result: &AnalysisResult, threshold: f64) -> Vec<NewTaskRecord> {
    result
        .candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.confidence >= threshold)
        .map(|(index, c)| NewTaskRecord {
            candidate_index: index as u32,
            candidate: c.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Priority, Sentiment, TaskCandidate};

    #[test]
    fn halt_only_trips_on_quota_and_auth() {
        let halt = Halt::default();
        assert!(!halt.trip(FailureClass::Transient));
        assert!(!halt.trip(FailureClass::Permanent));
        assert!(!halt.is_set());
        assert!(halt.trip(FailureClass::QuotaExceeded));
        assert!(halt.is_set());
        assert!(halt.quota());
        assert!(!halt.auth());
    }

    #[test]
    fn qualifying_keeps_original_indices() {
        let candidate = |title: &str, confidence: f64| TaskCandidate {
            title: title.to_string(),
            description: None,
            due_date: None,
            priority: Priority::Medium,
            confidence,
        };
        let result = AnalysisResult {
            importance_score: 0.5,
            sentiment: Sentiment::Neutral,
            summary: "s".into(),
            candidates: vec![
                candidate("low", 0.5),
                candidate("exact", 0.8),
                candidate("high", 0.95),
            ],
        };

        let kept: Vec<(u32, String)> = qualifying(&result, 0.8)
            .into_iter()
            .map(|t| (t.candidate_index, t.candidate.title))
            .collect();
        assert_eq!(kept, vec![(1, "exact".to_string()), (2, "high".to_string())]);
        assert!(qualifying(&result, 0.99).is_empty());
    }
}
