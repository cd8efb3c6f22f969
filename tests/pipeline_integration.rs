//! End-to-end tests for the processing pipeline.
//!
//! Every test runs the real orchestrator against an in-memory libSQL store,
//! with a scripted analysis engine and an in-process task service standing
//! in for the network.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use email_agent::analysis::{AnalysisEngine, AnalysisOutput};
use email_agent::config::PipelineConfig;
use email_agent::error::{AnalysisError, PipelineError, ReconcilerError, SourceError};
use email_agent::llm::CallUsage;
use email_agent::pipeline::types::{
    AnalysisResult, Item, ItemContent, ItemFilter, ItemState, Priority, ReanalysisOutcome,
    Sentiment, SyncState, TaskCandidate, TaskStatus, idempotency_key,
};
use email_agent::pipeline::{Orchestrator, RetryPolicy};
use email_agent::reconciler::{RemoteStatus, RemoteTask, TaskReconciler, TaskSpec};
use email_agent::source::{FetchFilter, RawItem, SourceConnector};
use email_agent::store::{Database, LibSqlBackend};
use email_agent::summary::Aggregator;

const CALL_COST: Decimal = dec!(0.0015);

// ── Fakes ───────────────────────────────────────────────────────────

/// One scripted answer from the analysis engine.
enum Step {
    Answer(AnalysisResult),
    Unavailable,
    Quota,
    Malformed,
}

/// Analysis engine that answers per subject from a script. Subjects with
/// an empty script get a neutral result with no candidates.
#[derive(Default)]
struct ScriptedAnalyzer {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    fn script(&self, subject: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(subject.to_string(), steps.into());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn usage() -> CallUsage {
    CallUsage {
        input_tokens: 100,
        output_tokens: 50,
        cost: CALL_COST,
    }
}

#[async_trait]
impl AnalysisEngine for ScriptedAnalyzer {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn analyze(&self, content: &ItemContent) -> Result<AnalysisOutput, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&content.subject)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Answer(result)) => Ok(AnalysisOutput {
                result,
                usage: usage(),
            }),
            Some(Step::Unavailable) => Err(AnalysisError::Unavailable {
                reason: "503 from model".into(),
            }),
            Some(Step::Quota) => Err(AnalysisError::QuotaExceeded {
                reason: "monthly budget spent".into(),
            }),
            Some(Step::Malformed) => Err(AnalysisError::InvalidContent {
                reason: "missing field `summary`".into(),
                usage: Some(usage()),
            }),
            None => Ok(AnalysisOutput {
                result: result(0.4, vec![]),
                usage: usage(),
            }),
        }
    }

    async fn digest(&self, _prompt: &str) -> Result<(String, CallUsage), AnalysisError> {
        Ok(("A quiet day.".to_string(), usage()))
    }

    async fn health_check(&self) -> Result<(), AnalysisError> {
        Ok(())
    }
}

/// In-process task list that honours idempotency keys.
#[derive(Default)]
struct FakeReconciler {
    by_key: Mutex<HashMap<String, String>>,
    status: Mutex<HashMap<String, RemoteStatus>>,
    keys_seen: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ReconcilerError>>,
    creates: AtomicUsize,
    updates: Mutex<Vec<(String, TaskSpec)>>,
}

impl FakeReconciler {
    fn fail_next(&self, error: ReconcilerError) {
        self.failures.lock().unwrap().push_back(error);
    }

    fn remote_count(&self) -> usize {
        self.by_key.lock().unwrap().len()
    }

    fn set_status(&self, external_id: &str, status: RemoteStatus) {
        self.status
            .lock()
            .unwrap()
            .insert(external_id.to_string(), status);
    }
}

#[async_trait]
impl TaskReconciler for FakeReconciler {
    fn name(&self) -> &str {
        "fake"
    }

    fn default_list_id(&self) -> &str {
        "inbox"
    }

    async fn create_task(&self, key: &str, _spec: &TaskSpec) -> Result<String, ReconcilerError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.keys_seen.lock().unwrap().push(key.to_string());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut by_key = self.by_key.lock().unwrap();
        let next = by_key.len() + 1;
        let external_id = by_key
            .entry(key.to_string())
            .or_insert_with(|| format!("remote-{next}"))
            .clone();
        self.status
            .lock()
            .unwrap()
            .entry(external_id.clone())
            .or_insert(RemoteStatus::NeedsAction);
        Ok(external_id)
    }

    async fn update_task(
        &self,
        external_id: &str,
        _key: &str,
        spec: &TaskSpec,
    ) -> Result<(), ReconcilerError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.updates
            .lock()
            .unwrap()
            .push((external_id.to_string(), spec.clone()));
        Ok(())
    }

    async fn complete_task(&self, external_id: &str) -> Result<(), ReconcilerError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.set_status(external_id, RemoteStatus::Completed);
        Ok(())
    }

    async fn list_tasks(&self, _list_id: &str) -> Result<Vec<RemoteTask>, ReconcilerError> {
        let by_key = self.by_key.lock().unwrap();
        let status = self.status.lock().unwrap();
        Ok(by_key
            .iter()
            .map(|(key, external_id)| RemoteTask {
                external_id: external_id.clone(),
                title: String::new(),
                status: status
                    .get(external_id)
                    .copied()
                    .unwrap_or(RemoteStatus::NeedsAction),
                idempotency_key: Some(key.clone()),
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), ReconcilerError> {
        Ok(())
    }
}

/// Task service without server-side dedupe: `create_task` lists, waits,
/// then inserts, so two overlapping creates for one key both insert.
#[derive(Default)]
struct ListThenInsertReconciler {
    tasks: Mutex<Vec<(String, String)>>,
    failures: Mutex<VecDeque<ReconcilerError>>,
}

impl ListThenInsertReconciler {
    fn count_for(&self, key: &str) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .count()
    }
}

#[async_trait]
impl TaskReconciler for ListThenInsertReconciler {
    fn name(&self) -> &str {
        "list-then-insert"
    }

    fn default_list_id(&self) -> &str {
        "inbox"
    }

    async fn create_task(&self, key: &str, _spec: &TaskSpec) -> Result<String, ReconcilerError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let existing = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, id)| id.clone());
        if let Some(id) = existing {
            return Ok(id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut tasks = self.tasks.lock().unwrap();
        let id = format!("remote-{}", tasks.len() + 1);
        tasks.push((key.to_string(), id.clone()));
        Ok(id)
    }

    async fn update_task(
        &self,
        _external_id: &str,
        _key: &str,
        _spec: &TaskSpec,
    ) -> Result<(), ReconcilerError> {
        Ok(())
    }

    async fn complete_task(&self, _external_id: &str) -> Result<(), ReconcilerError> {
        Ok(())
    }

    async fn list_tasks(&self, _list_id: &str) -> Result<Vec<RemoteTask>, ReconcilerError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .map(|(key, id)| RemoteTask {
                external_id: id.clone(),
                title: String::new(),
                status: RemoteStatus::NeedsAction,
                idempotency_key: Some(key.clone()),
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), ReconcilerError> {
        Ok(())
    }
}

/// Mailbox that hands out a fixed batch.
struct FixedSource(Vec<RawItem>);

#[async_trait]
impl SourceConnector for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch_new(
        &self,
        _filter: &FetchFilter,
        max_count: usize,
    ) -> Result<Vec<RawItem>, SourceError> {
        Ok(self.0.iter().take(max_count).cloned().collect())
    }

    async fn health_check(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn candidate(title: &str, confidence: f64, priority: Priority) -> TaskCandidate {
    TaskCandidate {
        title: title.to_string(),
        description: None,
        due_date: None,
        priority,
        confidence,
    }
}

fn result(importance: f64, candidates: Vec<TaskCandidate>) -> AnalysisResult {
    AnalysisResult {
        importance_score: importance,
        sentiment: Sentiment::Neutral,
        summary: "Routine message".to_string(),
        candidates,
    }
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()
}

fn at_minute(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 14, 9, minute, 0).unwrap()
}

fn raw(external_id: &str, subject: &str, minute: u32) -> RawItem {
    RawItem {
        external_id: external_id.to_string(),
        sender: "billing@vendor.com".to_string(),
        subject: subject.to_string(),
        body: format!("Body of {subject}"),
        received_at: at_minute(minute),
    }
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_fraction: 0.0,
    }
}

struct Harness {
    store: Arc<LibSqlBackend>,
    analyzer: Arc<ScriptedAnalyzer>,
    reconciler: Arc<FakeReconciler>,
    orchestrator: Orchestrator,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(PipelineConfig::default(), fast_retry(3)).await
    }

    async fn with_config(config: PipelineConfig, retry: RetryPolicy) -> Self {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let analyzer = Arc::new(ScriptedAnalyzer::default());
        let reconciler = Arc::new(FakeReconciler::default());
        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            analyzer.clone(),
            reconciler.clone(),
        )
        .with_retry_policy(retry);
        Self {
            store,
            analyzer,
            reconciler,
            orchestrator,
        }
    }

    async fn seed(&self, external_id: &str, subject: &str, minute: u32) -> Uuid {
        self.store
            .insert_item(&raw(external_id, subject, minute))
            .await
            .unwrap()
            .unwrap()
    }

    async fn item(&self, id: Uuid) -> Item {
        self.store.get_item(id).await.unwrap().unwrap()
    }

    async fn all_items(&self) -> Vec<Item> {
        let mut items = Vec::new();
        for state in ItemState::ALL {
            items.extend(
                self.store
                    .list_items_by_state(state, &ItemFilter::default(), 1000)
                    .await
                    .unwrap(),
            );
        }
        items
    }

    async fn cycle(&self) -> email_agent::pipeline::CycleReport {
        self.orchestrator
            .run_cycle(50, &ItemFilter::default())
            .await
            .unwrap()
    }
}

/// A non-zero cost always comes with a committed analysis.
fn assert_cost_only_with_result(items: &[Item]) {
    for item in items {
        if item.cost > Decimal::ZERO {
            assert!(item.analysis.is_some(), "item {} has cost but no result", item.id);
        }
        if item.state == ItemState::Failed {
            assert_eq!(item.cost, Decimal::ZERO);
            assert!(item.failure_reason.is_some());
        }
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn invoice_becomes_one_synced_task() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Invoice #123 due Friday",
        vec![Step::Answer(result(
            0.8,
            vec![candidate("Pay invoice #123", 0.9, Priority::High)],
        ))],
    );
    let id = h.seed("m-1", "Invoice #123 due Friday", 0).await;

    let report = h.cycle().await;
    assert_eq!(report.selected, 1);
    assert_eq!(report.analyzed, 1);
    assert_eq!(report.tasks_created, 1);
    assert_eq!(report.tasks_synced, 1);
    assert_eq!(report.done, 1);
    assert_eq!(report.total_cost, CALL_COST);

    let item = h.item(id).await;
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(item.cost, CALL_COST);
    assert_eq!(item.analysis.unwrap().summary, "Routine message");

    let tasks = h.store.list_tasks_for_item(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Pay invoice #123");
    assert_eq!(tasks[0].priority, Priority::High);
    assert_eq!(tasks[0].sync_state, SyncState::Synced);
    assert_eq!(tasks[0].external_id.as_deref(), Some("remote-1"));
    assert_eq!(tasks[0].idempotency_key, idempotency_key(id, 0));
    assert_eq!(h.reconciler.remote_count(), 1);
}

#[tokio::test]
async fn low_confidence_candidates_create_nothing() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Lunch maybe?",
        vec![Step::Answer(result(
            0.2,
            vec![candidate("Maybe grab lunch", 0.3, Priority::Low)],
        ))],
    );
    let id = h.seed("m-1", "Lunch maybe?", 0).await;

    let report = h.cycle().await;
    assert_eq!(report.tasks_created, 0);
    assert_eq!(report.done, 1);
    assert_eq!(h.item(id).await.state, ItemState::Done);
    assert!(h.store.list_tasks_for_item(id).await.unwrap().is_empty());
    assert_eq!(h.reconciler.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rerunning_a_cycle_changes_nothing() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Contract renewal",
        vec![Step::Answer(result(
            0.9,
            vec![
                candidate("Review contract", 0.95, Priority::High),
                candidate("Sign renewal", 0.85, Priority::Medium),
            ],
        ))],
    );
    let id = h.seed("m-1", "Contract renewal", 0).await;
    h.seed("m-2", "Newsletter", 1).await;

    h.cycle().await;
    let cost_before = h.item(id).await.cost;
    let creates_before = h.reconciler.creates.load(Ordering::SeqCst);

    let second = h.cycle().await;
    assert_eq!(second.selected, 0);
    assert_eq!(second.tasks_created, 0);
    assert_eq!(second.total_cost, Decimal::ZERO);
    assert_eq!(h.analyzer.calls(), 2);
    assert_eq!(h.reconciler.creates.load(Ordering::SeqCst), creates_before);
    assert_eq!(h.reconciler.remote_count(), 2);
    assert_eq!(h.item(id).await.cost, cost_before);
}

#[tokio::test]
async fn transient_failures_are_retried_within_budget() {
    let h = Harness::with_config(PipelineConfig::default(), fast_retry(3)).await;
    h.analyzer.script(
        "Flaky",
        vec![
            Step::Unavailable,
            Step::Unavailable,
            Step::Answer(result(0.5, vec![])),
        ],
    );
    let id = h.seed("m-1", "Flaky", 0).await;

    let report = h.cycle().await;
    assert_eq!(report.analyzed, 1);
    assert!(report.failed.is_empty());
    assert_eq!(h.analyzer.calls(), 3);
    assert_eq!(h.item(id).await.state, ItemState::Done);
}

#[tokio::test]
async fn transient_failures_beyond_budget_fail_the_item() {
    let h = Harness::with_config(PipelineConfig::default(), fast_retry(1)).await;
    h.analyzer.script(
        "Flaky",
        vec![
            Step::Unavailable,
            Step::Unavailable,
            Step::Answer(result(0.5, vec![])),
        ],
    );
    let id = h.seed("m-1", "Flaky", 0).await;

    let report = h.cycle().await;
    assert_eq!(report.analyzed, 0);
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.failed[0].item_id, id);
    assert_eq!(h.analyzer.calls(), 2);

    let item = h.item(id).await;
    assert_eq!(item.state, ItemState::Failed);
    assert!(item.failure_reason.unwrap().contains("2 attempts"));
    assert_eq!(item.cost, Decimal::ZERO);
}

#[tokio::test]
async fn malformed_answer_fails_but_keeps_its_cost_in_the_ledger() {
    let h = Harness::new().await;
    h.analyzer.script("Garbled", vec![Step::Malformed]);
    let id = h.seed("m-1", "Garbled", 0).await;

    let report = h.cycle().await;
    assert_eq!(report.failed_count(), 1);
    // Permanent: no retry.
    assert_eq!(h.analyzer.calls(), 1);
    assert_eq!(report.total_cost, CALL_COST);

    let item = h.item(id).await;
    assert_eq!(item.state, ItemState::Failed);
    assert_eq!(item.cost, Decimal::ZERO);

    let spend = h
        .store
        .cost_summary(at_minute(0) - chrono::Duration::days(3650), Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(spend.calls, 1);
    assert_eq!(spend.total_cost, CALL_COST);
}

#[tokio::test]
async fn quota_exhaustion_halts_and_releases() {
    let config = PipelineConfig {
        analysis_workers: 1,
        ..Default::default()
    };
    let h = Harness::with_config(config, fast_retry(3)).await;
    h.analyzer.script("First", vec![Step::Quota]);
    let first = h.seed("m-1", "First", 0).await;
    let second = h.seed("m-2", "Second", 1).await;

    let report = h.cycle().await;
    assert!(report.quota_exhausted);
    assert!(!report.auth_expired);
    assert_eq!(report.released, 1);
    assert!(report.failed.is_empty());
    assert_eq!(h.analyzer.calls(), 1);
    assert_eq!(h.item(first).await.state, ItemState::Unprocessed);
    assert_eq!(h.item(second).await.state, ItemState::Unprocessed);

    // Next cycle picks both up again.
    let report = h.cycle().await;
    assert_eq!(report.analyzed, 2);
    assert!(!report.quota_exhausted);
}

#[tokio::test]
async fn failed_sync_retries_with_the_same_key() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Quarterly report",
        vec![Step::Answer(result(
            0.7,
            vec![candidate("Send quarterly report", 0.9, Priority::Medium)],
        ))],
    );
    h.reconciler.fail_next(ReconcilerError::Transient {
        reason: "connection reset".into(),
    });
    let id = h.seed("m-1", "Quarterly report", 0).await;

    let report = h.cycle().await;
    assert_eq!(report.tasks_sync_failed, 1);
    assert_eq!(report.done, 0);
    assert_eq!(h.item(id).await.state, ItemState::TaskSyncing);
    let task = &h.store.list_tasks_for_item(id).await.unwrap()[0];
    assert_eq!(task.sync_state, SyncState::SyncFailed);
    assert!(task.external_id.is_none());

    let sync = h.orchestrator.sync_pending_tasks().await.unwrap();
    assert_eq!(sync.synced, 1);
    assert_eq!(sync.items_finalized, 1);
    assert_eq!(h.item(id).await.state, ItemState::Done);

    let keys = h.reconciler.keys_seen.lock().unwrap().clone();
    assert_eq!(keys, vec![idempotency_key(id, 0), idempotency_key(id, 0)]);
    assert_eq!(h.reconciler.remote_count(), 1);
}

#[tokio::test]
async fn permanent_sync_failure_settles_the_item() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Bad task",
        vec![Step::Answer(result(
            0.7,
            vec![candidate("Impossible", 0.9, Priority::Low)],
        ))],
    );
    h.reconciler.fail_next(ReconcilerError::Rejected {
        status: 400,
        body: "title too long".into(),
    });
    let id = h.seed("m-1", "Bad task", 0).await;

    let report = h.cycle().await;
    assert_eq!(report.tasks_sync_failed, 1);
    assert_eq!(report.done, 1);
    let task = &h.store.list_tasks_for_item(id).await.unwrap()[0];
    assert!(task.sync_exhausted);
    assert_eq!(task.sync_state, SyncState::SyncFailed);
    assert!(task.sync_error.as_deref().unwrap().contains("title too long"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cycles_never_share_an_item() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    let reconciler = Arc::new(FakeReconciler::default());
    for n in 0..20u32 {
        let subject = format!("Request {n}");
        analyzer.script(
            &subject,
            vec![Step::Answer(result(
                0.6,
                vec![candidate(&format!("Handle request {n}"), 0.9, Priority::Medium)],
            ))],
        );
        store
            .insert_item(&raw(&format!("m-{n}"), &subject, n))
            .await
            .unwrap();
    }

    let build = || {
        Orchestrator::new(
            PipelineConfig::default(),
            store.clone(),
            analyzer.clone(),
            reconciler.clone(),
        )
        .with_retry_policy(fast_retry(3))
    };
    let (a, b) = (build(), build());
    let filter = ItemFilter::default();
    let (ra, rb) = tokio::join!(a.run_cycle(50, &filter), b.run_cycle(50, &filter));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.analyzed + rb.analyzed, 20);
    assert_eq!(analyzer.calls(), 20);
    assert_eq!(ra.done + rb.done, 20);
    assert_eq!(reconciler.remote_count(), 20);

    let done = store
        .list_items_by_state(ItemState::Done, &ItemFilter::default(), 100)
        .await
        .unwrap();
    assert_eq!(done.len(), 20);
    for item in &done {
        assert_eq!(item.cost, CALL_COST);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_syncs_create_one_remote_task() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let analyzer = Arc::new(ScriptedAnalyzer::default());
    let reconciler = Arc::new(ListThenInsertReconciler::default());
    reconciler
        .failures
        .lock()
        .unwrap()
        .push_back(ReconcilerError::Transient {
            reason: "HTTP 503".into(),
        });
    let orchestrator = Orchestrator::new(
        PipelineConfig::default(),
        store.clone(),
        analyzer.clone(),
        reconciler.clone(),
    )
    .with_retry_policy(fast_retry(3));

    analyzer.script(
        "Invoice #9",
        vec![Step::Answer(result(
            0.8,
            vec![candidate("Pay invoice #9", 0.9, Priority::High)],
        ))],
    );
    let id = store
        .insert_item(&raw("m-1", "Invoice #9", 0))
        .await
        .unwrap()
        .unwrap();
    let report = orchestrator
        .run_cycle(50, &ItemFilter::default())
        .await
        .unwrap();
    assert_eq!(report.tasks_sync_failed, 1);

    let (a, b) = tokio::join!(
        orchestrator.sync_pending_tasks(),
        orchestrator.sync_pending_tasks()
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.synced + b.synced, 1);

    let key = idempotency_key(id, 0);
    assert_eq!(reconciler.count_for(&key), 1);
    let tasks = store.list_tasks_for_item(id).await.unwrap();
    assert_eq!(tasks[0].sync_state, SyncState::Synced);
    assert_eq!(tasks[0].external_id.as_deref(), Some("remote-1"));
    assert_eq!(store.get_item(id).await.unwrap().unwrap().state, ItemState::Done);
}

#[tokio::test]
async fn cost_invariant_holds_across_mixed_outcomes() {
    let h = Harness::with_config(PipelineConfig::default(), fast_retry(0)).await;
    h.analyzer.script("Good", vec![Step::Answer(result(0.9, vec![]))]);
    h.analyzer.script("Flaky", vec![Step::Unavailable]);
    h.analyzer.script("Garbled", vec![Step::Malformed]);
    h.seed("m-1", "Good", 0).await;
    h.seed("m-2", "Flaky", 1).await;
    h.seed("m-3", "Garbled", 2).await;

    let report = h.cycle().await;
    assert_eq!(report.analyzed, 1);
    assert_eq!(report.failed_count(), 2);

    let items = h.all_items().await;
    assert_eq!(items.len(), 3);
    assert_cost_only_with_result(&items);
}

#[tokio::test]
async fn sender_filter_limits_the_batch() {
    let h = Harness::new().await;
    h.seed("m-1", "From billing", 0).await;
    let other = h
        .store
        .insert_item(&RawItem {
            sender: "Friend <pal@example.org>".into(),
            ..raw("m-2", "From a friend", 1)
        })
        .await
        .unwrap()
        .unwrap();

    let filter = ItemFilter {
        sender: Some("EXAMPLE.org".into()),
        ..Default::default()
    };
    let report = h.orchestrator.run_cycle(50, &filter).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(h.item(other).await.state, ItemState::Done);
}

// ── Re-analysis, completion, ingest, summary ────────────────────────

#[tokio::test]
async fn reanalysis_versions_and_adds_only_new_tasks() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Project kickoff",
        vec![
            Step::Answer(result(
                0.6,
                vec![candidate("Book kickoff room", 0.9, Priority::Medium)],
            )),
            Step::Answer(result(
                0.8,
                vec![
                    candidate("  book KICKOFF room ", 0.9, Priority::Medium),
                    candidate("Draft agenda", 0.8, Priority::High),
                ],
            )),
            Step::Answer(result(
                0.8,
                vec![
                    candidate("  book KICKOFF room ", 0.9, Priority::Medium),
                    candidate("Draft agenda", 0.8, Priority::High),
                ],
            )),
        ],
    );
    let id = h.seed("m-1", "Project kickoff", 0).await;
    h.cycle().await;

    let outcome = h.orchestrator.reanalyze(id).await.unwrap();
    assert_eq!(
        outcome,
        ReanalysisOutcome::Updated {
            version: 1,
            new_tasks: 1,
            revised_tasks: 0,
        }
    );

    let item = h.item(id).await;
    assert_eq!(item.state, ItemState::Done);
    assert_eq!(item.analysis_version, 1);
    assert_eq!(item.cost, CALL_COST * dec!(2));

    let tasks = h.store.list_tasks_for_item(id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    let agenda = tasks.iter().find(|t| t.title == "Draft agenda").unwrap();
    assert_eq!(agenda.candidate_index, 1);
    assert_eq!(agenda.idempotency_key, idempotency_key(id, 1));
    assert_eq!(agenda.sync_state, SyncState::Synced);

    let history = h.store.list_analysis_history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 0);

    // Same answer again: nothing changes, but the call is still paid for.
    assert_eq!(
        h.orchestrator.reanalyze(id).await.unwrap(),
        ReanalysisOutcome::Unchanged
    );
    assert_eq!(h.item(id).await.analysis_version, 1);
    assert_eq!(h.store.list_tasks_for_item(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn reanalysis_pushes_changed_due_date_and_priority() {
    let h = Harness::new().await;
    let due = NaiveDate::from_ymd_opt(2024, 3, 20);
    let revised = TaskCandidate {
        due_date: due,
        ..candidate("Send quarterly report", 0.9, Priority::Urgent)
    };
    h.analyzer.script(
        "Quarterly report",
        vec![
            Step::Answer(result(
                0.6,
                vec![candidate("Send quarterly report", 0.9, Priority::Medium)],
            )),
            Step::Answer(result(0.9, vec![revised])),
        ],
    );
    let id = h.seed("m-1", "Quarterly report", 0).await;
    h.cycle().await;

    let outcome = h.orchestrator.reanalyze(id).await.unwrap();
    assert_eq!(
        outcome,
        ReanalysisOutcome::Updated {
            version: 1,
            new_tasks: 0,
            revised_tasks: 1,
        }
    );

    let tasks = h.store.list_tasks_for_item(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].priority, Priority::Urgent);
    assert_eq!(tasks[0].due_date, due);

    let updates = h.reconciler.updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "remote-1");
    assert_eq!(updates[0].1.priority, Priority::Urgent);
    assert_eq!(updates[0].1.due, due);
    assert_eq!(h.reconciler.remote_count(), 1);
}

#[tokio::test]
async fn failed_remote_revision_keeps_the_local_record() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Quarterly report",
        vec![
            Step::Answer(result(
                0.6,
                vec![candidate("Send quarterly report", 0.9, Priority::Medium)],
            )),
            Step::Answer(result(
                0.9,
                vec![candidate("Send quarterly report", 0.9, Priority::High)],
            )),
        ],
    );
    let id = h.seed("m-1", "Quarterly report", 0).await;
    h.cycle().await;
    h.reconciler.fail_next(ReconcilerError::Transient {
        reason: "HTTP 503".into(),
    });

    let outcome = h.orchestrator.reanalyze(id).await.unwrap();
    assert_eq!(
        outcome,
        ReanalysisOutcome::Updated {
            version: 1,
            new_tasks: 0,
            revised_tasks: 0,
        }
    );
    let tasks = h.store.list_tasks_for_item(id).await.unwrap();
    assert_eq!(tasks[0].priority, Priority::Medium);
    assert!(h.reconciler.updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reanalysis_rejects_unanalyzed_items() {
    let h = Harness::new().await;
    let id = h.seed("m-1", "Waiting", 0).await;
    let err = h.orchestrator.reanalyze(id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { .. }));

    let err = h.orchestrator.reanalyze(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotFound { .. }));
}

#[tokio::test]
async fn completing_a_task_updates_both_sides() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Call back",
        vec![Step::Answer(result(
            0.7,
            vec![candidate("Call the landlord", 0.9, Priority::Medium)],
        ))],
    );
    let id = h.seed("m-1", "Call back", 0).await;
    h.cycle().await;
    let task = h.store.list_tasks_for_item(id).await.unwrap().remove(0);

    h.reconciler.fail_next(ReconcilerError::Transient {
        reason: "timeout".into(),
    });
    assert!(h.orchestrator.complete_task(task.id).await.is_err());
    assert_eq!(
        h.store.get_task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    let done = h.orchestrator.complete_task(task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    let remote = h.reconciler.list_tasks("inbox").await.unwrap();
    assert_eq!(remote[0].status, RemoteStatus::Completed);
}

#[tokio::test]
async fn remote_completion_is_mirrored_on_sync() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Renew passport",
        vec![Step::Answer(result(
            0.9,
            vec![candidate("Renew passport", 0.95, Priority::Urgent)],
        ))],
    );
    let id = h.seed("m-1", "Renew passport", 0).await;
    h.cycle().await;
    let task = h.store.list_tasks_for_item(id).await.unwrap().remove(0);
    h.reconciler
        .set_status(task.external_id.as_deref().unwrap(), RemoteStatus::Completed);

    let sync = h.orchestrator.sync_pending_tasks().await.unwrap();
    assert_eq!(sync.attempted, 0);
    assert_eq!(sync.completed_remotely, 1);
    assert_eq!(
        h.store.get_task(task.id).await.unwrap().unwrap().status,
        TaskStatus::Completed
    );

    h.reconciler
        .set_status(task.external_id.as_deref().unwrap(), RemoteStatus::NeedsAction);
    let sync = h.orchestrator.sync_pending_tasks().await.unwrap();
    assert_eq!(sync.reopened_remotely, 1);
}

#[tokio::test]
async fn ingest_skips_known_and_repeated_messages() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store.insert_item(&raw("m-1", "Old", 0)).await.unwrap();
    let source = FixedSource(vec![
        raw("m-1", "Old", 0),
        raw("m-2", "New", 1),
        raw("m-2", "New", 1),
        raw("m-3", "Newer", 2),
    ]);
    let orchestrator = Orchestrator::new(
        PipelineConfig::default(),
        store.clone(),
        Arc::new(ScriptedAnalyzer::default()),
        Arc::new(FakeReconciler::default()),
    )
    .with_source(Arc::new(source));

    let report = orchestrator.ingest(&FetchFilter::default(), 10).await.unwrap();
    assert_eq!(report.fetched, 4);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.duplicates, 2);
    assert!(store.get_item_by_external_id("m-3").await.unwrap().is_some());
}

#[tokio::test]
async fn ingest_without_a_source_is_not_configured() {
    let h = Harness::new().await;
    let err = h
        .orchestrator
        .ingest(&FetchFilter::default(), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotConfigured(_)));
}

#[tokio::test]
async fn summarizing_a_day_twice_gives_the_same_aggregates() {
    let h = Harness::new().await;
    h.analyzer.script(
        "Budget approval",
        vec![Step::Answer(result(
            0.9,
            vec![candidate("Approve budget", 0.9, Priority::High)],
        ))],
    );
    h.analyzer.script("Garbled", vec![Step::Malformed]);
    h.seed("m-1", "Budget approval", 0).await;
    h.seed("m-2", "Weekly digest", 1).await;
    h.seed("m-3", "Garbled", 2).await;
    h.cycle().await;

    let aggregator = Aggregator::new(h.store.clone(), Duration::from_secs(5))
        .with_digest_engine(h.analyzer.clone());
    let first = aggregator.summarize(day()).await.unwrap();
    let second = aggregator.summarize(day()).await.unwrap();

    assert_eq!(first.items_processed, 2);
    assert_eq!(first.items_failed, 1);
    assert_eq!(first.important_items, 1);
    assert_eq!(first.tasks_created, 1);
    assert_eq!(first.high_priority_tasks, 1);
    assert_eq!(first.total_cost, CALL_COST * dec!(2));
    assert_eq!(first.digest, "A quiet day.");
    assert!(first.same_aggregates(&second));

    let stored = h.store.get_daily_summary(day()).await.unwrap().unwrap();
    assert!(stored.same_aggregates(&second));
}
