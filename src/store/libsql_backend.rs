//! libSQL backend: async `Database` trait implementation.
//!
//! One connection is shared by every caller. Access goes through an async
//! gate so a transaction opened by one task never interleaves with
//! statements from another.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::llm::CallUsage;
use crate::pipeline::types::{
    AnalysisResult, Item, ItemFilter, ItemState, NewTaskRecord, Priority, TaskRecord,
    TaskStatus, idempotency_key,
};
use crate::source::RawItem;
use crate::store::migrations;
use crate::store::traits::{
    AnalysisHistoryEntry, CostSummary, Database, LlmCallRecord, ProcessingLogEntry,
};
use crate::summary::DailySummary;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: Mutex::new(()),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn parse_decimal(s: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(s).map_err(|e| DatabaseError::Serialization(format!("bad amount {s}: {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Wrap a libSQL error with the operation name, keeping constraint
/// violations distinguishable.
fn db_err(op: &'static str) -> impl FnOnce(libsql::Error) -> DatabaseError {
    move |e| match DatabaseError::from(e) {
        DatabaseError::Query(msg) => DatabaseError::Query(format!("{op}: {msg}")),
        other => other,
    }
}

const ITEM_COLUMNS: &str = "id, external_id, sender, subject, body, received_at, state, failure_reason, analysis, analysis_version, tokens_used, cost, claimed_at, created_at, updated_at";

const TASK_COLUMNS: &str = "id, item_id, candidate_index, idempotency_key, title, description, due_date, priority, confidence, status, external_id, sync_state, sync_error, sync_attempts, sync_exhausted, created_at, updated_at";

fn row_to_item(row: &libsql::Row) -> Result<Item, DatabaseError> {
    let id: String = row.get(0)?;
    let received: String = row.get(5)?;
    let state: String = row.get(6)?;
    let analysis: Option<String> = row.get(8)?;
    let cost: String = row.get(11)?;
    let claimed: Option<String> = row.get(12)?;
    let created: String = row.get(13)?;
    let updated: String = row.get(14)?;

    Ok(Item {
        id: parse_uuid(&id)?,
        external_id: row.get(1)?,
        sender: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        received_at: parse_datetime(&received),
        state: state.parse().map_err(DatabaseError::Serialization)?,
        failure_reason: row.get(7)?,
        analysis: analysis
            .as_deref()
            .map(serde_json::from_str::<AnalysisResult>)
            .transpose()?,
        analysis_version: row.get::<i64>(9)? as u32,
        tokens_used: row.get::<i64>(10)? as u64,
        cost: parse_decimal(&cost)?,
        claimed_at: claimed.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let id: String = row.get(0)?;
    let item_id: String = row.get(1)?;
    let due: Option<String> = row.get(6)?;
    let priority: String = row.get(7)?;
    let status: String = row.get(9)?;
    let sync_state: String = row.get(11)?;
    let created: String = row.get(15)?;
    let updated: String = row.get(16)?;

    Ok(TaskRecord {
        id: parse_uuid(&id)?,
        item_id: parse_uuid(&item_id)?,
        candidate_index: row.get::<i64>(2)? as u32,
        idempotency_key: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        due_date: due
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d"))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("bad due date: {e}")))?,
        priority: priority.parse().map_err(DatabaseError::Serialization)?,
        confidence: row.get(8)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        external_id: row.get(10)?,
        sync_state: sync_state.parse().map_err(DatabaseError::Serialization)?,
        sync_error: row.get(12)?,
        sync_attempts: row.get::<i64>(13)? as u32,
        sync_exhausted: row.get::<i64>(14)? != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_log_entry(row: &libsql::Row) -> Result<ProcessingLogEntry, DatabaseError> {
    let id: String = row.get(0)?;
    let cost: String = row.get(6)?;
    let created: String = row.get(7)?;
    Ok(ProcessingLogEntry {
        id: parse_uuid(&id)?,
        operation: row.get(1)?,
        status: row.get(2)?,
        message: row.get(3)?,
        duration_ms: row.get::<i64>(4)? as u64,
        tokens_used: row.get::<i64>(5)? as u64,
        cost: parse_decimal(&cost)?,
        created_at: parse_datetime(&created),
    })
}

async fn collect_items(mut rows: libsql::Rows) -> Result<Vec<Item>, DatabaseError> {
    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(row_to_item(&row)?);
    }
    Ok(items)
}

async fn collect_tasks(mut rows: libsql::Rows) -> Result<Vec<TaskRecord>, DatabaseError> {
    let mut tasks = Vec::new();
    while let Some(row) = rows.next().await? {
        tasks.push(row_to_task(&row)?);
    }
    Ok(tasks)
}

/// Insert task records, skipping candidate indices the item already has.
async fn insert_task_records(
    conn: &Connection,
    item_id: Uuid,
    tasks: &[NewTaskRecord],
    now: &str,
) -> Result<usize, DatabaseError> {
    let mut inserted = 0;
    for task in tasks {
        let candidate = &task.candidate;
        let due = candidate.due_date.map(|d| d.format("%Y-%m-%d").to_string());
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO task_records (id, item_id, candidate_index, idempotency_key, title, description, due_date, priority, confidence, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    Uuid::new_v4().to_string(),
                    item_id.to_string(),
                    i64::from(task.candidate_index),
                    idempotency_key(item_id, task.candidate_index),
                    candidate.title.as_str(),
                    opt_text(candidate.description.as_deref()),
                    opt_text(due.as_deref()),
                    candidate.priority.as_str(),
                    candidate.confidence,
                    now,
                ],
            )
            .await
            .map_err(db_err("insert_task_record"))?;
        inserted += changed as usize;
    }
    Ok(inserted)
}

async fn materialize_in(
    conn: &Connection,
    item_id: Uuid,
    tasks: &[NewTaskRecord],
) -> Result<Option<usize>, DatabaseError> {
    let now = ts(&Utc::now());
    let moved = conn
        .execute(
            "UPDATE items SET state = 'task_syncing', updated_at = ?1 WHERE id = ?2 AND state = 'analyzed'",
            params![now.as_str(), item_id.to_string()],
        )
        .await
        .map_err(db_err("materialize_tasks"))?;
    if moved == 0 {
        return Ok(None);
    }
    insert_task_records(conn, item_id, tasks, &now)
        .await
        .map(Some)
}

async fn reanalysis_in(
    conn: &Connection,
    item_id: Uuid,
    expected_version: u32,
    result: &AnalysisResult,
    usage: &CallUsage,
    tasks: &[NewTaskRecord],
) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT state, analysis, analysis_version, cost FROM items WHERE id = ?1",
            params![item_id.to_string()],
        )
        .await
        .map_err(db_err("apply_reanalysis"))?;
    let Some(row) = rows.next().await? else {
        return Ok(false);
    };
    let state: ItemState = row
        .get::<String>(0)?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let previous: Option<String> = row.get(1)?;
    let version = row.get::<i64>(2)? as u32;
    let cost = parse_decimal(&row.get::<String>(3)?)?;
    drop(rows);

    if version != expected_version || !state.allows_reanalysis() {
        return Ok(false);
    }

    let now = ts(&Utc::now());
    if let Some(previous) = previous {
        conn.execute(
            "INSERT INTO analysis_history (id, item_id, version, analysis, archived_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                item_id.to_string(),
                i64::from(version),
                previous,
                now.as_str(),
            ],
        )
        .await
        .map_err(db_err("archive_analysis"))?;
    }

    let updated = conn
        .execute(
            "UPDATE items SET state = 'task_syncing', failure_reason = NULL, analysis = ?1, importance_score = ?2, sentiment = ?3, summary = ?4, analysis_version = ?5, tokens_used = tokens_used + ?6, cost = ?7, claimed_at = NULL, updated_at = ?8 WHERE id = ?9 AND analysis_version = ?10",
            params![
                serde_json::to_string(result)?,
                result.importance_score,
                result.sentiment.as_str(),
                result.summary.as_str(),
                i64::from(version + 1),
                usage.total_tokens() as i64,
                (cost + usage.cost).to_string(),
                now.as_str(),
                item_id.to_string(),
                i64::from(version),
            ],
        )
        .await
        .map_err(db_err("apply_reanalysis"))?;
    if updated == 0 {
        return Ok(false);
    }

    insert_task_records(conn, item_id, tasks, &now).await?;
    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        migrations::run_migrations(&self.conn).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self.conn.query("SELECT 1", ()).await.map_err(db_err("ping"))?;
        rows.next().await?;
        Ok(())
    }

    // ── Items ───────────────────────────────────────────────────────

    async fn insert_item(&self, raw: &RawItem) -> Result<Option<Uuid>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let id = Uuid::new_v4();
        let now = ts(&Utc::now());
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO items (id, external_id, sender, subject, body, received_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    raw.external_id.as_str(),
                    raw.sender.as_str(),
                    raw.subject.as_str(),
                    raw.body.as_str(),
                    ts(&raw.received_at),
                    now,
                ],
            )
            .await
            .map_err(db_err("insert_item"))?;

        if inserted == 0 {
            debug!(external_id = %raw.external_id, "Item already known");
            return Ok(None);
        }
        debug!(item_id = %id, external_id = %raw.external_id, "Item inserted");
        Ok(Some(id))
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err("get_item"))?;
        match rows.next().await? {
            Some(row) => row_to_item(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn get_item_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Item>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(db_err("get_item_by_external_id"))?;
        match rows.next().await? {
            Some(row) => row_to_item(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn list_items_by_state(
        &self,
        state: ItemState,
        filter: &ItemFilter,
        limit: usize,
    ) -> Result<Vec<Item>, DatabaseError> {
        let mut sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE state = ?1");
        let mut values = vec![libsql::Value::Text(state.as_str().to_string())];
        if let Some(sender) = &filter.sender {
            values.push(libsql::Value::Text(sender.to_lowercase()));
            sql.push_str(&format!(" AND instr(lower(sender), ?{}) > 0", values.len()));
        }
        if let Some(after) = &filter.received_after {
            values.push(libsql::Value::Text(ts(after)));
            sql.push_str(&format!(" AND received_at >= ?{}", values.len()));
        }
        if let Some(before) = &filter.received_before {
            values.push(libsql::Value::Text(ts(before)));
            sql.push_str(&format!(" AND received_at < ?{}", values.len()));
        }
        values.push(libsql::Value::Integer(limit as i64));
        sql.push_str(&format!(
            " ORDER BY received_at ASC, created_at ASC LIMIT ?{}",
            values.len()
        ));

        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(db_err("list_items_by_state"))?;
        collect_items(rows).await
    }

    async fn list_items_received_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Item>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM items WHERE received_at >= ?1 AND received_at < ?2 ORDER BY received_at ASC"
                ),
                params![ts(&start), ts(&end)],
            )
            .await
            .map_err(db_err("list_items_received_between"))?;
        collect_items(rows).await
    }

    async fn count_items_by_state(&self) -> Result<Vec<(ItemState, u64)>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query("SELECT state, COUNT(*) FROM items GROUP BY state", ())
            .await
            .map_err(db_err("count_items_by_state"))?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next().await? {
            let state: ItemState = row
                .get::<String>(0)?
                .parse()
                .map_err(DatabaseError::Serialization)?;
            counts.push((state, row.get::<i64>(1)? as u64));
        }
        Ok(counts)
    }

    async fn claim_item(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let now = ts(&Utc::now());
        let claimed = self
            .conn
            .execute(
                "UPDATE items SET state = 'analyzing', claimed_at = ?1, updated_at = ?1 WHERE id = ?2 AND state = 'unprocessed'",
                params![now, id.to_string()],
            )
            .await
            .map_err(db_err("claim_item"))?;
        Ok(claimed == 1)
    }

    async fn release_item(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let released = self
            .conn
            .execute(
                "UPDATE items SET state = 'unprocessed', claimed_at = NULL, updated_at = ?1 WHERE id = ?2 AND state = 'analyzing'",
                params![ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err("release_item"))?;
        Ok(released == 1)
    }

    async fn release_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let _gate = self.gate.lock().await;
        let released = self
            .conn
            .execute(
                "UPDATE items SET state = 'unprocessed', claimed_at = NULL, updated_at = ?1 WHERE state = 'analyzing' AND (claimed_at IS NULL OR claimed_at < ?2)",
                params![ts(&Utc::now()), ts(&claimed_before)],
            )
            .await
            .map_err(db_err("release_stale_claims"))?;
        if released > 0 {
            warn!(count = released, "Released stale analysis claims");
        }
        Ok(released as usize)
    }

    async fn commit_analysis(
        &self,
        id: Uuid,
        result: &AnalysisResult,
        usage: &CallUsage,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let committed = self
            .conn
            .execute(
                "UPDATE items SET state = 'analyzed', analysis = ?1, importance_score = ?2, sentiment = ?3, summary = ?4, tokens_used = ?5, cost = ?6, claimed_at = NULL, updated_at = ?7 WHERE id = ?8 AND state = 'analyzing'",
                params![
                    serde_json::to_string(result)?,
                    result.importance_score,
                    result.sentiment.as_str(),
                    result.summary.as_str(),
                    usage.total_tokens() as i64,
                    usage.cost.to_string(),
                    ts(&Utc::now()),
                    id.to_string(),
                ],
            )
            .await
            .map_err(db_err("commit_analysis"))?;
        Ok(committed == 1)
    }

    async fn fail_item(&self, id: Uuid, reason: &str) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let failed = self
            .conn
            .execute(
                "UPDATE items SET state = 'failed', failure_reason = ?1, claimed_at = NULL, updated_at = ?2 WHERE id = ?3 AND state = 'analyzing'",
                params![reason, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err("fail_item"))?;
        Ok(failed == 1)
    }

    async fn materialize_tasks(
        &self,
        item_id: Uuid,
        tasks: &[NewTaskRecord],
    ) -> Result<Option<usize>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err("begin"))?;
        match materialize_in(&tx, item_id, tasks).await {
            Ok(created) => {
                tx.commit().await.map_err(db_err("commit"))?;
                Ok(created)
            }
            Err(e) => {
                tx.rollback().await.map_err(db_err("rollback"))?;
                Err(e)
            }
        }
    }

    async fn apply_reanalysis(
        &self,
        item_id: Uuid,
        expected_version: u32,
        result: &AnalysisResult,
        usage: &CallUsage,
        tasks: &[NewTaskRecord],
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err("begin"))?;
        match reanalysis_in(&tx, item_id, expected_version, result, usage, tasks).await {
            Ok(true) => {
                tx.commit().await.map_err(db_err("commit"))?;
                Ok(true)
            }
            Ok(false) => {
                tx.rollback().await.map_err(db_err("rollback"))?;
                Ok(false)
            }
            Err(e) => {
                tx.rollback().await.map_err(db_err("rollback"))?;
                Err(e)
            }
        }
    }

    async fn finalize_item(&self, item_id: Uuid) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let finalized = self
            .conn
            .execute(
                "UPDATE items SET state = 'done', updated_at = ?1 WHERE id = ?2 AND state = 'task_syncing' AND NOT EXISTS (SELECT 1 FROM task_records t WHERE t.item_id = items.id AND t.sync_state != 'synced' AND t.sync_exhausted = 0)",
                params![ts(&Utc::now()), item_id.to_string()],
            )
            .await
            .map_err(db_err("finalize_item"))?;
        Ok(finalized == 1)
    }

    async fn list_analysis_history(
        &self,
        item_id: Uuid,
    ) -> Result<Vec<AnalysisHistoryEntry>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT version, analysis, archived_at FROM analysis_history WHERE item_id = ?1 ORDER BY version ASC",
                params![item_id.to_string()],
            )
            .await
            .map_err(db_err("list_analysis_history"))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let analysis: String = row.get(1)?;
            let archived: String = row.get(2)?;
            entries.push(AnalysisHistoryEntry {
                item_id,
                version: row.get::<i64>(0)? as u32,
                analysis: serde_json::from_str(&analysis)?,
                archived_at: parse_datetime(&archived),
            });
        }
        Ok(entries)
    }

    // ── Task records ────────────────────────────────────────────────

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM task_records WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(db_err("get_task"))?;
        match rows.next().await? {
            Some(row) => row_to_task(&row).map(Some),
            None => Ok(None),
        }
    }

    async fn list_tasks_for_item(&self, item_id: Uuid) -> Result<Vec<TaskRecord>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_records WHERE item_id = ?1 ORDER BY candidate_index ASC"
                ),
                params![item_id.to_string()],
            )
            .await
            .map_err(db_err("list_tasks_for_item"))?;
        collect_tasks(rows).await
    }

    async fn list_tasks_for_items_received_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_records WHERE item_id IN (SELECT id FROM items WHERE received_at >= ?1 AND received_at < ?2) ORDER BY created_at ASC, candidate_index ASC"
                ),
                params![ts(&start), ts(&end)],
            )
            .await
            .map_err(db_err("list_tasks_for_items_received_between"))?;
        collect_tasks(rows).await
    }

    async fn list_unsynced_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_records WHERE external_id IS NULL AND sync_exhausted = 0 ORDER BY created_at ASC, candidate_index ASC"
                ),
                (),
            )
            .await
            .map_err(db_err("list_unsynced_tasks"))?;
        collect_tasks(rows).await
    }

    async fn list_synced_tasks(&self) -> Result<Vec<TaskRecord>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM task_records WHERE sync_state = 'synced' ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(db_err("list_synced_tasks"))?;
        collect_tasks(rows).await
    }

    async fn claim_task_sync(
        &self,
        id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let claimed = self
            .conn
            .execute(
                "UPDATE task_records SET sync_claimed_at = ?1, updated_at = ?1 WHERE id = ?2 AND external_id IS NULL AND sync_exhausted = 0 AND (sync_claimed_at IS NULL OR sync_claimed_at < ?3)",
                params![ts(&Utc::now()), id.to_string(), ts(&stale_before)],
            )
            .await
            .map_err(db_err("claim_task_sync"))?;
        Ok(claimed == 1)
    }

    async fn release_task_sync(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let released = self
            .conn
            .execute(
                "UPDATE task_records SET sync_claimed_at = NULL, updated_at = ?1 WHERE id = ?2 AND sync_claimed_at IS NOT NULL",
                params![ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err("release_task_sync"))?;
        Ok(released == 1)
    }

    async fn update_task_details(
        &self,
        id: Uuid,
        due_date: Option<NaiveDate>,
        priority: Priority,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let due = due_date.map(|d| d.format("%Y-%m-%d").to_string());
        let updated = self
            .conn
            .execute(
                "UPDATE task_records SET due_date = ?1, priority = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    opt_text(due.as_deref()),
                    priority.as_str(),
                    ts(&Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(db_err("update_task_details"))?;
        Ok(updated == 1)
    }

    async fn mark_task_synced(&self, id: Uuid, external_id: &str) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let synced = self
            .conn
            .execute(
                "UPDATE task_records SET external_id = ?1, sync_state = 'synced', sync_error = NULL, sync_attempts = sync_attempts + 1, sync_claimed_at = NULL, updated_at = ?2 WHERE id = ?3 AND external_id IS NULL",
                params![external_id, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err("mark_task_synced"))?;
        Ok(synced == 1)
    }

    async fn mark_task_sync_failed(
        &self,
        id: Uuid,
        reason: &str,
        exhausted: bool,
    ) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        self.conn
            .execute(
                "UPDATE task_records SET sync_state = 'sync_failed', sync_error = ?1, sync_attempts = sync_attempts + 1, sync_exhausted = ?2, sync_claimed_at = NULL, updated_at = ?3 WHERE id = ?4 AND external_id IS NULL",
                params![reason, i64::from(exhausted), ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err("mark_task_sync_failed"))?;
        Ok(())
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<bool, DatabaseError> {
        let _gate = self.gate.lock().await;
        let updated = self
            .conn
            .execute(
                "UPDATE task_records SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(db_err("set_task_status"))?;
        Ok(updated == 1)
    }

    // ── Ledger, log, summaries ──────────────────────────────────────

    async fn record_llm_call(&self, call: &LlmCallRecord) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        let item_id = call.item_id.map(|id| id.to_string());
        self.conn
            .execute(
                "INSERT INTO llm_calls (id, item_id, provider, model, purpose, input_tokens, output_tokens, cost, succeeded, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    call.id.to_string(),
                    opt_text(item_id.as_deref()),
                    call.provider.as_str(),
                    call.model.as_str(),
                    call.purpose.as_str(),
                    i64::from(call.usage.input_tokens),
                    i64::from(call.usage.output_tokens),
                    call.usage.cost.to_string(),
                    i64::from(call.succeeded),
                    ts(&call.created_at),
                ],
            )
            .await
            .map_err(db_err("record_llm_call"))?;
        Ok(())
    }

    async fn cost_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CostSummary, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT input_tokens, output_tokens, cost FROM llm_calls WHERE created_at >= ?1 AND created_at < ?2",
                params![ts(&start), ts(&end)],
            )
            .await
            .map_err(db_err("cost_summary"))?;

        // Summed in Rust so amounts stay exact decimals.
        let mut summary = CostSummary::default();
        while let Some(row) = rows.next().await? {
            summary.calls += 1;
            summary.input_tokens += row.get::<i64>(0)? as u64;
            summary.output_tokens += row.get::<i64>(1)? as u64;
            summary.total_cost += parse_decimal(&row.get::<String>(2)?)?;
        }
        Ok(summary)
    }

    async fn append_processing_log(&self, entry: &ProcessingLogEntry) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        self.conn
            .execute(
                "INSERT INTO processing_log (id, operation, status, message, duration_ms, tokens_used, cost, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id.to_string(),
                    entry.operation.as_str(),
                    entry.status.as_str(),
                    entry.message.as_str(),
                    entry.duration_ms as i64,
                    entry.tokens_used as i64,
                    entry.cost.to_string(),
                    ts(&entry.created_at),
                ],
            )
            .await
            .map_err(db_err("append_processing_log"))?;
        Ok(())
    }

    async fn recent_processing_log(
        &self,
        limit: usize,
    ) -> Result<Vec<ProcessingLogEntry>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT id, operation, status, message, duration_ms, tokens_used, cost, created_at FROM processing_log ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(db_err("recent_processing_log"))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_log_entry(&row)?);
        }
        Ok(entries)
    }

    async fn upsert_daily_summary(&self, summary: &DailySummary) -> Result<(), DatabaseError> {
        let _gate = self.gate.lock().await;
        self.conn
            .execute(
                "INSERT INTO daily_summaries (day, payload, generated_at) VALUES (?1, ?2, ?3) ON CONFLICT(day) DO UPDATE SET payload = excluded.payload, generated_at = excluded.generated_at",
                params![
                    summary.day.format("%Y-%m-%d").to_string(),
                    serde_json::to_string(summary)?,
                    ts(&summary.generated_at),
                ],
            )
            .await
            .map_err(db_err("upsert_daily_summary"))?;
        debug!(day = %summary.day, "Daily summary stored");
        Ok(())
    }

    async fn get_daily_summary(&self, day: NaiveDate) -> Result<Option<DailySummary>, DatabaseError> {
        let _gate = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT payload FROM daily_summaries WHERE day = ?1",
                params![day.format("%Y-%m-%d").to_string()],
            )
            .await
            .map_err(db_err("get_daily_summary"))?;
        match rows.next().await? {
            Some(row) => {
                let payload: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}
