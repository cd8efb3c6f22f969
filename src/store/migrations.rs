//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` reads
//! the highest applied version and applies newer ones in order.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "items_and_tasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                received_at TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'unprocessed'
                    CHECK (state IN ('unprocessed', 'analyzing', 'analyzed', 'task_syncing', 'done', 'failed')),
                failure_reason TEXT,
                importance_score REAL,
                sentiment TEXT,
                summary TEXT,
                analysis TEXT,
                analysis_version INTEGER NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                cost TEXT NOT NULL DEFAULT '0',
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (CAST(cost AS REAL) = 0 OR (summary IS NOT NULL AND sentiment IS NOT NULL)),
                CHECK ((state = 'failed') = (failure_reason IS NOT NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_items_state_received ON items(state, received_at);
            CREATE INDEX IF NOT EXISTS idx_items_received ON items(received_at);

            CREATE TABLE IF NOT EXISTS task_records (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL,
                candidate_index INTEGER NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT,
                due_date TEXT,
                priority TEXT NOT NULL,
                confidence REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                external_id TEXT,
                sync_state TEXT NOT NULL DEFAULT 'pending'
                    CHECK (sync_state IN ('pending', 'synced', 'sync_failed')),
                sync_error TEXT,
                sync_attempts INTEGER NOT NULL DEFAULT 0,
                sync_exhausted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (item_id, candidate_index),
                CHECK ((external_id IS NOT NULL) = (sync_state = 'synced'))
            );
            CREATE INDEX IF NOT EXISTS idx_task_records_item ON task_records(item_id);
            CREATE INDEX IF NOT EXISTS idx_task_records_sync ON task_records(sync_state);

            CREATE TABLE IF NOT EXISTS analysis_history (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                analysis TEXT NOT NULL,
                archived_at TEXT NOT NULL,
                UNIQUE (item_id, version)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "ledger_log_summaries",
        sql: r#"
            CREATE TABLE IF NOT EXISTS llm_calls (
                id TEXT PRIMARY KEY,
                item_id TEXT,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                purpose TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                cost TEXT NOT NULL,
                succeeded INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_llm_calls_created ON llm_calls(created_at);
            CREATE INDEX IF NOT EXISTS idx_llm_calls_item ON llm_calls(item_id);

            CREATE TABLE IF NOT EXISTS processing_log (
                id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                cost TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processing_log_created ON processing_log(created_at);

            CREATE TABLE IF NOT EXISTS daily_summaries (
                day TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                generated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        name: "task_sync_claims",
        sql: r#"
            ALTER TABLE task_records ADD COLUMN sync_claimed_at TEXT;
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current = current_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "Migration V{} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to record migration: {e}")))?;
    }

    let version = current_version(conn).await?;
    tracing::debug!(version, "Database schema up to date");
    Ok(())
}

/// Highest applied migration version, or 0 if none.
pub async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse migration version: {e}"))),
        None => Ok(0),
    }
}

/// Highest version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
