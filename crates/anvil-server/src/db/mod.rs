//! SQLite persistence layer.
//!
//! Entities are stored as JSON alongside indexed lookup columns, with
//! forward-only migrations stamped in `schema_migrations`. SQLite runs in
//! WAL mode: concurrent reads, serialized writes. The single-writer lock
//! is what serializes per-workflow state transitions; every multi-row
//! mutation happens inside one transaction whose commit is the last step.

pub mod hardware;
pub mod template;
pub mod workflow;

use anvil_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// A tagged, forward-only migration. The SQL must be idempotent; the
/// `schema_migrations` records table guarantees each tag is applied once.
pub struct Migration {
    pub id: &'static str,
    sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "20250612_initial",
        sql: r#"
        CREATE TABLE IF NOT EXISTS hardware (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE TABLE IF NOT EXISTS hardware_keys (
            hardware_id TEXT NOT NULL REFERENCES hardware(id),
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (hardware_id, kind, value)
        );
        CREATE INDEX IF NOT EXISTS idx_hardware_keys_value ON hardware_keys(kind, value);

        CREATE TABLE IF NOT EXISTS templates (
            id BLOB PRIMARY KEY,
            name TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_templates_live_name
            ON templates(name) WHERE deleted_at IS NULL;

        CREATE TABLE IF NOT EXISTS workflows (
            id BLOB PRIMARY KEY,
            template_id BLOB NOT NULL,
            hardware_id TEXT NOT NULL,
            state TEXT NOT NULL,
            rendered_yaml TEXT NOT NULL,
            plan TEXT NOT NULL,
            global_timeout INTEGER NOT NULL DEFAULT 0,
            current_worker TEXT NOT NULL,
            current_task TEXT NOT NULL,
            current_action TEXT NOT NULL,
            current_action_state TEXT NOT NULL,
            cursor_task INTEGER NOT NULL DEFAULT 0,
            cursor_action INTEGER NOT NULL DEFAULT 0,
            current_action_index INTEGER NOT NULL DEFAULT 0,
            total_actions INTEGER NOT NULL,
            data_blob BLOB NOT NULL DEFAULT x'',
            data_version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_workflows_state ON workflows(state);
        CREATE INDEX IF NOT EXISTS idx_workflows_hardware ON workflows(hardware_id);

        CREATE TABLE IF NOT EXISTS workflow_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workflow_id BLOB NOT NULL,
            worker_id TEXT NOT NULL,
            task_name TEXT NOT NULL,
            action_name TEXT NOT NULL,
            action_status TEXT NOT NULL,
            seconds INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_workflow_events_workflow
            ON workflow_events(workflow_id);
        "#,
    },
    Migration {
        id: "20250719_workflow_workers",
        sql: r#"
        CREATE TABLE IF NOT EXISTS workflow_workers (
            worker_addr TEXT NOT NULL,
            workflow_id BLOB NOT NULL,
            PRIMARY KEY (worker_addr, workflow_id)
        );
        CREATE INDEX IF NOT EXISTS idx_workflow_workers_workflow
            ON workflow_workers(workflow_id);
        "#,
    },
];

#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open or create the database at the given path. Migrations are not
    /// applied here; callers decide between [`Db::migrate`] and refusing
    /// to serve with pending migrations.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))
            .map_err(|e| Error::Database(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let db = Self { pool };
        db.ensure_migration_table().await?;
        info!("database opened at {}", path);
        Ok(db)
    }

    /// In-memory database for tests. A single connection, because every
    /// `:memory:` connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Database(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let db = Self { pool };
        db.ensure_migration_table().await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_migration_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                id TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Migration tags that are declared but not yet recorded as applied.
    pub async fn required_migrations(&self) -> Result<Vec<&'static str>> {
        let rows = sqlx::query("SELECT id FROM schema_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let applied: Vec<String> = rows.iter().map(|r| r.get("id")).collect();
        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied.iter().any(|a| a == m.id))
            .map(|m| m.id)
            .collect())
    }

    /// Apply every pending migration, each in its own transaction, and
    /// return how many ran.
    pub async fn migrate(&self) -> Result<usize> {
        let pending = self.required_migrations().await?;
        let mut applied = 0;
        for migration in MIGRATIONS.iter().filter(|m| pending.contains(&m.id)) {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("INSERT INTO schema_migrations (id, applied_at) VALUES (?, ?)")
                .bind(migration.id)
                .bind(now())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            info!("applied migration {}", migration.id);
            applied += 1;
        }
        Ok(applied)
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Remap integrity-constraint violations onto the taxonomy; everything
/// else stays a database error with the cause preserved for logs.
pub(crate) fn constraint_err(e: sqlx::Error, what: &str) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return Error::AlreadyExists(what.to_string());
        }
        if db.is_foreign_key_violation() {
            return Error::InvalidArgument(format!("{} references a missing row", what));
        }
    }
    Error::Database(e.to_string())
}

/// Whether the error is a transient lock conflict worth retrying.
pub(crate) fn is_busy(err: &Error) -> bool {
    match err {
        Error::Database(msg) => msg.contains("locked") || msg.contains("busy"),
        _ => false,
    }
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp {}: {}", s, e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn uuid_from_bytes(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|e| Error::Internal(format!("bad uuid column: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_applies_all_migrations() {
        let db = Db::open_in_memory().await.unwrap();
        assert!(db.required_migrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrations_are_recorded_once() {
        let db = Db::open_in_memory().await.unwrap();
        // A second run has nothing to do.
        assert_eq!(db.migrate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fresh_file_database_reports_required_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anvil.db");
        let db = Db::open(path.to_str().unwrap()).await.unwrap();

        let required = db.required_migrations().await.unwrap();
        assert_eq!(required.len(), MIGRATIONS.len());

        assert_eq!(db.migrate().await.unwrap(), MIGRATIONS.len());
        assert!(db.required_migrations().await.unwrap().is_empty());
    }
}
