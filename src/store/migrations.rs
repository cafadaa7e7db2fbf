//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                description TEXT NOT NULL,
                parsed_intent TEXT,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'submitted',
                progress INTEGER NOT NULL DEFAULT 0,
                execution_steps TEXT NOT NULL DEFAULT '[]',
                scheduled_for TEXT,
                recurring_pattern TEXT,
                output_format TEXT,
                output_data TEXT,
                output_media_refs TEXT NOT NULL DEFAULT '[]',
                processing_started_at TEXT,
                processing_ended_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                error_message TEXT,
                parent_task_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_instance_created
                ON tasks(instance_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        "#,
    },
    Migration {
        version: 2,
        name: "due_scan_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON tasks(status, scheduled_for);
        "#,
    },
];

/// Run all pending migrations against the connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );

        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {e}", migration.name)))?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| StoreError::Migration(format!("record {}: {e}", migration.name)))?;
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("read version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("read version row: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("decode version: {e}"))),
        None => Ok(0),
    }
}
