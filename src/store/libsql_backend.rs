//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text so range predicates compare lexicographically;
//! structured sub-objects (intent, steps, output) live in JSON text columns.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::{
    ExecutionStep, Page, ParsedIntent, Task, TaskFilter, TaskPatch, TaskPriority,
};
use crate::tasks::state::TaskStatus;

/// libSQL task store.
///
/// Holds a single connection reused for all operations; `libsql::Connection`
/// is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Pool(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Task store opened");

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 so text comparison matches
/// chronological order.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Column order shared by every SELECT against `tasks`.
const TASK_COLUMNS: &str = "id, instance_id, description, parsed_intent, priority, status, \
     progress, execution_steps, scheduled_for, recurring_pattern, output_format, output_data, \
     output_media_refs, processing_started_at, processing_ended_at, retry_count, max_retries, \
     error_message, parent_task_id, created_at, updated_at, deleted_at, version";

fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id_str: String = row.get(0).map_err(query_err)?;
    let instance_id: String = row.get(1).map_err(query_err)?;
    let description: String = row.get(2).map_err(query_err)?;
    let parsed_intent_str: Option<String> = row.get::<String>(3).ok();
    let priority_str: String = row.get(4).map_err(query_err)?;
    let status_str: String = row.get(5).map_err(query_err)?;
    let progress: i64 = row.get(6).map_err(query_err)?;
    let steps_str: String = row.get(7).map_err(query_err)?;
    let scheduled_for: Option<String> = row.get::<String>(8).ok();
    let recurring_pattern: Option<String> = row.get::<String>(9).ok();
    let output_format: Option<String> = row.get::<String>(10).ok();
    let output_data_str: Option<String> = row.get::<String>(11).ok();
    let media_refs_str: String = row.get(12).map_err(query_err)?;
    let processing_started_at: Option<String> = row.get::<String>(13).ok();
    let processing_ended_at: Option<String> = row.get::<String>(14).ok();
    let retry_count: i64 = row.get(15).map_err(query_err)?;
    let max_retries: i64 = row.get(16).map_err(query_err)?;
    let error_message: Option<String> = row.get::<String>(17).ok();
    let parent_str: Option<String> = row.get::<String>(18).ok();
    let created_at: String = row.get(19).map_err(query_err)?;
    let updated_at: String = row.get(20).map_err(query_err)?;
    let deleted_at: Option<String> = row.get::<String>(21).ok();
    let version: i64 = row.get(22).map_err(query_err)?;

    let parsed_intent: Option<ParsedIntent> = match parsed_intent_str {
        Some(ref s) => Some(
            serde_json::from_str(s)
                .map_err(|e| StoreError::Serialization(format!("parsed_intent: {e}")))?,
        ),
        None => None,
    };

    let execution_steps: Vec<ExecutionStep> = serde_json::from_str(&steps_str)
        .map_err(|e| StoreError::Serialization(format!("execution_steps: {e}")))?;

    let output_data: Option<serde_json::Value> = match output_data_str {
        Some(ref s) => Some(
            serde_json::from_str(s)
                .map_err(|e| StoreError::Serialization(format!("output_data: {e}")))?,
        ),
        None => None,
    };

    let output_media_refs: Vec<String> = serde_json::from_str(&media_refs_str)
        .map_err(|e| StoreError::Serialization(format!("output_media_refs: {e}")))?;

    Ok(Task {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        instance_id,
        description,
        parsed_intent,
        priority: TaskPriority::parse(&priority_str).unwrap_or_default(),
        status: TaskStatus::parse(&status_str)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        progress_percentage: progress.clamp(0, 100) as u8,
        execution_steps,
        scheduled_for: parse_optional_datetime(&scheduled_for),
        recurring_pattern,
        output_format,
        output_data,
        output_media_refs,
        processing_started_at: parse_optional_datetime(&processing_started_at),
        processing_ended_at: parse_optional_datetime(&processing_ended_at),
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        error_message,
        parent_task_id: parent_str.and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
        deleted_at: parse_optional_datetime(&deleted_at),
        version,
    })
}

fn json_or_err<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let parsed_intent = task
            .parsed_intent
            .as_ref()
            .map(|i| json_or_err(i, "parsed_intent"))
            .transpose()?;
        let steps = json_or_err(&task.execution_steps, "execution_steps")?;
        let media_refs = json_or_err(&task.output_media_refs, "output_media_refs")?;
        let output_data = task
            .output_data
            .as_ref()
            .map(|v| json_or_err(v, "output_data"))
            .transpose()?;

        self.conn()
            .execute(
                "INSERT INTO tasks (id, instance_id, description, parsed_intent, priority, \
                 status, progress, execution_steps, scheduled_for, recurring_pattern, \
                 output_format, output_data, output_media_refs, processing_started_at, \
                 processing_ended_at, retry_count, max_retries, error_message, parent_task_id, \
                 created_at, updated_at, deleted_at, version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                params![
                    task.id.to_string(),
                    task.instance_id.clone(),
                    task.description.clone(),
                    opt_text(parsed_intent),
                    task.priority.as_str(),
                    task.status.as_str(),
                    task.progress_percentage as i64,
                    steps,
                    opt_text(task.scheduled_for.as_ref().map(fmt_datetime)),
                    opt_text(task.recurring_pattern.clone()),
                    opt_text(task.output_format.clone()),
                    opt_text(output_data),
                    media_refs,
                    opt_text(task.processing_started_at.as_ref().map(fmt_datetime)),
                    opt_text(task.processing_ended_at.as_ref().map(fmt_datetime)),
                    task.retry_count as i64,
                    task.max_retries as i64,
                    opt_text(task.error_message.clone()),
                    opt_text(task.parent_task_id.map(|p| p.to_string())),
                    fmt_datetime(&task.created_at),
                    fmt_datetime(&task.updated_at),
                    opt_text(task.deleted_at.as_ref().map(fmt_datetime)),
                    task.version,
                ],
            )
            .await
            .map_err(query_err)?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND deleted_at IS NULL"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        instance_id: &str,
        filter: &TaskFilter,
        page: &Page,
    ) -> Result<Vec<Task>, StoreError> {
        use libsql::Value;

        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE instance_id = ? AND deleted_at IS NULL"
        );
        let mut values: Vec<Value> = vec![Value::Text(instance_id.to_string())];

        if !filter.statuses.is_empty() {
            let placeholders = vec!["?"; filter.statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({placeholders})"));
            for status in &filter.statuses {
                values.push(Value::Text(status.as_str().to_string()));
            }
        }
        if let Some(priority) = filter.priority {
            sql.push_str(" AND priority = ?");
            values.push(Value::Text(priority.as_str().to_string()));
        }
        if let Some(from) = filter.created_from {
            sql.push_str(" AND created_at >= ?");
            values.push(Value::Text(fmt_datetime(&from)));
        }
        if let Some(to) = filter.created_to {
            sql.push_str(" AND created_at <= ?");
            values.push(Value::Text(fmt_datetime(&to)));
        }
        if let Some(from) = filter.scheduled_from {
            sql.push_str(" AND scheduled_for >= ?");
            values.push(Value::Text(fmt_datetime(&from)));
        }
        if let Some(to) = filter.scheduled_to {
            sql.push_str(" AND scheduled_for <= ?");
            values.push(Value::Text(fmt_datetime(&to)));
        }

        sql.push_str(" ORDER BY created_at, id LIMIT ? OFFSET ?");
        values.push(Value::Integer(page.limit as i64));
        values.push(Value::Integer(page.offset as i64));

        let mut rows = self
            .conn()
            .query(&sql, values)
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &TaskPatch,
    ) -> Result<Task, StoreError> {
        let current = self.get(id).await?.ok_or(StoreError::NotFound { id })?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version,
            });
        }

        // Transition legality, progress monotonicity, and lifecycle
        // timestamps are all enforced by the pure patch application.
        let next = current.apply_patch(patch)?;

        let steps = json_or_err(&next.execution_steps, "execution_steps")?;
        let media_refs = json_or_err(&next.output_media_refs, "output_media_refs")?;
        let output_data = next
            .output_data
            .as_ref()
            .map(|v| json_or_err(v, "output_data"))
            .transpose()?;

        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET priority = ?1, status = ?2, progress = ?3, \
                 execution_steps = ?4, scheduled_for = ?5, recurring_pattern = ?6, \
                 output_format = ?7, output_data = ?8, output_media_refs = ?9, \
                 processing_started_at = ?10, processing_ended_at = ?11, retry_count = ?12, \
                 error_message = ?13, updated_at = ?14, version = ?15 \
                 WHERE id = ?16 AND version = ?17 AND deleted_at IS NULL",
                params![
                    next.priority.as_str(),
                    next.status.as_str(),
                    next.progress_percentage as i64,
                    steps,
                    opt_text(next.scheduled_for.as_ref().map(fmt_datetime)),
                    opt_text(next.recurring_pattern.clone()),
                    opt_text(next.output_format.clone()),
                    opt_text(output_data),
                    media_refs,
                    opt_text(next.processing_started_at.as_ref().map(fmt_datetime)),
                    opt_text(next.processing_ended_at.as_ref().map(fmt_datetime)),
                    next.retry_count as i64,
                    opt_text(next.error_message.clone()),
                    fmt_datetime(&next.updated_at),
                    next.version,
                    id.to_string(),
                    expected_version,
                ],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            // Lost the race between our read and the guarded write.
            let actual = self
                .get(id)
                .await?
                .map(|t| t.version)
                .ok_or(StoreError::NotFound { id })?;
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual,
            });
        }

        Ok(next)
    }

    async fn list_due_submitted(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'submitted' AND deleted_at IS NULL \
                     AND (scheduled_for IS NULL OR scheduled_for <= ?1) \
                     ORDER BY created_at, id LIMIT ?2"
                ),
                params![fmt_datetime(&now), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'queued' AND deleted_at IS NULL \
                     AND scheduled_for IS NOT NULL AND scheduled_for <= ?1 \
                     ORDER BY scheduled_for, id LIMIT ?2"
                ),
                params![fmt_datetime(&now), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_queued(&self) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'queued' AND deleted_at IS NULL \
                     AND (scheduled_for IS NULL OR scheduled_for <= ?1) \
                     ORDER BY created_at, id"
                ),
                params![fmt_datetime(&Utc::now())],
            )
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_overrunning(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'in_progress' AND deleted_at IS NULL \
                     AND processing_started_at IS NOT NULL AND processing_started_at <= ?1 \
                     ORDER BY processing_started_at, id"
                ),
                params![fmt_datetime(&cutoff)],
            )
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![fmt_datetime(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err)?;

        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::TaskPatch;
    use chrono::Duration;

    async fn memory_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = memory_store().await;
        let task = Task::new("acme", "write a launch post")
            .with_priority(TaskPriority::Urgent)
            .with_intent(Some(ParsedIntent {
                intent: "content_generation".into(),
                entities: Default::default(),
                confidence: 0.9,
            }));

        store.create(&task).await.unwrap();
        let fetched = store.get(task.id).await.unwrap().unwrap();

        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.instance_id, "acme");
        assert_eq!(fetched.priority, TaskPriority::Urgent);
        assert_eq!(fetched.status, TaskStatus::Submitted);
        assert_eq!(
            fetched.parsed_intent.as_ref().unwrap().intent,
            "content_generation"
        );
        assert_eq!(fetched.version, 0);
    }

    #[tokio::test]
    async fn get_unknown_returns_none() {
        let store = memory_store().await;
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_applies_patch_and_bumps_version() {
        let store = memory_store().await;
        let task = Task::new("acme", "x");
        store.create(&task).await.unwrap();

        let updated = store
            .compare_and_swap(
                task.id,
                0,
                &TaskPatch::status(TaskStatus::Queued)
                    .with_step(ExecutionStep::completed("enqueued", None)),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, TaskStatus::Queued);
        assert_eq!(updated.version, 1);

        let fetched = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.version, 1);
        assert_eq!(fetched.execution_steps.len(), 1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = memory_store().await;
        let task = Task::new("acme", "x");
        store.create(&task).await.unwrap();

        store
            .compare_and_swap(task.id, 0, &TaskPatch::status(TaskStatus::Queued))
            .await
            .unwrap();

        // Second writer still holds version 0.
        let err = store
            .compare_and_swap(task.id, 0, &TaskPatch::status(TaskStatus::Cancelled))
            .await
            .unwrap_err();
        match err {
            StoreError::VersionConflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The stale write left no trace.
        let fetched = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn cas_rejects_illegal_transition() {
        let store = memory_store().await;
        let task = Task::new("acme", "x");
        store.create(&task).await.unwrap();

        let err = store
            .compare_and_swap(task.id, 0, &TaskPatch::status(TaskStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let store = memory_store().await;
        for i in 0..5 {
            let task = Task::new("acme", format!("task {i}")).with_priority(if i % 2 == 0 {
                TaskPriority::Urgent
            } else {
                TaskPriority::Low
            });
            store.create(&task).await.unwrap();
        }
        // Another tenant's task must never show up.
        store.create(&Task::new("other", "hidden")).await.unwrap();

        let all = store
            .list("acme", &TaskFilter::default(), &Page::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        for pair in all.windows(2) {
            assert!(
                (pair[0].created_at, pair[0].id) <= (pair[1].created_at, pair[1].id),
                "listing must be ordered by (created_at, id)"
            );
        }

        let urgent = store
            .list(
                "acme",
                &TaskFilter {
                    priority: Some(TaskPriority::Urgent),
                    ..Default::default()
                },
                &Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(urgent.len(), 3);

        let paged = store
            .list("acme", &TaskFilter::default(), &Page::new(2, 2))
            .await
            .unwrap();
        assert_eq!(paged.len(), 2);
    }

    #[tokio::test]
    async fn due_scans_respect_schedule() {
        let store = memory_store().await;
        let now = Utc::now();

        let due = Task::new("acme", "due").with_schedule(Some(now - Duration::minutes(5)));
        let future = Task::new("acme", "future").with_schedule(Some(now + Duration::hours(1)));
        let unscheduled = Task::new("acme", "unscheduled");
        store.create(&due).await.unwrap();
        store.create(&future).await.unwrap();
        store.create(&unscheduled).await.unwrap();

        let found = store.list_due_submitted(now, 10).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|t| t.id).collect();
        assert!(ids.contains(&due.id));
        assert!(ids.contains(&unscheduled.id));
        assert!(!ids.contains(&future.id));
    }

    #[tokio::test]
    async fn due_retries_only_sees_scheduled_queued() {
        let store = memory_store().await;
        let now = Utc::now();

        let task = Task::new("acme", "retry me");
        store.create(&task).await.unwrap();
        store
            .compare_and_swap(
                task.id,
                0,
                &TaskPatch::status(TaskStatus::Queued)
                    .with_schedule(Some(now - Duration::seconds(1))),
            )
            .await
            .unwrap();

        let plain = Task::new("acme", "plain queued");
        store.create(&plain).await.unwrap();
        store
            .compare_and_swap(plain.id, 0, &TaskPatch::status(TaskStatus::Queued))
            .await
            .unwrap();

        let due = store.list_due_retries(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, task.id);
    }

    #[tokio::test]
    async fn soft_delete_hides_task() {
        let store = memory_store().await;
        let task = Task::new("acme", "x");
        store.create(&task).await.unwrap();

        assert!(store.soft_delete(task.id).await.unwrap());
        assert!(store.get(task.id).await.unwrap().is_none());
        // Idempotent: second delete reports nothing to do.
        assert!(!store.soft_delete(task.id).await.unwrap());

        let listed = store
            .list("acme", &TaskFilter::default(), &Page::default())
            .await
            .unwrap();
        assert!(listed.is_empty());
    }
}
