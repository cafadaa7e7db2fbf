//! `TaskStore` trait — single async interface for task persistence.
//!
//! Every status-affecting write funnels through [`TaskStore::compare_and_swap`];
//! no other path may mutate a persisted task. Callers that lose the version
//! race re-read and retry (or treat the conflict as a no-op).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::tasks::model::{Page, Task, TaskFilter, TaskPatch};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a freshly submitted task (version 0).
    async fn create(&self, task: &Task) -> Result<(), StoreError>;

    /// Fetch a task by id. Soft-deleted tasks are not returned.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// List an instance's tasks with filters and stable (created_at, id)
    /// ordering for cursorless pagination.
    async fn list(
        &self,
        instance_id: &str,
        filter: &TaskFilter,
        page: &Page,
    ) -> Result<Vec<Task>, StoreError>;

    /// Apply `patch` iff the stored version equals `expected_version`.
    ///
    /// Returns the updated task. Fails with `VersionConflict` on a stale
    /// version and `IllegalTransition` when the patch violates the state
    /// graph. This is the single serialization point for status mutations.
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &TaskPatch,
    ) -> Result<Task, StoreError>;

    /// Submitted tasks whose `scheduled_for` is at or before `now`.
    async fn list_due_submitted(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Retry-pending tasks: queued with a `scheduled_for` at or before `now`.
    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// All queued tasks with no pending due time (startup lane recovery).
    async fn list_queued(&self) -> Result<Vec<Task>, StoreError>;

    /// In-progress tasks whose attempt started before `cutoff` (watchdog).
    async fn list_overrunning(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Soft-delete a task. Returns false if it did not exist.
    async fn soft_delete(&self, id: Uuid) -> Result<bool, StoreError>;
}
