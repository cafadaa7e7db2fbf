//! Execution context — everything a processor may touch during an attempt.
//!
//! The context carries explicit per-attempt state; the task store behind
//! the CAS primitive is the only shared resource a processor can reach,
//! and only through the progress path here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::events::EventBroadcaster;
use crate::processors::ProcessorError;
use crate::store::TaskStore;
use crate::tasks::model::{ExecutionStep, StepStatus, Task, TaskPatch};
use crate::tasks::state::TaskStatus;

/// Cooperative cancellation flag for one execution attempt.
///
/// Firing the token is advisory; the authoritative cancel is the CAS write
/// to CANCELLED, which makes every later write from the attempt lose.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Tokens for currently running attempts, keyed by task id.
///
/// The cancel API fires a task's token after its CAS succeeds so a
/// cooperative processor can stop early instead of running to completion
/// and losing its final write.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: RwLock<HashMap<Uuid, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.write().await.insert(task_id, token.clone());
        token
    }

    pub async fn unregister(&self, task_id: Uuid) {
        self.tokens.write().await.remove(&task_id);
    }

    /// Fire the token for a running attempt, if any.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        match self.tokens.read().await.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }
}

/// Per-attempt context handed to `Processor::execute`.
pub struct ExecutionContext {
    task: Mutex<Task>,
    store: Arc<dyn TaskStore>,
    events: Arc<EventBroadcaster>,
    cancel: CancelToken,
}

impl ExecutionContext {
    pub fn new(
        task: Task,
        store: Arc<dyn TaskStore>,
        events: Arc<EventBroadcaster>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            task: Mutex::new(task),
            store,
            events,
            cancel,
        }
    }

    /// Snapshot of the task as of the last successful write.
    pub async fn task(&self) -> Task {
        self.task.lock().await.clone()
    }

    /// Version of the task snapshot (the worker's completion CAS continues
    /// from here).
    pub async fn version(&self) -> i64 {
        self.task.lock().await.version
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out of the attempt if cancellation was requested. Processors
    /// call this between steps.
    pub fn check_cancelled(&self) -> Result<(), ProcessorError> {
        if self.cancel.is_cancelled() {
            Err(ProcessorError::transient("attempt cancelled"))
        } else {
            Ok(())
        }
    }

    /// Step descriptions already completed in earlier deliveries of this
    /// attempt; idempotent processors use this to skip finished sub-steps.
    pub async fn completed_steps(&self) -> Vec<String> {
        self.task
            .lock()
            .await
            .execution_steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.step.clone())
            .collect()
    }

    /// Report progress and append a step record, CAS-guarded.
    ///
    /// A version conflict here usually means the task was cancelled or
    /// reclaimed by the watchdog; the attempt should stop, so the conflict
    /// surfaces as a transient error.
    pub async fn report_progress(
        &self,
        percentage: u8,
        step: impl Into<String>,
    ) -> Result<(), ProcessorError> {
        self.check_cancelled()?;

        let step = step.into();
        let mut guard = self.task.lock().await;
        let patch = TaskPatch::default()
            .with_progress(percentage)
            .with_step(ExecutionStep::started(step.clone()));

        let mut attempt = self
            .store
            .compare_and_swap(guard.id, guard.version, &patch)
            .await;

        // One refresh-and-retry: a concurrent progress write from a
        // redelivered attempt is benign as long as the task is still ours.
        if let Err(StoreError::VersionConflict { .. }) = attempt {
            match self.store.get(guard.id).await {
                Ok(Some(current)) if current.status == TaskStatus::InProgress => {
                    let version = current.version;
                    *guard = current;
                    attempt = self
                        .store
                        .compare_and_swap(guard.id, version, &patch)
                        .await;
                }
                _ => {
                    return Err(ProcessorError::transient(
                        "task is no longer in progress; stopping attempt",
                    ));
                }
            }
        }

        match attempt {
            Ok(updated) => {
                self.events.task_written(&updated, &patch.append_steps).await;
                *guard = updated;
                Ok(())
            }
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::IllegalTransition { .. }) => {
                Err(ProcessorError::transient(
                    "task is no longer in progress; stopping attempt",
                ))
            }
            Err(e) => Err(ProcessorError::transient(format!(
                "failed to persist progress: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use crate::tasks::model::TaskPatch;

    async fn in_progress_task(store: &LibSqlStore) -> Task {
        let task = Task::new("acme", "ctx test");
        store.create(&task).await.unwrap();
        let mut current = task;
        for status in [
            TaskStatus::Queued,
            TaskStatus::Planning,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
        ] {
            current = store
                .compare_and_swap(current.id, current.version, &TaskPatch::status(status))
                .await
                .unwrap();
        }
        current
    }

    #[tokio::test]
    async fn cancel_token_round_trip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn registry_fires_registered_token() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id).await;

        assert!(registry.cancel(id).await);
        assert!(token.is_cancelled());

        registry.unregister(id).await;
        assert!(!registry.cancel(id).await);
    }

    #[tokio::test]
    async fn report_progress_persists_and_advances_snapshot() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let events = Arc::new(EventBroadcaster::new());
        let task = in_progress_task(&store).await;
        let id = task.id;

        let store_dyn: Arc<dyn TaskStore> = store.clone();
        let ctx = ExecutionContext::new(task, store_dyn, events, CancelToken::new());
        ctx.report_progress(40, "halfway there").await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.progress_percentage, 40);
        assert_eq!(stored.execution_steps.len(), 1);
        assert_eq!(ctx.version().await, stored.version);
    }

    #[tokio::test]
    async fn report_progress_fails_once_cancelled() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let events = Arc::new(EventBroadcaster::new());
        let task = in_progress_task(&store).await;

        let token = CancelToken::new();
        let store_dyn: Arc<dyn TaskStore> = store.clone();
        let ctx = ExecutionContext::new(task, store_dyn, events, token.clone());

        token.cancel();
        let err = ctx.report_progress(10, "should not land").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn report_progress_stops_when_task_leaves_in_progress() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let events = Arc::new(EventBroadcaster::new());
        let task = in_progress_task(&store).await;

        let store_dyn: Arc<dyn TaskStore> = store.clone();
        let ctx = ExecutionContext::new(task.clone(), store_dyn, events, CancelToken::new());

        // A concurrent cancel wins the CAS race.
        store
            .compare_and_swap(task.id, task.version, &TaskPatch::status(TaskStatus::Cancelled))
            .await
            .unwrap();

        let err = ctx.report_progress(50, "too late").await.unwrap_err();
        assert!(err.is_transient());

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.progress_percentage, 0);
    }
}
