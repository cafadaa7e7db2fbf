//! Scheduler — fixed-interval scan promoting due tasks into the pipeline.
//!
//! Each scan promotes due SUBMITTED tasks and due retry-pending tasks, and
//! runs the in-progress watchdog. Every promotion is CAS-guarded, so
//! concurrent scheduler replicas cannot double-dispatch the same task: only
//! one promotion wins per task, losers see a version conflict and move on.
//! A failed promotion is logged and retried on the next scan — a due task
//! is never silently dropped.

pub mod recurrence;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{SchedulerConfig, WorkerConfig};
use crate::error::{Error, SchedulingError};
use crate::tasks::service::TaskService;

pub struct Scheduler {
    service: Arc<TaskService>,
    config: SchedulerConfig,
    /// Attempts running longer than this are reclaimed as transient
    /// failures.
    execution_deadline: Duration,
}

impl Scheduler {
    pub fn new(service: Arc<TaskService>, config: SchedulerConfig, worker: &WorkerConfig) -> Self {
        Self {
            service,
            config,
            execution_deadline: worker.execution_deadline,
        }
    }

    /// Run one full scan cycle. Public so tests can drive scans directly.
    pub async fn run_scan(&self) {
        self.promote_due_submitted().await;
        self.promote_due_retries().await;
        self.sweep_overrunning().await;
    }

    async fn promote_due_submitted(&self) {
        let due = match self
            .service
            .store()
            .list_due_submitted(Utc::now(), self.config.scan_batch)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Due-task scan failed");
                return;
            }
        };

        for task in due {
            match self.service.enqueue(&task).await {
                Ok(queued) => {
                    debug!(task_id = %queued.id, "Promoted due task to queue");
                }
                // Another replica (or a concurrent cancel) won the CAS.
                Err(Error::Conflict(_)) => {
                    debug!(task_id = %task.id, "Promotion lost CAS race; skipping");
                }
                Err(e) => {
                    let err = SchedulingError::promotion(task.id, &e);
                    warn!(error = %err, "Promotion failed; will retry next scan");
                }
            }
        }
    }

    async fn promote_due_retries(&self) {
        let due = match self
            .service
            .store()
            .list_due_retries(Utc::now(), self.config.scan_batch)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Retry-pending scan failed");
                return;
            }
        };

        for task in due {
            match self.service.promote_retry(&task).await {
                Ok(promoted) => {
                    debug!(task_id = %promoted.id, retry_count = promoted.retry_count, "Promoted retry to lane");
                }
                Err(Error::Conflict(_)) => {
                    debug!(task_id = %task.id, "Retry promotion lost CAS race; skipping");
                }
                Err(e) => {
                    let err = SchedulingError::promotion(task.id, &e);
                    warn!(error = %err, "Retry promotion failed; will retry next scan");
                }
            }
        }
    }

    /// Watchdog: attempts past the execution deadline are handed to the
    /// retry controller as transient failures. The stuck worker's later
    /// writes lose the CAS race.
    async fn sweep_overrunning(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.execution_deadline)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let overrunning = match self.service.store().list_overrunning(cutoff).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Watchdog scan failed");
                return;
            }
        };

        for task in overrunning {
            warn!(
                task_id = %task.id,
                started_at = ?task.processing_started_at,
                "Attempt exceeded execution deadline; reclaiming"
            );

            // Ask the (possibly stuck) attempt to stop, then reclaim.
            self.service.cancels().cancel(task.id).await;

            match self.service.fail_transient(&task, "execution deadline exceeded").await {
                Ok(_) => {}
                Err(Error::Conflict(_)) => {
                    debug!(task_id = %task.id, "Watchdog lost CAS race; attempt resolved itself");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Watchdog reclaim failed");
                }
            }
        }
    }
}

/// Spawn the scheduler background loop. The first tick fires immediately.
pub fn spawn_scheduler(scheduler: Arc<Scheduler>) -> JoinHandle<()> {
    let interval = scheduler.config.scan_interval;
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Scheduler started");
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            scheduler.run_scan().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskhubConfig;
    use crate::intent::KeywordIntentParser;
    use crate::processors::ProcessorRegistry;
    use crate::queue::Lane;
    use crate::store::LibSqlStore;
    use crate::tasks::model::{Task, TaskPatch};
    use crate::tasks::service::NewTask;
    use crate::tasks::state::TaskStatus;

    async fn harness() -> (Arc<TaskService>, Scheduler) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let config = TaskhubConfig::default();
        let service = TaskService::new(
            store,
            Arc::new(ProcessorRegistry::new()),
            Arc::new(KeywordIntentParser::new()),
            &config,
        );
        let scheduler = Scheduler::new(Arc::clone(&service), config.scheduler.clone(), &config.worker);
        (service, scheduler)
    }

    #[tokio::test]
    async fn due_submitted_task_is_promoted_once() {
        let (service, scheduler) = harness().await;

        let task = service
            .submit(
                "acme",
                NewTask {
                    description: "later".into(),
                    priority: None,
                    scheduled_for: Some(Utc::now() + chrono::Duration::milliseconds(30)),
                    recurring_pattern: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);

        // Not due yet: scan leaves it alone.
        scheduler.run_scan().await;
        assert_eq!(service.get(task.id).await.unwrap().status, TaskStatus::Submitted);

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        scheduler.run_scan().await;
        let promoted = service.get(task.id).await.unwrap();
        assert_eq!(promoted.status, TaskStatus::Queued);
        assert_eq!(service.lanes().lane_len(Lane::Normal).await, 1);

        // A second scan must not double-inject.
        scheduler.run_scan().await;
        assert_eq!(service.lanes().lane_len(Lane::Normal).await, 1);
    }

    #[tokio::test]
    async fn due_retry_pending_task_returns_to_lane() {
        let (service, scheduler) = harness().await;

        let task = Task::new("acme", "retry me").with_max_retries(5);
        service.store().create(&task).await.unwrap();
        let queued = service
            .commit(
                task.id,
                task.version,
                &TaskPatch::status(TaskStatus::Queued)
                    .with_schedule(Some(Utc::now() - chrono::Duration::seconds(1))),
            )
            .await
            .unwrap();
        assert!(queued.scheduled_for.is_some());

        scheduler.run_scan().await;

        let promoted = service.get(task.id).await.unwrap();
        assert!(promoted.scheduled_for.is_none());
        assert_eq!(service.lanes().lane_len(Lane::Normal).await, 1);
    }

    #[tokio::test]
    async fn watchdog_reclaims_overrunning_attempt() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mut config = TaskhubConfig::default();
        config.worker.execution_deadline = std::time::Duration::from_millis(10);
        let service = TaskService::new(
            store,
            Arc::new(ProcessorRegistry::new()),
            Arc::new(KeywordIntentParser::new()),
            &config,
        );
        let scheduler =
            Scheduler::new(Arc::clone(&service), config.scheduler.clone(), &config.worker);

        let task = Task::new("acme", "stuck").with_max_retries(5);
        service.store().create(&task).await.unwrap();
        let mut current = task;
        for status in [
            TaskStatus::Queued,
            TaskStatus::Planning,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
        ] {
            current = service
                .commit(current.id, current.version, &TaskPatch::status(status))
                .await
                .unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scheduler.run_scan().await;

        let reclaimed = service.get(current.id).await.unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(
            reclaimed.error_message.as_deref(),
            Some("execution deadline exceeded")
        );
    }

    #[tokio::test]
    async fn cancelled_scheduled_task_is_not_promoted() {
        let (service, scheduler) = harness().await;

        let task = service
            .submit(
                "acme",
                NewTask {
                    description: "cancel before due".into(),
                    priority: None,
                    scheduled_for: Some(Utc::now() + chrono::Duration::milliseconds(10)),
                    recurring_pattern: None,
                },
            )
            .await
            .unwrap();

        service.cancel(task.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        scheduler.run_scan().await;
        assert_eq!(
            service.get(task.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert!(service.lanes().is_empty().await);
    }
}
