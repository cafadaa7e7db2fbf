//! Per-task worker execution.
//!
//! A worker dequeues a task id, claims the task through the CAS funnel, and
//! drives it QUEUED -> PLANNING -> ASSIGNED -> IN_PROGRESS, then hands the
//! processor outcome back to the service. Any CAS conflict along the way
//! means a concurrent cancel (or a watchdog reclaim) won; the worker drops
//! the attempt and moves on.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{ConflictError, Error};
use crate::processors::{ExecutionContext, ProcessorError};
use crate::tasks::model::{ExecutionStep, Task, TaskPatch};
use crate::tasks::service::TaskService;
use crate::tasks::state::TaskStatus;

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub service: Arc<TaskService>,
    pub config: WorkerConfig,
}

/// One worker in the pool.
pub struct Worker {
    worker_id: usize,
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(worker_id: usize, deps: WorkerDeps) -> Self {
        Self { worker_id, deps }
    }

    fn service(&self) -> &Arc<TaskService> {
        &self.deps.service
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(worker_id = self.worker_id, "Worker started");
        let mut cycle: u64 = 0;

        loop {
            let popped = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(worker_id = self.worker_id, "Worker shutting down");
                    return;
                }
                popped = self
                    .service()
                    .lanes()
                    .pop_weighted(cycle, self.deps.config.dequeue_timeout) => popped,
            };
            cycle = cycle.wrapping_add(1);

            let Some((lane, task_id)) = popped else {
                continue; // idle timeout, re-poll with the next cycle's order
            };

            debug!(worker_id = self.worker_id, task_id = %task_id, lane = lane.as_str(), "Dequeued task");

            if let Err(e) = self.process_one(task_id).await {
                match e {
                    // Lost a CAS race: the task was cancelled, reclaimed, or
                    // redelivered. Someone else owns it now.
                    Error::Conflict(_) => {
                        debug!(worker_id = self.worker_id, task_id = %task_id, "Dropped attempt after losing transition race");
                    }
                    Error::NotFound(_) => {
                        debug!(worker_id = self.worker_id, task_id = %task_id, "Dequeued task no longer exists");
                    }
                    other => {
                        warn!(worker_id = self.worker_id, task_id = %task_id, error = %other, "Attempt failed with store error");
                    }
                }
            }
        }
    }

    /// Drive one dequeued task through an execution attempt.
    async fn process_one(&self, task_id: uuid::Uuid) -> crate::error::Result<()> {
        let service = self.service();
        let task = service.get(task_id).await?;

        // Claim. A task whose version moved since enqueue (cancel, watchdog
        // requeue) fails here and is skipped.
        if task.status != TaskStatus::Queued || task.is_retry_pending() {
            return Err(ConflictError::StaleVersion { id: task_id }.into());
        }
        let planning = service
            .commit(task.id, task.version, &TaskPatch::status(TaskStatus::Planning))
            .await?;

        // Resolve the processor for this intent.
        let processor = service
            .registry()
            .resolve(service.routing_intent(&planning));
        let assigned = service
            .commit(
                planning.id,
                planning.version,
                &TaskPatch::status(TaskStatus::Assigned).with_step(ExecutionStep::completed(
                    "processor assigned",
                    Some(processor.intent().to_string()),
                )),
            )
            .await?;

        // Start the attempt.
        let running = service
            .commit(
                assigned.id,
                assigned.version,
                &TaskPatch::status(TaskStatus::InProgress)
                    .with_step(ExecutionStep::started("execution started")),
            )
            .await?;

        let token = service.cancels().register(running.id).await;
        let ctx = ExecutionContext::new(
            running.clone(),
            Arc::clone(service.store()),
            Arc::clone(service.events()),
            token,
        );

        let result = processor.execute(&ctx).await;

        service.cancels().unregister(running.id).await;

        // Continue from the context's last successful write, not the
        // pre-execution snapshot: progress reports bumped the version.
        let latest = ctx.task().await;
        self.finish_attempt(latest, result).await
    }

    async fn finish_attempt(
        &self,
        task: Task,
        result: Result<crate::processors::ProcessorOutput, ProcessorError>,
    ) -> crate::error::Result<()> {
        let service = self.service();

        match result {
            Ok(output) => {
                let done = service.complete_attempt(&task, output).await?;
                info!(
                    worker_id = self.worker_id,
                    task_id = %done.id,
                    status = %done.status,
                    "Attempt finished"
                );
                Ok(())
            }
            Err(ProcessorError::Transient { message }) => {
                let after = service.fail_transient(&task, &message).await?;
                debug!(
                    worker_id = self.worker_id,
                    task_id = %after.id,
                    status = %after.status,
                    "Transient failure handled"
                );
                Ok(())
            }
            Err(ProcessorError::Permanent { message }) => {
                service.fail_permanent(&task, &message).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskhubConfig;
    use crate::intent::KeywordIntentParser;
    use crate::processors::{Processor, ProcessorOutput, ProcessorRegistry};
    use crate::store::LibSqlStore;
    use crate::tasks::service::NewTask;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Processor that succeeds after a configurable number of transient
    /// failures.
    struct FlakyProcessor {
        intent: &'static str,
        failures_left: AtomicU32,
        max_retries: u32,
    }

    #[async_trait]
    impl Processor for FlakyProcessor {
        fn intent(&self) -> &str {
            self.intent
        }

        fn max_retries(&self) -> u32 {
            self.max_retries
        }

        async fn execute(
            &self,
            ctx: &ExecutionContext,
        ) -> Result<ProcessorOutput, ProcessorError> {
            ctx.report_progress(10, "starting").await?;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProcessorError::transient("simulated outage"));
            }
            ctx.report_progress(90, "wrapping up").await?;
            Ok(ProcessorOutput::text("done"))
        }
    }

    async fn harness(processor: Arc<dyn Processor>) -> (Arc<TaskService>, WorkerDeps) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mut registry = ProcessorRegistry::new();
        registry.register(processor);

        let mut config = TaskhubConfig::default();
        // Keep test retries in-lane rather than scheduler-deferred.
        config.retry.base_delay = std::time::Duration::from_millis(1);
        config.retry.jitter = std::time::Duration::from_millis(1);
        config.retry.immediate_threshold = std::time::Duration::from_secs(1);

        let service = TaskService::new(
            store,
            Arc::new(registry),
            Arc::new(KeywordIntentParser::new()),
            &config,
        );
        let deps = WorkerDeps {
            service: Arc::clone(&service),
            config: config.worker.clone(),
        };
        (service, deps)
    }

    async fn wait_for_status(
        service: &Arc<TaskService>,
        id: uuid::Uuid,
        status: TaskStatus,
    ) -> Task {
        for _ in 0..200 {
            let task = service.get(id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn worker_completes_a_clean_task() {
        let (service, deps) = harness(Arc::new(FlakyProcessor {
            intent: "content_generation",
            failures_left: AtomicU32::new(0),
            max_retries: 3,
        }))
        .await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = Worker::new(0, deps);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        let task = service
            .submit(
                "acme",
                NewTask {
                    description: "write a caption".into(),
                    priority: None,
                    scheduled_for: None,
                    recurring_pattern: None,
                },
            )
            .await
            .unwrap();

        let done = wait_for_status(&service, task.id, TaskStatus::Completed).await;
        assert_eq!(done.retry_count, 0);
        assert_eq!(done.progress_percentage, 100);
        assert_eq!(done.output_format.as_deref(), Some("text"));
        // The attempt left an auditable trail.
        assert!(done.execution_steps.iter().any(|s| s.step == "processor assigned"));
        assert!(done.execution_steps.iter().any(|s| s.step == "execution started"));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn worker_retries_then_dead_letters() {
        let (service, deps) = harness(Arc::new(FlakyProcessor {
            intent: "content_generation",
            failures_left: AtomicU32::new(u32::MAX),
            max_retries: 3,
        }))
        .await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Worker::new(0, deps).run(shutdown_rx));

        let task = service
            .submit(
                "acme",
                NewTask {
                    description: "write a caption".into(),
                    priority: None,
                    scheduled_for: None,
                    recurring_pattern: None,
                },
            )
            .await
            .unwrap();

        let failed = wait_for_status(&service, task.id, TaskStatus::Failed).await;
        assert_eq!(failed.retry_count, 3);
        assert!(failed.retry_count <= failed.max_retries);
        assert_eq!(failed.error_message.as_deref(), Some("simulated outage"));
        // One failure step per failed attempt.
        let failures = failed
            .execution_steps
            .iter()
            .filter(|s| s.step == "attempt failed")
            .count();
        assert_eq!(failures, 3);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn worker_fails_permanently_without_retry() {
        struct Hopeless;

        #[async_trait]
        impl Processor for Hopeless {
            fn intent(&self) -> &str {
                "content_generation"
            }
            async fn execute(
                &self,
                _ctx: &ExecutionContext,
            ) -> Result<ProcessorOutput, ProcessorError> {
                Err(ProcessorError::permanent("unsupported request"))
            }
        }

        let (service, deps) = harness(Arc::new(Hopeless)).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Worker::new(0, deps).run(shutdown_rx));

        let task = service
            .submit(
                "acme",
                NewTask {
                    description: "write a caption".into(),
                    priority: None,
                    scheduled_for: None,
                    recurring_pattern: None,
                },
            )
            .await
            .unwrap();

        let failed = wait_for_status(&service, task.id, TaskStatus::Failed).await;
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.error_message.as_deref(), Some("unsupported request"));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
