//! Task service — the single funnel for every status-affecting operation.
//!
//! Submission, cancellation, force-retry, review resolution, retry/backoff
//! handling, and scheduler promotion all go through [`TaskService::commit`],
//! which pairs the store's compare-and-swap with event fan-out. Nothing else
//! in the crate mutates a task's status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TaskhubConfig;
use crate::error::{ConflictError, Error, NotFoundError, Result, ValidationError};
use crate::events::EventBroadcaster;
use crate::intent::IntentParser;
use crate::processors::{CancelRegistry, ProcessorOutput, ProcessorRegistry};
use crate::queue::{Lane, LaneQueues, RetryDecision, RetryPolicy};
use crate::scheduler::recurrence;
use crate::store::TaskStore;
use crate::tasks::model::{
    ExecutionStep, Page, Task, TaskFilter, TaskOutput, TaskPatch, TaskPriority,
};
use crate::tasks::state::TaskStatus;

/// Submission body for a new task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurring_pattern: Option<String>,
}

/// Patch body for pre-dispatch edits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTask {
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurring_pattern: Option<String>,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    lanes: Arc<LaneQueues>,
    registry: Arc<ProcessorRegistry>,
    parser: Arc<dyn IntentParser>,
    events: Arc<EventBroadcaster>,
    retry: RetryPolicy,
    cancels: CancelRegistry,
    confidence_threshold: f32,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ProcessorRegistry>,
        parser: Arc<dyn IntentParser>,
        config: &TaskhubConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            lanes: Arc::new(LaneQueues::new()),
            registry,
            parser,
            events: Arc::new(EventBroadcaster::new()),
            retry: RetryPolicy::new(config.retry.clone()),
            cancels: CancelRegistry::new(),
            confidence_threshold: config.intent.confidence_threshold,
        })
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn lanes(&self) -> &Arc<LaneQueues> {
        &self.lanes
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Intent used for routing: the parsed intent, unless confidence fell
    /// below the threshold (then the default processor handles it).
    pub fn routing_intent<'t>(&self, task: &'t Task) -> Option<&'t str> {
        task.parsed_intent
            .as_ref()
            .filter(|p| p.confidence >= self.confidence_threshold)
            .map(|p| p.intent.as_str())
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Validate, parse intent, persist, and (unless scheduled for later)
    /// route the task into its lane.
    pub async fn submit(&self, instance_id: &str, new_task: NewTask) -> Result<Task> {
        let description = new_task.description.trim().to_string();
        if description.is_empty() {
            return Err(ValidationError::EmptyDescription.into());
        }

        let priority = match new_task.priority.as_deref() {
            Some(raw) => TaskPriority::parse(raw)?,
            None => TaskPriority::default(),
        };

        if let Some(ref pattern) = new_task.recurring_pattern {
            recurrence::validate_pattern(pattern)?;
        }

        let now = Utc::now();
        let scheduled_for = match (new_task.scheduled_for, &new_task.recurring_pattern) {
            (Some(at), None) if at < now => {
                return Err(ValidationError::ScheduledInPast.into());
            }
            (Some(at), _) => Some(at),
            // A recurring task without an explicit start fires at the
            // pattern's next occurrence.
            (None, Some(pattern)) => recurrence::next_occurrence(pattern, now)?,
            (None, None) => None,
        };

        // Parser failure must never block submission: the task degrades to
        // an unparsed intent and the default processor.
        let parsed_intent = match self.parser.parse(&description).await {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(error = %e, "Intent parsing failed; routing to default processor");
                None
            }
        };

        let mut task = Task::new(instance_id, description)
            .with_priority(priority)
            .with_intent(parsed_intent)
            .with_schedule(scheduled_for)
            .with_recurrence(new_task.recurring_pattern.clone());

        let processor = self.registry.resolve(self.routing_intent(&task));
        task = task.with_max_retries(processor.max_retries());

        self.store.create(&task).await.map_err(Error::from)?;
        self.events.task_written(&task, &[]).await;

        info!(
            task_id = %task.id,
            instance_id = %task.instance_id,
            priority = %task.priority,
            intent = task.parsed_intent.as_ref().map(|p| p.intent.as_str()).unwrap_or("none"),
            "Task submitted"
        );

        // Future-scheduled tasks wait for the scheduler's promotion.
        if task.scheduled_for.is_none_or(|at| at <= now) {
            return self.enqueue(&task).await;
        }

        Ok(task)
    }

    /// CAS-promote a SUBMITTED task into its lane.
    ///
    /// Safe under concurrent schedulers: only the CAS winner injects the
    /// task, so replicas cannot double-dispatch.
    pub async fn enqueue(&self, task: &Task) -> Result<Task> {
        let queued = self
            .commit(
                task.id,
                task.version,
                &TaskPatch::status(TaskStatus::Queued).with_schedule(None),
            )
            .await?;

        self.lanes
            .push(Lane::for_priority(queued.priority), queued.id)
            .await;

        debug!(task_id = %queued.id, lane = Lane::for_priority(queued.priority).as_str(), "Task enqueued");
        Ok(queued)
    }

    /// Promote a retry-pending task whose synthetic due time has arrived.
    pub async fn promote_retry(&self, task: &Task) -> Result<Task> {
        let promoted = self
            .commit(
                task.id,
                task.version,
                &TaskPatch::default().with_schedule(None),
            )
            .await?;

        self.lanes
            .push(Lane::for_priority(promoted.priority), promoted.id)
            .await;

        debug!(task_id = %promoted.id, retry_count = promoted.retry_count, "Retry promoted to lane");
        Ok(promoted)
    }

    /// Re-inject persisted QUEUED tasks into lanes after a restart. Lane
    /// contents do not survive a crash; the store does.
    pub async fn recover_queued(&self) -> Result<usize> {
        let queued = self.store.list_queued().await.map_err(Error::from)?;
        let count = queued.len();

        for task in queued {
            self.lanes
                .push(Lane::for_priority(task.priority), task.id)
                .await;
        }

        if count > 0 {
            info!(count, "Recovered queued tasks into lanes");
        }
        Ok(count)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.store
            .get(id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| NotFoundError::Task { id }.into())
    }

    pub async fn list(
        &self,
        instance_id: &str,
        filter: &TaskFilter,
        page: &Page,
    ) -> Result<Vec<Task>> {
        self.store
            .list(instance_id, filter, page)
            .await
            .map_err(Error::from)
    }

    // ── User actions ────────────────────────────────────────────────

    /// Cancel a task. Conflicts once it has entered REVIEW or a terminal
    /// state; the caller treats the conflict as a no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<Task> {
        let task = self.get(id).await?;

        if !task.status.is_cancellable() {
            return Err(ConflictError::NotCancellable {
                id,
                status: task.status,
            }
            .into());
        }

        let cancelled = self
            .commit(
                id,
                task.version,
                &TaskPatch::status(TaskStatus::Cancelled)
                    .with_step(ExecutionStep::completed("cancelled by user", None)),
            )
            .await?;

        // Nudge the running attempt, if any; its later writes lose the CAS
        // race regardless.
        self.cancels.cancel(id).await;

        info!(task_id = %id, "Task cancelled");
        Ok(cancelled)
    }

    /// Force a retry of a dead-lettered task, resetting its budget. The
    /// only path past the retry-exhaustion guard.
    pub async fn force_retry(&self, id: Uuid) -> Result<Task> {
        let task = self.get(id).await?;

        if !task.status.can_force_retry() {
            return Err(ConflictError::NotRetryable {
                id,
                status: task.status,
            }
            .into());
        }

        let mut patch = TaskPatch::status(TaskStatus::Queued)
            .with_retry_count(0)
            .with_schedule(None)
            .with_step(ExecutionStep::completed("retry forced by user", None));
        patch.force_retry = true;
        patch.error_message = Some(None);

        let requeued = self.commit(id, task.version, &patch).await?;

        self.lanes
            .push(Lane::for_priority(requeued.priority), requeued.id)
            .await;

        info!(task_id = %id, "Forced retry");
        Ok(requeued)
    }

    /// Resolve a task parked in REVIEW: approve to COMPLETED or decline to
    /// REJECTED.
    pub async fn review(&self, id: Uuid, approved: bool, note: Option<String>) -> Result<Task> {
        let task = self.get(id).await?;

        if task.status != TaskStatus::Review {
            return Err(ConflictError::NotInReview {
                id,
                status: task.status,
            }
            .into());
        }

        let resolved = if approved {
            let completed = self
                .commit(
                    id,
                    task.version,
                    &TaskPatch::status(TaskStatus::Completed)
                        .with_progress(100)
                        .with_step(ExecutionStep::completed("review approved", note)),
                )
                .await?;
            self.spawn_next_occurrence(&completed).await;
            completed
        } else {
            let message = note.unwrap_or_else(|| "output rejected by reviewer".to_string());
            self.commit(
                id,
                task.version,
                &TaskPatch::status(TaskStatus::Rejected)
                    .with_error(message.clone())
                    .with_step(ExecutionStep::failed("review rejected", message)),
            )
            .await?
        };

        info!(task_id = %id, approved, "Review resolved");
        Ok(resolved)
    }

    /// Patch priority / scheduling fields. Priority may change until a
    /// worker dequeues the task; scheduling fields only while it is still
    /// SUBMITTED (a queued task already sits in a lane).
    pub async fn update(&self, id: Uuid, update: UpdateTask) -> Result<Task> {
        let task = self.get(id).await?;

        if task.status.is_dispatched() {
            return Err(ConflictError::AlreadyDispatched {
                id,
                status: task.status,
            }
            .into());
        }

        let mut patch = TaskPatch::default();

        if let Some(ref raw) = update.priority {
            patch.priority = Some(TaskPriority::parse(raw)?);
        }

        if update.scheduled_for.is_some() || update.recurring_pattern.is_some() {
            if task.status != TaskStatus::Submitted {
                return Err(ConflictError::AlreadyDispatched {
                    id,
                    status: task.status,
                }
                .into());
            }
            if let Some(at) = update.scheduled_for {
                if at < Utc::now() && update.recurring_pattern.is_none() {
                    return Err(ValidationError::ScheduledInPast.into());
                }
                patch.scheduled_for = Some(Some(at));
            }
            if let Some(ref pattern) = update.recurring_pattern {
                recurrence::validate_pattern(pattern)?;
                patch.recurring_pattern = Some(Some(pattern.clone()));
            }
        }

        self.commit(id, task.version, &patch).await
    }

    /// Soft-delete a terminal task.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let task = self.get(id).await?;

        if !task.status.is_terminal() {
            return Err(ConflictError::NotTerminal {
                id,
                status: task.status,
            }
            .into());
        }

        self.store.soft_delete(id).await.map_err(Error::from)?;
        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    // ── Attempt outcomes (worker + watchdog entry points) ───────────

    /// Record a successful attempt: park in REVIEW with the output, then
    /// auto-complete unless the processor asked for a human decision.
    pub async fn complete_attempt(
        &self,
        task: &Task,
        output: ProcessorOutput,
    ) -> Result<Task> {
        let requires_review = output.requires_review;

        let reviewed = self
            .commit(
                task.id,
                task.version,
                &TaskPatch::status(TaskStatus::Review)
                    .with_progress(100)
                    .with_output(TaskOutput {
                        format: output.format,
                        data: output.data,
                        media_refs: output.media_refs,
                    })
                    .with_step(ExecutionStep::completed("execution finished", None)),
            )
            .await?;

        if requires_review {
            debug!(task_id = %reviewed.id, "Task parked for review");
            return Ok(reviewed);
        }

        let completed = self
            .commit(
                reviewed.id,
                reviewed.version,
                &TaskPatch::status(TaskStatus::Completed)
                    .with_step(ExecutionStep::completed("completed", None)),
            )
            .await?;

        self.spawn_next_occurrence(&completed).await;
        Ok(completed)
    }

    /// Record a transient failure and decide its fate: immediate requeue,
    /// retry-pending with a synthetic due time, or dead-letter.
    ///
    /// The budget counts failed attempts: the failure that brings
    /// `retry_count` up to `max_retries` dead-letters the task.
    pub async fn fail_transient(&self, task: &Task, message: &str) -> Result<Task> {
        let step = ExecutionStep::failed("attempt failed", message);

        if task.retries_exhausted() {
            // Dead-letter guard for redundant reports (e.g. watchdog racing
            // the worker's own failure write).
            return self.dead_letter(task, message, step).await;
        }

        let new_count = task.retry_count + 1;
        if new_count >= task.max_retries {
            let failed = self
                .commit(
                    task.id,
                    task.version,
                    &TaskPatch::status(TaskStatus::Failed)
                        .with_retry_count(new_count)
                        .with_error(message)
                        .with_step(step),
                )
                .await?;
            warn!(task_id = %failed.id, retry_count = failed.retry_count, "Retry budget exhausted; task dead-lettered");
            return Ok(failed);
        }

        match self.retry.decide(task) {
            RetryDecision::RetryNow => {
                let requeued = self
                    .commit(
                        task.id,
                        task.version,
                        &TaskPatch::status(TaskStatus::Queued)
                            .with_retry_count(new_count)
                            .with_error(message)
                            .with_schedule(None)
                            .with_step(step),
                    )
                    .await?;
                self.lanes
                    .push(Lane::for_priority(requeued.priority), requeued.id)
                    .await;
                info!(task_id = %requeued.id, retry_count = new_count, "Transient failure; requeued immediately");
                Ok(requeued)
            }
            RetryDecision::RetryAfter(delay) => {
                let due = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                let parked = self
                    .commit(
                        task.id,
                        task.version,
                        &TaskPatch::status(TaskStatus::Queued)
                            .with_retry_count(new_count)
                            .with_error(message)
                            .with_schedule(Some(due))
                            .with_step(step),
                    )
                    .await?;
                info!(
                    task_id = %parked.id,
                    retry_count = new_count,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure; retry scheduled"
                );
                Ok(parked)
            }
            RetryDecision::GiveUp => self.dead_letter(task, message, step).await,
        }
    }

    /// Record a permanent failure: straight to FAILED, no retry.
    pub async fn fail_permanent(&self, task: &Task, message: &str) -> Result<Task> {
        let failed = self
            .commit(
                task.id,
                task.version,
                &TaskPatch::status(TaskStatus::Failed)
                    .with_error(message)
                    .with_step(ExecutionStep::failed("attempt failed permanently", message)),
            )
            .await?;

        warn!(task_id = %failed.id, "Permanent failure");
        Ok(failed)
    }

    async fn dead_letter(
        &self,
        task: &Task,
        message: &str,
        step: ExecutionStep,
    ) -> Result<Task> {
        let failed = self
            .commit(
                task.id,
                task.version,
                &TaskPatch::status(TaskStatus::Failed)
                    .with_error(message)
                    .with_step(step),
            )
            .await?;
        warn!(task_id = %failed.id, "Task dead-lettered");
        Ok(failed)
    }

    /// On completion of a recurring occurrence, create the next one as a
    /// fresh task linked by `parent_task_id` — the finished record stays
    /// untouched.
    async fn spawn_next_occurrence(&self, completed: &Task) {
        let Some(ref pattern) = completed.recurring_pattern else {
            return;
        };

        let next = match recurrence::next_occurrence(pattern, Utc::now()) {
            Ok(Some(at)) => at,
            Ok(None) => {
                debug!(task_id = %completed.id, "Recurrence has no further occurrences");
                return;
            }
            Err(e) => {
                warn!(task_id = %completed.id, error = %e, "Stored recurrence pattern no longer parses");
                return;
            }
        };

        let child = Task::new(&completed.instance_id, &completed.description)
            .with_priority(completed.priority)
            .with_intent(completed.parsed_intent.clone())
            .with_schedule(Some(next))
            .with_recurrence(Some(pattern.clone()))
            .with_max_retries(completed.max_retries)
            .with_parent(completed.id);

        match self.store.create(&child).await {
            Ok(()) => {
                self.events.task_written(&child, &[]).await;
                info!(
                    parent_id = %completed.id,
                    child_id = %child.id,
                    next = %next,
                    "Spawned next recurring occurrence"
                );
            }
            Err(e) => {
                warn!(parent_id = %completed.id, error = %e, "Failed to spawn next occurrence");
            }
        }
    }

    // ── The funnel ──────────────────────────────────────────────────

    /// CAS plus event fan-out. Every status mutation in the crate lands
    /// here.
    pub(crate) async fn commit(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &TaskPatch,
    ) -> Result<Task> {
        let task = self
            .store
            .compare_and_swap(id, expected_version, patch)
            .await
            .map_err(Error::from)?;

        self.events.task_written(&task, &patch.append_steps).await;
        Ok(task)
    }
}
