//! Task model — the central entity and its patch primitive.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, ValidationError};
use crate::tasks::state::TaskStatus;

/// Priority of a task. Fixed mapping onto the three dispatch lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    Normal,
    Low,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(ValidationError::InvalidPriority(other.to_string())),
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured classification of a task's free-text description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedIntent {
    pub intent: String,
    #[serde(default)]
    pub entities: HashMap<String, serde_json::Value>,
    pub confidence: f32,
}

/// Outcome of one sub-step within an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

/// An immutable, appended record of sub-progress within a task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionStep {
    pub fn started(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Started,
            output: None,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(step: impl Into<String>, output: Option<String>) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Completed,
            output,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(step: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Failed,
            output: Some(output.into()),
            timestamp: Utc::now(),
        }
    }
}

/// The central task entity. Mutated exclusively through [`Task::apply_patch`],
/// reached via the store's compare-and-swap primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub instance_id: String,
    pub description: String,
    pub parsed_intent: Option<ParsedIntent>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub execution_steps: Vec<ExecutionStep>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub recurring_pattern: Option<String>,
    pub output_format: Option<String>,
    pub output_data: Option<serde_json::Value>,
    pub output_media_refs: Vec<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Task {
    /// Create a freshly submitted task.
    pub fn new(instance_id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            instance_id: instance_id.into(),
            description: description.into(),
            parsed_intent: None,
            priority: TaskPriority::Normal,
            status: TaskStatus::Submitted,
            progress_percentage: 0,
            execution_steps: Vec::new(),
            scheduled_for: None,
            recurring_pattern: None,
            output_format: None,
            output_data: None,
            output_media_refs: Vec::new(),
            processing_started_at: None,
            processing_ended_at: None,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            parent_task_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_intent(mut self, intent: Option<ParsedIntent>) -> Self {
        self.parsed_intent = intent;
        self
    }

    pub fn with_schedule(mut self, scheduled_for: Option<DateTime<Utc>>) -> Self {
        self.scheduled_for = scheduled_for;
        self
    }

    pub fn with_recurrence(mut self, pattern: Option<String>) -> Self {
        self.recurring_pattern = pattern;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    /// Whether the retry budget is exhausted.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// A retry-pending task is QUEUED with a future due time; it sits out
    /// of the lanes until the scheduler promotes it.
    pub fn is_retry_pending(&self) -> bool {
        self.status == TaskStatus::Queued
            && self.scheduled_for.is_some_and(|t| t > Utc::now())
    }

    /// Apply a patch, producing the next version of the task.
    ///
    /// This is the single place transition legality, progress monotonicity,
    /// and lifecycle timestamps are enforced. The store calls it under the
    /// version guard; nothing else mutates a persisted task.
    pub fn apply_patch(&self, patch: &TaskPatch) -> Result<Task, StoreError> {
        let mut next = self.clone();
        let now = Utc::now();

        if let Some(target) = patch.status {
            let legal = self.status.can_transition_to(target)
                || (patch.force_retry
                    && self.status.can_force_retry()
                    && target == TaskStatus::Queued);
            if !legal {
                return Err(StoreError::IllegalTransition {
                    id: self.id,
                    from: self.status,
                    to: target,
                });
            }
            next.status = target;

            match target {
                TaskStatus::InProgress => {
                    // Fresh attempt: progress restarts, start stamp overwrites.
                    next.processing_started_at = Some(now);
                    next.progress_percentage = patch.progress.unwrap_or(0);
                }
                TaskStatus::Queued => {
                    // Retry or initial enqueue: progress resets for the next attempt.
                    next.progress_percentage = patch.progress.unwrap_or(0);
                }
                TaskStatus::Review => {
                    next.processing_ended_at = Some(now);
                    if let Some(p) = patch.progress {
                        next.progress_percentage = p.min(100);
                    }
                }
                _ => {
                    if target.is_terminal() && next.processing_ended_at.is_none() {
                        next.processing_ended_at = Some(now);
                    }
                    if let Some(p) = patch.progress {
                        next.progress_percentage = p.min(100);
                    }
                }
            }
        } else if let Some(p) = patch.progress {
            // No status change: progress is monotonic within the attempt.
            next.progress_percentage = p.min(100).max(self.progress_percentage);
        }

        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        if let Some(ref scheduled_for) = patch.scheduled_for {
            next.scheduled_for = *scheduled_for;
        }
        if let Some(ref pattern) = patch.recurring_pattern {
            next.recurring_pattern = pattern.clone();
        }
        if let Some(retry_count) = patch.retry_count {
            next.retry_count = retry_count;
        }
        if let Some(ref error_message) = patch.error_message {
            next.error_message = error_message.clone();
        }
        if let Some(ref output) = patch.output {
            next.output_format = Some(output.format.clone());
            next.output_data = Some(output.data.clone());
            next.output_media_refs = output.media_refs.clone();
        }

        // Steps are append-only; existing entries are never touched.
        next.execution_steps.extend(patch.append_steps.iter().cloned());

        next.version += 1;
        next.updated_at = now;

        Ok(next)
    }
}

/// Execution outcome attached to a task by its processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub format: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub media_refs: Vec<String>,
}

/// A partial update applied through the store's compare-and-swap primitive.
///
/// `Option<Option<T>>` fields distinguish "leave unchanged" (`None`) from
/// "set to null" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    /// Only set by the force-retry API; unlocks the Failed -> Queued edge.
    pub force_retry: bool,
    pub priority: Option<TaskPriority>,
    pub progress: Option<u8>,
    pub append_steps: Vec<ExecutionStep>,
    pub scheduled_for: Option<Option<DateTime<Utc>>>,
    pub recurring_pattern: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub error_message: Option<Option<String>>,
    pub output: Option<TaskOutput>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: ExecutionStep) -> Self {
        self.append_steps.push(step);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn with_schedule(mut self, scheduled_for: Option<DateTime<Utc>>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self
    }

    pub fn with_output(mut self, output: TaskOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }
}

/// Listing filters. All conditions are ANDed.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Vec<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub scheduled_from: Option<DateTime<Utc>>,
    pub scheduled_to: Option<DateTime<Utc>>,
}

/// Pagination window. Listing order is stable: (created_at, id) ascending.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 200;

    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Lightweight status/progress projection for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub id: Uuid,
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            status: task.status,
            progress_percentage: task.progress_percentage,
            retry_count: task.retry_count,
            error_message: task.error_message.clone(),
            updated_at: task.updated_at,
        }
    }
}
