//! Event broadcaster — per-instance fan-out of task lifecycle events.
//!
//! Delivery is best-effort, at-most-once live push over `tokio::sync::broadcast`.
//! Clients that need guaranteed history poll the task store, which stays
//! authoritative. Subscription groups are keyed by instance so one tenant
//! never observes another tenant's events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::tasks::model::{ExecutionStep, Task, TaskPriority};
use crate::tasks::state::TaskStatus;

/// Broadcast channel capacity per instance.
const CHANNEL_CAPACITY: usize = 256;

/// Compact task projection carried in `task_update` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub instance_id: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress_percentage: u8,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            instance_id: task.instance_id.clone(),
            status: task.status,
            priority: task.priority,
            progress_percentage: task.progress_percentage,
            retry_count: task.retry_count,
            error_message: task.error_message.clone(),
            updated_at: task.updated_at,
        }
    }
}

/// A lifecycle event pushed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskUpdate {
        task: TaskSummary,
    },
    ExecutionStep {
        task_id: Uuid,
        step: ExecutionStep,
    },
    Error {
        task_id: Uuid,
        kind: String,
        message: String,
    },
}

/// Per-instance broadcast groups.
pub struct EventBroadcaster {
    channels: RwLock<HashMap<String, broadcast::Sender<TaskEvent>>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to one instance's events. Each WS client calls this per
    /// subscribed instance.
    pub async fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<TaskEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish one event to an instance's subscribers. A send with no live
    /// receivers prunes the group.
    pub async fn publish(&self, instance_id: &str, event: TaskEvent) {
        let failed = {
            let channels = self.channels.read().await;
            match channels.get(instance_id) {
                Some(tx) => tx.send(event).is_err(),
                None => return,
            }
        };

        if failed {
            let mut channels = self.channels.write().await;
            if let Some(tx) = channels.get(instance_id) {
                if tx.receiver_count() == 0 {
                    channels.remove(instance_id);
                }
            }
        }
    }

    /// Fan out the events for one state-affecting store write: a
    /// `task_update`, one `execution_step` per appended step, and an
    /// `error` when the task entered FAILED or REJECTED.
    pub async fn task_written(&self, task: &Task, new_steps: &[ExecutionStep]) {
        self.publish(
            &task.instance_id,
            TaskEvent::TaskUpdate {
                task: TaskSummary::from(task),
            },
        )
        .await;

        for step in new_steps {
            self.publish(
                &task.instance_id,
                TaskEvent::ExecutionStep {
                    task_id: task.id,
                    step: step.clone(),
                },
            )
            .await;
        }

        if matches!(task.status, TaskStatus::Failed | TaskStatus::Rejected) {
            self.publish(
                &task.instance_id,
                TaskEvent::Error {
                    task_id: task.id,
                    kind: task.status.as_str().to_string(),
                    message: task
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "task did not complete".to_string()),
                },
            )
            .await;
        }
    }

    /// Number of live instance groups (for tests and introspection).
    pub async fn group_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
