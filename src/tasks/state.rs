//! Task lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, persisted, not yet routed to a lane.
    Submitted,
    /// Routed to a lane, waiting for a worker.
    Queued,
    /// Claimed by a worker, resolving a processor.
    Planning,
    /// Processor resolved, about to start execution.
    Assigned,
    /// Processor is executing.
    InProgress,
    /// Execution finished, output awaiting review.
    Review,
    /// Output accepted.
    Completed,
    /// Unrecoverable error or retry budget exhausted.
    Failed,
    /// Cancelled by the tenant before completion.
    Cancelled,
    /// A reviewer declined the output.
    Rejected,
}

impl TaskStatus {
    /// Check whether the state graph has an edge from `self` to `target`.
    ///
    /// The force-retry edge (Failed -> Queued) is deliberately absent here;
    /// it is only reachable through [`TaskStatus::can_force_retry`].
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // Happy path
            (Submitted, Queued)
                | (Queued, Planning)
                | (Planning, Assigned)
                | (Assigned, InProgress)
                | (InProgress, Review)
                | (Review, Completed)
                // Failure branch
                | (Queued, Failed)
                | (Planning, Failed)
                | (Assigned, Failed)
                | (InProgress, Failed)
                | (Review, Failed)
                // Retry branch (transient error, budget remaining)
                | (Planning, Queued)
                | (Assigned, Queued)
                | (InProgress, Queued)
                | (Review, Queued)
                // User actions
                | (Submitted, Cancelled)
                | (Queued, Cancelled)
                | (Planning, Cancelled)
                | (Assigned, Cancelled)
                | (InProgress, Cancelled)
                | (Review, Rejected)
        )
    }

    /// The one edge outside the normal table: a terminal Failed task may be
    /// re-queued by the explicit force-retry API, which also resets the
    /// retry budget.
    pub fn can_force_retry(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Rejected
        )
    }

    /// Cancellation is rejected once the task has entered Review or later.
    pub fn is_cancellable(&self) -> bool {
        self.can_transition_to(Self::Cancelled)
    }

    /// Priority and scheduling fields may only be patched before a worker
    /// has dequeued the task.
    pub fn is_dispatched(&self) -> bool {
        !matches!(self, Self::Submitted | Self::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "queued" => Ok(Self::Queued),
            "planning" => Ok(Self::Planning),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "rejected" => Ok(Self::Rejected),
            other => Err(ValidationError::InvalidStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
