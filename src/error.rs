//! Error types for taskhub.

use uuid::Uuid;

use crate::tasks::state::TaskStatus;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Stale write for task {id}: expected version {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: i64, actual: i64 },

    #[error("Illegal transition for task {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Malformed submissions and patches. Surfaced synchronously, never persisted.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Description must not be empty")]
    EmptyDescription,

    #[error("Unknown priority: {0}")]
    InvalidPriority(String),

    #[error("Unknown status: {0}")]
    InvalidStatus(String),

    #[error("scheduled_for is in the past for a non-recurring task")]
    ScheduledInPast,

    #[error("Invalid recurrence pattern '{pattern}': {message}")]
    InvalidRecurrence { pattern: String, message: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },
}

/// Illegal state transition attempts. Always safe for the caller to treat
/// as a no-op.
#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Task {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} was modified concurrently")]
    StaleVersion { id: Uuid },

    #[error("Task {id} is not cancellable in status {status}")]
    NotCancellable { id: Uuid, status: TaskStatus },

    #[error("Task {id} is not in a retryable state (status {status}, expected failed)")]
    NotRetryable { id: Uuid, status: TaskStatus },

    #[error("Task {id} is not awaiting review (status {status})")]
    NotInReview { id: Uuid, status: TaskStatus },

    #[error("Task {id} has already been dispatched (status {status})")]
    AlreadyDispatched { id: Uuid, status: TaskStatus },

    #[error("Task {id} is not in a terminal state (status {status})")]
    NotTerminal { id: Uuid, status: TaskStatus },
}

/// Unknown task / instance lookups.
#[derive(Debug, thiserror::Error)]
pub enum NotFoundError {
    #[error("Task {id} not found")]
    Task { id: Uuid },
}

/// Scheduler promotion failures. Logged and retried on the next scan cycle.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("Failed to promote due task {id}: {reason}")]
    PromotionFailed { id: Uuid, reason: String },
}

/// Store-level outcomes surface as the caller-facing taxonomy: a missing
/// row is NotFound, a lost CAS race or illegal transition is a Conflict.
impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { id } => Error::NotFound(NotFoundError::Task { id }),
            StoreError::VersionConflict { id, .. } => {
                Error::Conflict(ConflictError::StaleVersion { id })
            }
            StoreError::IllegalTransition { id, from, to } => {
                Error::Conflict(ConflictError::IllegalTransition { id, from, to })
            }
            other => Error::Store(other),
        }
    }
}

impl SchedulingError {
    pub fn promotion(id: Uuid, e: &Error) -> Self {
        Self::PromotionFailed {
            id,
            reason: e.to_string(),
        }
    }
}

impl Error {
    /// Stable machine-readable kind for API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Store(StoreError::NotFound { .. }) => "not_found",
            Error::Store(StoreError::VersionConflict { .. }) => "conflict",
            Error::Store(StoreError::IllegalTransition { .. }) => "conflict",
            Error::Store(_) => "store_error",
            Error::Validation(_) => "validation_error",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Scheduling(_) => "scheduling_error",
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
