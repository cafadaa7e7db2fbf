//! Processor contract — pluggable capabilities that execute tasks.
//!
//! Delivery is at-least-once: a processor may be invoked more than once for
//! the same attempt and must either be naturally idempotent or consult the
//! task's prior execution steps (via the context) to skip finished work.

pub mod context;
pub mod default;
pub mod registry;

use async_trait::async_trait;

pub use context::{CancelRegistry, CancelToken, ExecutionContext};
pub use default::DefaultProcessor;
pub use registry::ProcessorRegistry;

/// Execution failure, split by retryability.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Worth retrying: the retry controller re-enqueues with backoff until
    /// the task's budget runs out.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Not worth retrying: the task fails immediately.
    #[error("permanent failure: {message}")]
    Permanent { message: String },
}

impl ProcessorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Successful execution result.
#[derive(Debug, Clone)]
pub struct ProcessorOutput {
    pub format: String,
    pub data: serde_json::Value,
    pub media_refs: Vec<String>,
    /// When true the task parks in REVIEW for a human decision instead of
    /// completing automatically.
    pub requires_review: bool,
}

impl ProcessorOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            format: "text".to_string(),
            data: serde_json::Value::String(content.into()),
            media_refs: Vec::new(),
            requires_review: false,
        }
    }

    pub fn json(data: serde_json::Value) -> Self {
        Self {
            format: "json".to_string(),
            data,
            media_refs: Vec::new(),
            requires_review: false,
        }
    }

    pub fn with_media(mut self, refs: Vec<String>) -> Self {
        self.media_refs = refs;
        self
    }

    pub fn with_review(mut self) -> Self {
        self.requires_review = true;
        self
    }
}

/// A pluggable handler capable of executing tasks of one intent.
#[async_trait]
pub trait Processor: Send + Sync {
    /// The intent this processor handles.
    fn intent(&self) -> &str;

    /// Per-type retry budget, stamped onto tasks at submission.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Execute one attempt. Must check `ctx` for cancellation between steps
    /// and report progress through it.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ProcessorOutput, ProcessorError>;
}
