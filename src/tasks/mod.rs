//! Task domain: model, lifecycle state machine, and the service funnel.

pub mod model;
pub mod service;
pub mod state;

pub use model::{
    ExecutionStep, Page, ParsedIntent, StepStatus, Task, TaskFilter, TaskOutput, TaskPatch,
    TaskPriority, TaskStatusView,
};
pub use service::TaskService;
pub use state::TaskStatus;
