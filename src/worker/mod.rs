//! Worker pool — parallel consumers that drive task attempts.

pub mod pool;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::{Worker, WorkerDeps};
