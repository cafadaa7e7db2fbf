//! Worker pool — N parallel workers over the shared lanes.

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::worker::worker::{Worker, WorkerDeps};

pub struct WorkerPool {
    deps: WorkerDeps,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(deps: WorkerDeps) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            deps,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Start all workers.
    pub fn start(&mut self) {
        let count = self.deps.config.worker_count;
        info!(count, "Starting worker pool");

        for worker_id in 0..count {
            let worker = Worker::new(worker_id, self.deps.clone());
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(worker.run(shutdown_rx)));
        }
    }

    /// Signal shutdown and wait for every worker to drain.
    pub async fn stop(&mut self) {
        info!("Stopping worker pool");
        let _ = self.shutdown_tx.send(());
        join_all(self.handles.drain(..)).await;
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}
