mod task_manager;
mod worker;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::sync::Mutex;
use anyhow::Result;
use tracing::info;

pub use task_manager::{Job, JobReceiver, TaskManager};
use worker::TaskWorker;
use crate::schedule::pipeline::PipelineRunner;

/// Fixed-size pool of workers draining the manager's job queue in FIFO order.
/// At most `concurrency` tasks run at any time.
pub struct TaskScheduler {
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn start(
        task_manager: Arc<TaskManager>,
        runner: Arc<PipelineRunner>,
        jobs: JobReceiver,
        concurrency: usize,
    ) -> Self {
        let jobs = Arc::new(Mutex::new(jobs));
        let concurrency = concurrency.max(1);
        let handles = (0..concurrency)
            .map(|id| {
                let worker = TaskWorker::new(id, task_manager.clone(), runner.clone(), jobs.clone());
                tokio::spawn(async move {
                    worker.run().await;
                })
            })
            .collect();
        info!("started {} task workers", concurrency);

        Self {
            workers: Mutex::new(handles),
        }
    }

    /// Waits for every worker to exit, which happens once the manager is shut down.
    pub async fn join(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.await?;
        }
        Ok(())
    }
}
