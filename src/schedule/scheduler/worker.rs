use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::task_manager::{JobReceiver, TaskManager};
use crate::schedule::pipeline::{PipelineRunner, RunOutcome};

pub struct TaskWorker {
    id: usize,
    task_manager: Arc<TaskManager>,
    runner: Arc<PipelineRunner>,
    // shared by every worker; whoever holds the lock takes the next job
    jobs: Arc<Mutex<JobReceiver>>,
}

impl TaskWorker {
    pub fn new(
        id: usize,
        task_manager: Arc<TaskManager>,
        runner: Arc<PipelineRunner>,
        jobs: Arc<Mutex<JobReceiver>>,
    ) -> Self {
        Self {
            id,
            task_manager,
            runner,
            jobs,
        }
    }

    /// Runs jobs one at a time until the queue is closed and drained.
    pub async fn run(&self) {
        debug!(worker = self.id, "worker started");
        loop {
            let job = {
                let mut jobs = self.jobs.lock().await;
                jobs.recv().await
            };
            let Some(job) = job else {
                break;
            };

            if self.task_manager.is_closed() {
                debug!(worker = self.id, task_id = %job.task_id, "shutting down, leaving task queued");
            } else {
                match self.runner.run(&job.task_id, &job.cancel).await {
                    Ok(RunOutcome::Completed) => info!(worker = self.id, task_id = %job.task_id, "task completed"),
                    Ok(outcome) => info!(worker = self.id, task_id = %job.task_id, ?outcome, "task finished"),
                    Err(e) => error!(worker = self.id, task_id = %job.task_id, "task aborted: {}", e),
                }
            }
            self.task_manager.finish(&job.task_id).await;
        }
        debug!(worker = self.id, "worker stopped");
    }
}
