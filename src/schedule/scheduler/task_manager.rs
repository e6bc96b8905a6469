use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::schedule::error::TaskError;
use crate::schedule::events::EventLog;
use crate::schedule::pipeline::CancelFlag;
use crate::schedule::source::parse_source;
use crate::schedule::stats::StatsAggregator;
use crate::schedule::types::{EventType, Task, TaskEvent, TaskPatch, TaskQuery, TaskStats, TaskStatus};
use crate::schedule::workspace::Workspace;
use crate::storage::task::TaskStore;

const RECOVERY_PAGE: u64 = 500;

/// A unit of work handed to the worker pool.
#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: String,
    pub cancel: CancelFlag,
}

pub type JobReceiver = mpsc::UnboundedReceiver<Job>;

/// Entry point for everything a client can ask of the task system.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    events: EventLog,
    stats: StatsAggregator,
    workspace_root: PathBuf,
    // cancellation flags of queued and running tasks
    active: Mutex<HashMap<String, CancelFlag>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    closed: AtomicBool,
}

impl TaskManager {
    /// Creates the manager and the receiving end of its FIFO job queue.
    pub fn new(store: Arc<dyn TaskStore>, workspace_root: impl Into<PathBuf>) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            events: EventLog::new(store.clone()),
            stats: StatsAggregator::new(store.clone()),
            store,
            workspace_root: workspace_root.into(),
            active: Mutex::new(HashMap::new()),
            queue: Mutex::new(Some(sender)),
            closed: AtomicBool::new(false),
        };
        (manager, receiver)
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    fn workspace(&self, task_id: &str) -> Workspace {
        Workspace::new(&self.workspace_root, task_id)
    }

    /// Records a Queued task for `url` and schedules it. Returns without
    /// waiting for any processing.
    pub async fn submit(&self, url: &str) -> Result<String, TaskError> {
        let source = parse_source(url)?;
        let task_id = format!("task-{}", Uuid::new_v4());
        let task = Task::queued(task_id.clone(), source.video_id, source.url);

        self.store.create(&task).await?;
        info!(task_id = %task_id, video_id = %task.video_id, "task submitted");

        self.enqueue(&task_id).await?;
        Ok(task_id)
    }

    async fn enqueue(&self, task_id: &str) -> Result<(), TaskError> {
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        self.active.lock().await.insert(task_id.to_string(), cancel.clone());

        let sent = match self.queue.lock().await.as_ref() {
            Some(sender) => sender
                .send(Job {
                    task_id: task_id.to_string(),
                    cancel,
                })
                .is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }

        self.active.lock().await.remove(task_id);
        let reason = "the worker pool is shut down";
        if let Err(e) = self.store.update(task_id, TaskPatch::failed(reason)).await {
            warn!(task_id, "failed to mark unscheduled task: {}", e);
        } else if let Err(e) = self.events.record(task_id, EventType::Failed, reason).await {
            warn!(task_id, "failed to record event: {}", e);
        }
        Err(TaskError::Unavailable(reason.to_string()))
    }

    pub async fn get_status(&self, task_id: &str) -> Result<Task, TaskError> {
        self.store.get(task_id).await
    }

    /// The rendered document of a Completed task.
    pub async fn get_result(&self, task_id: &str) -> Result<String, TaskError> {
        let task = self.store.get(task_id).await?;
        if task.status != TaskStatus::Completed {
            return Err(TaskError::NotReady {
                task_id: task.task_id,
                status: task.status,
            });
        }
        let path = self.workspace(task_id).result_path();
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| TaskError::Corrupt(format!("result of {} is unreadable at {}: {}", task_id, path.display(), e)))
    }

    pub async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, TaskError> {
        self.store.list(query).await
    }

    pub async fn get_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, TaskError> {
        self.events.timeline(task_id).await
    }

    /// Removes the task, its events and its working storage. A queued or
    /// running task is flagged first so its run halts at the next stage boundary.
    pub async fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        if let Some(cancel) = self.active.lock().await.get(task_id) {
            cancel.store(true, Ordering::SeqCst);
            info!(task_id, "cancellation requested");
        }

        self.store.delete(task_id).await?;
        if let Err(e) = self.workspace(task_id).remove().await {
            warn!(task_id, "failed to remove working storage: {}", e);
        }
        info!(task_id, "task deleted");
        Ok(())
    }

    /// Deletes terminal tasks that completed more than `days` days ago.
    pub async fn cleanup(&self, days: u32) -> Result<u64, TaskError> {
        // nothing can have completed before the earliest representable time
        let Some(cutoff) = Duration::try_days(i64::from(days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!(days, "cleanup cutoff precedes any representable time");
            return Ok(0);
        };
        let removed = self
            .store
            .delete_older_than(cutoff, &[TaskStatus::Completed, TaskStatus::Failed])
            .await?;

        for task_id in &removed {
            if let Err(e) = self.workspace(task_id).remove().await {
                warn!(task_id = %task_id, "failed to remove working storage: {}", e);
            }
        }
        info!(days, deleted = removed.len(), "cleanup finished");
        Ok(removed.len() as u64)
    }

    pub async fn get_stats(&self) -> Result<TaskStats, TaskError> {
        self.stats.snapshot().await
    }

    async fn all_with_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskError> {
        let mut tasks = Vec::new();
        loop {
            let page = self
                .store
                .list(&TaskQuery {
                    status: Some(status),
                    search: None,
                    limit: RECOVERY_PAGE,
                    offset: tasks.len() as u64,
                })
                .await?;
            let last_page = (page.len() as u64) < RECOVERY_PAGE;
            tasks.extend(page);
            if last_page {
                return Ok(tasks);
            }
        }
    }

    /// Resolves what a previous process left behind: runs that were cut off
    /// are failed, queued tasks are scheduled again oldest first.
    /// Returns `(failed, requeued)`.
    pub async fn recover(&self) -> Result<(usize, usize), TaskError> {
        let interrupted = self.all_with_status(TaskStatus::Processing).await?;
        let mut queued = self.all_with_status(TaskStatus::Queued).await?;

        let reason = "interrupted by a service restart";
        for task in &interrupted {
            self.store.update(&task.task_id, TaskPatch::failed(reason)).await?;
            self.events.record(&task.task_id, EventType::Failed, reason).await?;
        }

        queued.reverse();
        for task in &queued {
            self.enqueue(&task.task_id).await?;
        }

        if !interrupted.is_empty() || !queued.is_empty() {
            info!(failed = interrupted.len(), requeued = queued.len(), "recovered tasks from previous run");
        }
        Ok((interrupted.len(), queued.len()))
    }

    /// Stops accepting work. Workers finish the task they are running and
    /// leave the rest Queued for the next start.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queue.lock().await.take();
        info!("task queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops the bookkeeping of a run that ended.
    pub(crate) async fn finish(&self, task_id: &str) {
        self.active.lock().await.remove(task_id);
    }
}
