use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::schedule::error::TaskError;
use crate::schedule::types::{EventType, Task, TaskEvent, TaskPatch, TaskQuery, TaskStats, TaskStatus};

pub mod entity;
pub mod mapping;
pub mod sqlite;

pub use sqlite::SqliteTaskStore;

/// Durable store for tasks and their event history.
///
/// Every operation is atomic for the task row it touches and safe to call
/// concurrently from the pipeline and from readers.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Inserts `task` together with its `created` event.
    async fn create(&self, task: &Task) -> Result<String, TaskError>;

    async fn get(&self, task_id: &str) -> Result<Task, TaskError>;

    /// Merges `patch` into the row and returns the updated task. Illegal
    /// lifecycle changes fail with `InvalidTransition` and write nothing.
    async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<Task, TaskError>;

    /// Tasks newest first.
    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, TaskError>;

    async fn append_event(
        &self,
        task_id: &str,
        event_type: EventType,
        message: &str,
    ) -> Result<TaskEvent, TaskError>;

    /// Events oldest first.
    async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, TaskError>;

    /// Removes the task and all of its events.
    async fn delete(&self, task_id: &str) -> Result<(), TaskError>;

    /// Aggregates over one snapshot; `recent_tasks` counts rows created at or after `since`.
    async fn aggregate_stats(&self, since: DateTime<Utc>) -> Result<TaskStats, TaskError>;

    /// Deletes tasks in `statuses` whose `completed_at` is before `cutoff`,
    /// returning the ids removed.
    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[TaskStatus],
    ) -> Result<Vec<String>, TaskError>;

    async fn close(&self);
}
