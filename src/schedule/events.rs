use std::sync::Arc;

use crate::schedule::error::TaskError;
use crate::schedule::types::{EventType, Step, TaskEvent, TaskStatus};
use crate::storage::task::TaskStore;

/// Append-only timeline of a task, kept in the task store.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn TaskStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        task_id: &str,
        event_type: EventType,
        message: impl AsRef<str>,
    ) -> Result<TaskEvent, TaskError> {
        self.store.append_event(task_id, event_type, message.as_ref()).await
    }

    pub async fn status_changed(
        &self,
        task_id: &str,
        status: TaskStatus,
        detail: Option<&str>,
    ) -> Result<TaskEvent, TaskError> {
        let message = match detail {
            Some(detail) => format!("Status changed to {}: {}", status, detail),
            None => format!("Status changed to {}", status),
        };
        self.record(task_id, EventType::StatusChange, message).await
    }

    pub async fn stage_started(&self, task_id: &str, step: Step) -> Result<TaskEvent, TaskError> {
        self.record(task_id, EventType::StageStarted, format!("{} started", step)).await
    }

    pub async fn stage_completed(
        &self,
        task_id: &str,
        step: Step,
        message: &str,
    ) -> Result<TaskEvent, TaskError> {
        self.record(task_id, EventType::StageCompleted, format!("{}: {}", step, message))
            .await
    }

    pub async fn stage_failed(
        &self,
        task_id: &str,
        step: Step,
        message: &str,
    ) -> Result<TaskEvent, TaskError> {
        self.record(task_id, EventType::StageFailed, format!("{}: {}", step, message))
            .await
    }

    pub async fn timeline(&self, task_id: &str) -> Result<Vec<TaskEvent>, TaskError> {
        self.store.list_events(task_id).await
    }
}
