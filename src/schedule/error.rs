use thiserror::Error;

use super::types::TaskStatus;

/// Error type for task lifecycle operations.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The submitted source cannot be resolved to a processable identifier.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {task_id} is not ready: status is {status}")]
    NotReady { task_id: String, status: TaskStatus },

    /// An update would break the task state machine. Reaching this from the
    /// pipeline is a logic defect.
    #[error("invalid transition for task {task_id}: {reason}")]
    InvalidTransition { task_id: String, reason: String },

    #[error("invalid progress: {0}")]
    InvalidProgress(String),

    /// Concurrent writers kept winning the optimistic update race.
    #[error("update conflict: {0}")]
    Conflict(String),

    #[error("store failure: {0}")]
    Store(#[from] sqlx::Error),

    #[error("corrupt task record: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task execution is unavailable: {0}")]
    Unavailable(String),
}

impl TaskError {
    pub(crate) fn transition(task_id: &str, reason: impl Into<String>) -> Self {
        TaskError::InvalidTransition {
            task_id: task_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TaskError::NotFound(_))
    }
}
