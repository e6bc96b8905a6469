use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Edges of the lifecycle: Queued -> Processing -> {Completed, Failed},
    /// plus Queued -> Failed for work rejected before it starts.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Processing)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(status: &str) -> Result<Self, Self::Err> {
        match status {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(TaskError::InvalidInput(format!("invalid task status: {}", status))),
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task currently is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Queued,
    FetchingMetadata,
    Downloading,
    Segmenting,
    Transcribing,
    Merging,
    Summarizing,
    Rendering,
    Completed,
}

impl Step {
    /// The fixed stage order of the pipeline.
    pub const PIPELINE: [Step; 7] = [
        Step::FetchingMetadata,
        Step::Downloading,
        Step::Segmenting,
        Step::Transcribing,
        Step::Merging,
        Step::Summarizing,
        Step::Rendering,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Step::Queued => "Queued",
            Step::FetchingMetadata => "Fetching Metadata",
            Step::Downloading => "Downloading Audio",
            Step::Segmenting => "Splitting Audio",
            Step::Transcribing => "Transcribing",
            Step::Merging => "Merging Transcription",
            Step::Summarizing => "LLM Processing",
            Step::Rendering => "Generating HTML",
            Step::Completed => "Completed",
        }
    }

    /// Share of the 0-100 range owned by a pipeline stage.
    pub fn weight(&self) -> f64 {
        match self {
            Step::FetchingMetadata => 5.0,
            Step::Downloading => 15.0,
            Step::Segmenting => 5.0,
            Step::Transcribing => 45.0,
            Step::Merging => 5.0,
            Step::Summarizing => 20.0,
            Step::Rendering => 5.0,
            Step::Queued | Step::Completed => 0.0,
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current_step: Step,
    pub percent: f64,
    pub message: String,
}

impl Progress {
    pub fn new(current_step: Step, percent: f64, message: impl Into<String>) -> Result<Self, TaskError> {
        let progress = Self {
            current_step,
            percent,
            message: message.into(),
        };
        progress.validate()?;
        Ok(progress)
    }

    pub fn queued() -> Self {
        Self {
            current_step: Step::Queued,
            percent: 0.0,
            message: "Waiting for a free worker".to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if !self.percent.is_finite() || !(0.0..=100.0).contains(&self.percent) {
            return Err(TaskError::InvalidProgress(format!(
                "percent must be within 0..=100, got {}",
                self.percent
            )));
        }
        Ok(())
    }
}

/// Figures gathered from stage outputs, recorded when a task completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Downloaded audio size in MB.
    pub file_size: f64,
    pub segments_count: i64,
    /// Transcript length in characters.
    pub transcription_length: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub video_id: String,
    pub source_url: String,
    pub video_title: Option<String>,
    pub status: TaskStatus,
    pub progress: Progress,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between creation and completion.
    pub processing_time: Option<f64>,
    pub file_size: Option<f64>,
    pub segments_count: Option<i64>,
    pub transcription_length: Option<i64>,
}

impl Task {
    pub fn queued(task_id: String, video_id: String, source_url: String) -> Self {
        // the store keeps microseconds
        let now = Utc::now().trunc_subsecs(6);
        Self {
            task_id,
            video_id,
            source_url,
            video_title: None,
            status: TaskStatus::Queued,
            progress: Progress::queued(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            processing_time: None,
            file_size: None,
            segments_count: None,
            transcription_length: None,
        }
    }

    /// Checks the record-level invariants of a task.
    pub fn validate(&self) -> Result<(), TaskError> {
        self.progress.validate()?;
        if self.status.is_terminal() != self.completed_at.is_some() {
            return Err(TaskError::transition(
                &self.task_id,
                "completed_at must be set exactly when the status is terminal",
            ));
        }
        if (self.status == TaskStatus::Failed) != self.error_message.is_some() {
            return Err(TaskError::transition(
                &self.task_id,
                "error_message must be set exactly when the status is failed",
            ));
        }
        let has_metrics = self.processing_time.is_some()
            || self.file_size.is_some()
            || self.segments_count.is_some()
            || self.transcription_length.is_some();
        if has_metrics && self.status != TaskStatus::Completed {
            return Err(TaskError::transition(
                &self.task_id,
                "derived metrics are only recorded on completed tasks",
            ));
        }
        Ok(())
    }

    /// Merges `patch` into the task, enforcing the lifecycle rules.
    /// On error the task is left untouched.
    pub fn apply(&mut self, patch: TaskPatch, now: DateTime<Utc>) -> Result<(), TaskError> {
        let current = self.status;
        let next = patch.status.unwrap_or(current);

        if current.is_terminal() {
            return Err(TaskError::transition(
                &self.task_id,
                format!("task is already {}", current),
            ));
        }
        if next != current && !current.can_transition_to(next) {
            return Err(TaskError::transition(
                &self.task_id,
                format!("{} -> {} is not allowed", current, next),
            ));
        }

        if let Some(progress) = &patch.progress {
            progress.validate()?;
            if current == TaskStatus::Processing && progress.percent < self.progress.percent {
                return Err(TaskError::transition(
                    &self.task_id,
                    format!(
                        "progress may not go backwards ({} -> {})",
                        self.progress.percent, progress.percent
                    ),
                ));
            }
        }

        match (&patch.error_message, next) {
            (None, TaskStatus::Failed) => {
                return Err(TaskError::transition(&self.task_id, "a failed task needs an error message"));
            }
            (Some(_), status) if status != TaskStatus::Failed => {
                return Err(TaskError::transition(
                    &self.task_id,
                    "error_message is only recorded on failure",
                ));
            }
            _ => {}
        }

        if patch.metrics.is_some() && next != TaskStatus::Completed {
            return Err(TaskError::transition(
                &self.task_id,
                "derived metrics are only recorded on completion",
            ));
        }

        self.status = next;
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(title) = patch.video_title {
            self.video_title = Some(title);
        }
        if let Some(error) = patch.error_message {
            self.error_message = Some(error);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if next == TaskStatus::Completed {
            let elapsed = (now - self.created_at).num_milliseconds().max(0) as f64 / 1000.0;
            self.processing_time = Some(elapsed);
            if let Some(metrics) = patch.metrics {
                self.file_size = Some(metrics.file_size);
                self.segments_count = Some(metrics.segments_count);
                self.transcription_length = Some(metrics.transcription_length);
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial update of a task row.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<Progress>,
    pub video_title: Option<String>,
    pub error_message: Option<String>,
    pub metrics: Option<TaskMetrics>,
}

impl TaskPatch {
    pub fn progress(progress: Progress) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn processing(progress: Progress) -> Self {
        Self {
            status: Some(TaskStatus::Processing),
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn completed(progress: Progress, metrics: TaskMetrics) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            progress: Some(progress),
            metrics: Some(metrics),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error_message: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.video_title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    StatusChange,
    StageStarted,
    StageCompleted,
    StageFailed,
    Completed,
    Failed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::StatusChange => "status_change",
            EventType::StageStarted => "stage_started",
            EventType::StageCompleted => "stage_completed",
            EventType::StageFailed => "stage_failed",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
        }
    }
}

impl FromStr for EventType {
    type Err = TaskError;

    fn from_str(event_type: &str) -> Result<Self, Self::Err> {
        match event_type {
            "created" => Ok(EventType::Created),
            "status_change" => Ok(EventType::StatusChange),
            "stage_started" => Ok(EventType::StageStarted),
            "stage_completed" => Ok(EventType::StageCompleted),
            "stage_failed" => Ok(EventType::StageFailed),
            "completed" => Ok(EventType::Completed),
            "failed" => Ok(EventType::Failed),
            _ => Err(TaskError::Corrupt(format!("unknown event type: {}", event_type))),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: String,
    pub event_type: EventType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Filter and page of a task listing.
#[derive(Debug, Clone)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub search: Option<String>,
    pub limit: u64,
    pub offset: u64,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Queued => self.queued,
            TaskStatus::Processing => self.processing,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn sum(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_tasks: u64,
    pub status_counts: StatusCounts,
    /// Average seconds over completed tasks, 0 when there are none.
    pub avg_processing_time: f64,
    /// Tasks created in the last 24 hours.
    pub recent_tasks: u64,
}
