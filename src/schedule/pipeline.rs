use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::schedule::error::TaskError;
use crate::schedule::events::EventLog;
use crate::schedule::processors::{
    Artifacts, ProgressSink, Stage, StageContext, StageError, StageOutput, StageProgress,
};
use crate::schedule::types::{EventType, Progress, Step, TaskPatch, TaskStatus};
use crate::schedule::workspace::Workspace;
use crate::storage::task::TaskStore;

/// Advisory cancellation flag, checked by the runner between stages.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    /// The task was deleted while queued or running.
    Cancelled,
    /// The task was not Queued when the run started.
    Skipped,
}

/// Runs the fixed stage sequence for one task and records everything it does.
pub struct PipelineRunner {
    store: Arc<dyn TaskStore>,
    events: EventLog,
    stages: Vec<Box<dyn Stage>>,
    workspace_root: PathBuf,
}

impl PipelineRunner {
    /// `stages` must follow [`Step::PIPELINE`] exactly.
    pub fn new(
        store: Arc<dyn TaskStore>,
        stages: Vec<Box<dyn Stage>>,
        workspace_root: impl Into<PathBuf>,
    ) -> Result<Self, TaskError> {
        let steps: Vec<Step> = stages.iter().map(|stage| stage.step()).collect();
        if steps != Step::PIPELINE {
            return Err(TaskError::InvalidInput(format!(
                "stages {:?} do not match the pipeline order {:?}",
                steps,
                Step::PIPELINE
            )));
        }
        Ok(Self {
            events: EventLog::new(store.clone()),
            store,
            stages,
            workspace_root: workspace_root.into(),
        })
    }

    pub fn workspace(&self, task_id: &str) -> Workspace {
        Workspace::new(&self.workspace_root, task_id)
    }

    /// Executes the task. Stage failures end as `Ok(RunOutcome::Failed)`;
    /// only store failures are returned as errors.
    pub async fn run(&self, task_id: &str, cancel: &AtomicBool) -> Result<RunOutcome, TaskError> {
        let workspace = self.workspace(task_id);
        match self.execute(task_id, cancel, &workspace).await {
            Ok(RunOutcome::Cancelled) => {
                self.discard(task_id, &workspace).await;
                Ok(RunOutcome::Cancelled)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) if cancel.load(Ordering::SeqCst) || e.is_not_found() => {
                debug!(task_id, "store rejected a write after cancellation: {}", e);
                self.discard(task_id, &workspace).await;
                Ok(RunOutcome::Cancelled)
            }
            Err(e) => {
                error!(task_id, "pipeline aborted by store failure: {}", e);
                if let Err(mark_err) = self
                    .store
                    .update(task_id, TaskPatch::failed(format!("store failure: {}", e)))
                    .await
                {
                    warn!(task_id, "could not mark task failed: {}", mark_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        task_id: &str,
        cancel: &AtomicBool,
        workspace: &Workspace,
    ) -> Result<RunOutcome, TaskError> {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => return Ok(RunOutcome::Cancelled),
            Err(e) => return Err(e),
        };
        if task.status != TaskStatus::Queued {
            warn!(task_id, status = %task.status, "task is no longer queued, skipping");
            return Ok(RunOutcome::Skipped);
        }
        if cancel.load(Ordering::SeqCst) {
            return Ok(RunOutcome::Cancelled);
        }

        if let Err(e) = workspace.prepare().await {
            let message = format!("failed to prepare working storage {}: {}", workspace.root().display(), e);
            error!(task_id, "{}", message);
            self.store.update(task_id, TaskPatch::failed(&message)).await?;
            self.events.record(task_id, EventType::Failed, &message).await?;
            return Ok(RunOutcome::Failed);
        }

        let first = Step::PIPELINE[0];
        let claim = TaskPatch::processing(Progress::new(first, 0.0, "Starting")?);
        match self.store.update(task_id, claim).await {
            Ok(_) => {}
            Err(TaskError::InvalidTransition { reason, .. }) => {
                warn!(task_id, "task was claimed elsewhere: {}", reason);
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }
        self.events.status_changed(task_id, TaskStatus::Processing, None).await?;
        info!(task_id, video_id = %task.video_id, "processing started");

        let mut ctx = StageContext {
            task_id: task.task_id.clone(),
            video_id: task.video_id.clone(),
            source_url: task.source_url.clone(),
            workspace: workspace.clone(),
            artifacts: Artifacts::default(),
        };
        let sink = StoreProgress::new(self.store.clone(), task_id);
        let mut band_start = 0.0;

        for stage in &self.stages {
            let step = stage.step();
            let band_end = band_start + step.weight();

            if cancel.load(Ordering::SeqCst) {
                info!(task_id, "cancelled before {}", step);
                return Ok(RunOutcome::Cancelled);
            }

            sink.report(step, band_start, format!("{}...", step.label())).await?;
            self.events.stage_started(task_id, step).await?;

            let progress = StageProgress::new(&sink, step, band_start, band_end);
            match stage.run(&ctx, &progress).await {
                Ok(success) => {
                    if let StageOutput::Metadata { title: Some(title) } = &success.output {
                        self.store
                            .update(task_id, TaskPatch::default().with_title(title.clone()))
                            .await?;
                    }
                    ctx.artifacts.apply(success.output);
                    sink.report(step, band_end, success.message.clone()).await?;
                    self.events.stage_completed(task_id, step, &success.message).await?;
                    debug!(task_id, "{} done: {}", step, success.message);
                }
                Err(StageError::Failed(message)) => {
                    if cancel.load(Ordering::SeqCst) {
                        return Ok(RunOutcome::Cancelled);
                    }
                    self.fail(task_id, step, &message).await?;
                    return Ok(RunOutcome::Failed);
                }
                Err(StageError::Store(e)) => return Err(e),
            }

            band_start = band_end;
        }

        if cancel.load(Ordering::SeqCst) {
            return Ok(RunOutcome::Cancelled);
        }

        let metrics = ctx.artifacts.metrics();
        let done = Progress::new(Step::Completed, 100.0, "Processing completed")?;
        let task = self.store.update(task_id, TaskPatch::completed(done, metrics)).await?;
        let elapsed = task.processing_time.unwrap_or_default();
        self.events
            .record(task_id, EventType::Completed, format!("Completed in {:.2}s", elapsed))
            .await?;
        info!(task_id, elapsed, "processing completed");
        Ok(RunOutcome::Completed)
    }

    async fn fail(&self, task_id: &str, step: Step, message: &str) -> Result<(), TaskError> {
        warn!(task_id, "{} failed: {}", step, message);
        self.events.stage_failed(task_id, step, message).await?;
        let error_message = format!("{}: {}", step, message);
        self.store.update(task_id, TaskPatch::failed(&error_message)).await?;
        self.events.record(task_id, EventType::Failed, &error_message).await?;
        Ok(())
    }

    async fn discard(&self, task_id: &str, workspace: &Workspace) {
        info!(task_id, "run cancelled");
        if let Err(e) = workspace.remove().await {
            warn!(task_id, "failed to remove working storage: {}", e);
        }
    }
}

/// Writes stage progress into the task row, never letting it move backwards.
struct StoreProgress {
    store: Arc<dyn TaskStore>,
    task_id: String,
    last: Mutex<f64>,
}

impl StoreProgress {
    fn new(store: Arc<dyn TaskStore>, task_id: &str) -> Self {
        Self {
            store,
            task_id: task_id.to_string(),
            last: Mutex::new(0.0),
        }
    }

    fn floor(&self) -> f64 {
        self.last.lock().map(|last| *last).unwrap_or(0.0)
    }
}

#[async_trait]
impl ProgressSink for StoreProgress {
    async fn report(&self, step: Step, percent: f64, message: String) -> Result<(), TaskError> {
        let percent = percent.max(self.floor()).min(100.0);
        let progress = Progress::new(step, percent, message)?;
        self.store.update(&self.task_id, TaskPatch::progress(progress)).await?;
        if let Ok(mut last) = self.last.lock() {
            *last = percent;
        }
        Ok(())
    }
}
