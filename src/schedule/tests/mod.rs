use super::*;
use crate::schedule::processors::{AudioFile, SegmentFile};
use crate::schedule::scheduler::JobReceiver;
use crate::storage::task::{SqliteTaskStore, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Scripted behaviour shared by the fake stages of one test.
#[derive(Default)]
struct Script {
    fail_at: Option<Step>,
    delay: Duration,
    gate: Option<Gate>,
    /// sub-progress fractions reported by the transcription stage
    fractions: Vec<f64>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    renders: AtomicUsize,
}

struct Gate {
    step: Step,
    entered: Notify,
    release: Notify,
}

impl Script {
    fn gated(step: Step) -> Self {
        Self {
            gate: Some(Gate {
                step,
                entered: Notify::new(),
                release: Notify::new(),
            }),
            ..Default::default()
        }
    }

    fn gate(&self) -> &Gate {
        self.gate.as_ref().expect("script has no gate")
    }
}

struct FakeStage {
    step: Step,
    script: Arc<Script>,
}

#[async_trait]
impl Stage for FakeStage {
    fn step(&self) -> Step {
        self.step
    }

    async fn run(&self, ctx: &StageContext, progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        let script = &self.script;
        if self.step == Step::FetchingMetadata {
            let now = script.running.fetch_add(1, Ordering::SeqCst) + 1;
            script.max_running.fetch_max(now, Ordering::SeqCst);
        }
        if let Some(gate) = script.gate.as_ref().filter(|g| g.step == self.step) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        sleep(script.delay).await;

        if script.fail_at == Some(self.step) {
            script.running.fetch_sub(1, Ordering::SeqCst);
            return Err(StageError::failed("scripted failure"));
        }

        let output = match self.step {
            Step::FetchingMetadata => StageOutput::Metadata {
                title: Some("Test video".to_string()),
            },
            Step::Downloading => StageOutput::Audio(AudioFile {
                path: ctx.workspace.audio_dir().join("audio.wav"),
                size_mb: 1.5,
            }),
            Step::Segmenting => StageOutput::Segments(
                (0..3)
                    .map(|index| SegmentFile {
                        index,
                        start_ms: index as u64 * 18_000,
                        path: ctx.workspace.segments_dir().join(format!("segment_{:04}.wav", index)),
                    })
                    .collect(),
            ),
            Step::Transcribing => {
                for fraction in &script.fractions {
                    progress.report(*fraction, "transcribing").await?;
                    sleep(script.delay).await;
                }
                StageOutput::Transcripts(Vec::new())
            }
            Step::Merging => StageOutput::Transcript {
                text: "hello world".to_string(),
                path: ctx.workspace.full_transcriptions_dir().join("full_text.txt"),
            },
            Step::Summarizing => StageOutput::Summary("<p>hello world</p>".to_string()),
            Step::Rendering => {
                let path = ctx.workspace.result_path();
                tokio::fs::write(&path, "<html><body><p>hello world</p></body></html>")
                    .await
                    .map_err(|e| StageError::failed(e.to_string()))?;
                script.running.fetch_sub(1, Ordering::SeqCst);
                script.renders.fetch_add(1, Ordering::SeqCst);
                StageOutput::Rendered(path)
            }
            Step::Queued | Step::Completed => unreachable!(),
        };
        Ok(StageSuccess::new(format!("{} ok", self.step), output))
    }
}

fn fake_stages(script: &Arc<Script>) -> Vec<Box<dyn Stage>> {
    Step::PIPELINE
        .iter()
        .map(|&step| {
            Box::new(FakeStage {
                step,
                script: script.clone(),
            }) as Box<dyn Stage>
        })
        .collect()
}

struct Harness {
    manager: Arc<TaskManager>,
    runner: Arc<PipelineRunner>,
    store: Arc<dyn TaskStore>,
    receiver: Option<JobReceiver>,
    script: Arc<Script>,
    workspace_root: PathBuf,
    _dir: TempDir,
}

impl Harness {
    async fn new(script: Script) -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tasks.db").display());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&url).await.unwrap());
        let workspace_root = dir.path().join("tasks");

        let script = Arc::new(script);
        let runner = Arc::new(PipelineRunner::new(store.clone(), fake_stages(&script), &workspace_root).unwrap());
        let (manager, receiver) = TaskManager::new(store.clone(), &workspace_root);

        Self {
            manager: Arc::new(manager),
            runner,
            store,
            receiver: Some(receiver),
            script,
            workspace_root,
            _dir: dir,
        }
    }

    fn start(&mut self, concurrency: usize) -> TaskScheduler {
        let receiver = self.receiver.take().expect("scheduler already started");
        TaskScheduler::start(self.manager.clone(), self.runner.clone(), receiver, concurrency)
    }

    async fn stop(&self, scheduler: TaskScheduler) {
        self.manager.shutdown().await;
        scheduler.join().await.unwrap();
    }
}

/// Delegates to a real store but fails exactly one `update` call.
struct FlakyStore {
    inner: Arc<dyn TaskStore>,
    fail_on_update: usize,
    updates: AtomicUsize,
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, task: &Task) -> Result<String, TaskError> {
        self.inner.create(task).await
    }

    async fn get(&self, task_id: &str) -> Result<Task, TaskError> {
        self.inner.get(task_id).await
    }

    async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<Task, TaskError> {
        let call = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_update {
            return Err(TaskError::Store(sqlx::Error::PoolTimedOut));
        }
        self.inner.update(task_id, patch).await
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, TaskError> {
        self.inner.list(query).await
    }

    async fn append_event(&self, task_id: &str, event_type: EventType, message: &str) -> Result<TaskEvent, TaskError> {
        self.inner.append_event(task_id, event_type, message).await
    }

    async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, TaskError> {
        self.inner.list_events(task_id).await
    }

    async fn delete(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.delete(task_id).await
    }

    async fn aggregate_stats(&self, since: DateTime<Utc>) -> Result<TaskStats, TaskError> {
        self.inner.aggregate_stats(since).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[TaskStatus]) -> Result<Vec<String>, TaskError> {
        self.inner.delete_older_than(cutoff, statuses).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

async fn wait_for_terminal(manager: &TaskManager, task_id: &str) -> Task {
    for _ in 0..1000 {
        let task = manager.get_status(task_id).await.unwrap();
        if task.status.is_terminal() {
            return task;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} did not finish", task_id);
}

#[tokio::test]
async fn test_submitted_task_runs_to_completion() {
    let mut h = Harness::new(Script::default()).await;

    let task_id = h.manager.submit("https://youtu.be/abc123").await.unwrap();
    let task = h.manager.get_status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.video_id, "abc123");
    assert!(matches!(
        h.manager.get_result(&task_id).await,
        Err(TaskError::NotReady { status: TaskStatus::Queued, .. })
    ));

    let scheduler = h.start(2);
    let task = wait_for_terminal(&h.manager, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.video_title.as_deref(), Some("Test video"));
    assert_eq!(task.progress.percent, 100.0);
    assert_eq!(task.progress.current_step, Step::Completed);
    assert_eq!(task.file_size, Some(1.5));
    assert_eq!(task.segments_count, Some(3));
    assert_eq!(task.transcription_length, Some(11));
    assert!(task.processing_time.unwrap() >= 0.0);
    assert!(task.completed_at.is_some());
    assert!(task.error_message.is_none());

    let html = h.manager.get_result(&task_id).await.unwrap();
    assert!(html.contains("hello world"));

    let events = h.manager.get_events(&task_id).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(types.first(), Some(&EventType::Created));
    assert_eq!(types.get(1), Some(&EventType::StatusChange));
    assert_eq!(types.last(), Some(&EventType::Completed));
    assert_eq!(types.iter().filter(|t| **t == EventType::StageCompleted).count(), 7);
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    h.stop(scheduler).await;
}

#[tokio::test]
async fn test_invalid_url_creates_nothing() {
    let h = Harness::new(Script::default()).await;

    let err = h.manager.submit("not-a-url").await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidInput(_)));

    assert!(h.manager.list(&TaskQuery::default()).await.unwrap().is_empty());
    assert_eq!(h.manager.get_stats().await.unwrap().total_tasks, 0);
}

#[tokio::test]
async fn test_stage_failure_fails_task() {
    let mut h = Harness::new(Script {
        fail_at: Some(Step::Downloading),
        ..Default::default()
    })
    .await;
    let scheduler = h.start(1);

    let task_id = h.manager.submit("https://www.youtube.com/watch?v=fail01").await.unwrap();
    let task = wait_for_terminal(&h.manager, &task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    let message = task.error_message.unwrap();
    assert!(message.contains("scripted failure"), "{}", message);
    assert!(task.completed_at.is_some());
    assert_eq!(task.processing_time, None);
    assert_eq!(task.file_size, None);
    assert_eq!(task.segments_count, None);
    assert_eq!(task.transcription_length, None);
    // title came from the stage before the failure
    assert_eq!(task.video_title.as_deref(), Some("Test video"));

    let events = h.manager.get_events(&task_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::Failed));
    assert!(events.iter().any(|e| e.event_type == EventType::StageFailed));
    assert!(!events.iter().any(|e| e.event_type == EventType::Completed));
    assert_eq!(h.script.renders.load(Ordering::SeqCst), 0);

    h.stop(scheduler).await;
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let mut h = Harness::new(Script {
        delay: Duration::from_millis(15),
        ..Default::default()
    })
    .await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(h.manager.submit(&format!("https://youtu.be/vid{}", i)).await.unwrap());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let manager = h.manager.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let query = TaskQuery {
                status: Some(TaskStatus::Processing),
                ..Default::default()
            };
            let mut max_seen = 0;
            while !stop.load(Ordering::SeqCst) {
                max_seen = max_seen.max(manager.list(&query).await.unwrap().len());
                sleep(Duration::from_millis(3)).await;
            }
            max_seen
        })
    };

    let scheduler = h.start(2);
    for id in &ids {
        assert_eq!(wait_for_terminal(&h.manager, id).await.status, TaskStatus::Completed);
    }
    stop.store(true, Ordering::SeqCst);

    let max_seen = sampler.await.unwrap();
    assert!(max_seen <= 2, "observed {} processing tasks", max_seen);
    assert!(h.script.max_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.script.renders.load(Ordering::SeqCst), 5);

    h.stop(scheduler).await;
}

#[tokio::test]
async fn test_concurrent_submissions_get_distinct_ids() {
    let mut h = Harness::new(Script::default()).await;
    let scheduler = h.start(3);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.submit(&format!("https://youtu.be/same{}", i % 2)).await })
        })
        .collect();
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().unwrap());
    }
    assert_eq!(ids.len(), 10);

    for id in &ids {
        assert!(wait_for_terminal(&h.manager, id).await.status.is_terminal());
    }
    let stats = h.manager.get_stats().await.unwrap();
    assert_eq!(stats.total_tasks, 10);
    assert_eq!(stats.status_counts.completed, 10);

    h.stop(scheduler).await;
}

#[tokio::test]
async fn test_progress_never_moves_backwards() {
    let mut h = Harness::new(Script {
        delay: Duration::from_millis(5),
        fractions: vec![0.2, 0.1, 0.6, 0.6, 1.0],
        ..Default::default()
    })
    .await;
    let task_id = h.manager.submit("https://youtu.be/mono01").await.unwrap();

    let sampler = {
        let manager = h.manager.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let task = manager.get_status(&task_id).await.unwrap();
                if task.status == TaskStatus::Processing {
                    seen.push(task.progress.percent);
                }
                if task.status.is_terminal() {
                    return (task, seen);
                }
                sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let scheduler = h.start(1);
    let (task, seen) = sampler.await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);

    h.stop(scheduler).await;
}

#[tokio::test]
async fn test_delete_processing_task_cancels_run() {
    let mut h = Harness::new(Script::gated(Step::Downloading)).await;
    let scheduler = h.start(1);

    let task_id = h.manager.submit("https://youtu.be/cancel1").await.unwrap();
    h.script.gate().entered.notified().await;

    let task = h.manager.get_status(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Processing);
    assert!(h.workspace_root.join(&task_id).exists());

    h.manager.delete(&task_id).await.unwrap();
    h.script.gate().release.notify_one();
    h.stop(scheduler).await;

    assert!(h.manager.get_status(&task_id).await.unwrap_err().is_not_found());
    assert!(h.manager.get_events(&task_id).await.unwrap_err().is_not_found());
    assert_eq!(h.script.renders.load(Ordering::SeqCst), 0);
    assert!(!h.workspace_root.join(&task_id).exists());
    assert_eq!(h.manager.get_stats().await.unwrap().total_tasks, 0);
}

#[tokio::test]
async fn test_delete_queued_task_never_runs() {
    let mut h = Harness::new(Script::gated(Step::FetchingMetadata)).await;
    let scheduler = h.start(1);

    let first = h.manager.submit("https://youtu.be/first1").await.unwrap();
    h.script.gate().entered.notified().await;
    let second = h.manager.submit("https://youtu.be/second").await.unwrap();
    assert_eq!(h.manager.get_status(&second).await.unwrap().status, TaskStatus::Queued);

    h.manager.delete(&second).await.unwrap();
    h.script.gate().release.notify_one();

    assert_eq!(wait_for_terminal(&h.manager, &first).await.status, TaskStatus::Completed);
    h.stop(scheduler).await;

    assert!(h.manager.get_status(&second).await.unwrap_err().is_not_found());
    assert_eq!(h.script.renders.load(Ordering::SeqCst), 1);
    assert!(h.manager.delete(&second).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_cleanup_removes_old_terminal_tasks_and_workspaces() {
    let h = Harness::new(Script::default()).await;

    let mut seeded = Vec::new();
    for days in [40, 40, 40, 10] {
        let completed_at = Utc::now() - ChronoDuration::days(days);
        let mut task = Task::queued(
            format!("seed-{}", seeded.len()),
            "old".to_string(),
            "https://www.youtube.com/watch?v=old".to_string(),
        );
        task.created_at = completed_at - ChronoDuration::minutes(3);
        task.updated_at = completed_at;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(completed_at);
        h.store.create(&task).await.unwrap();

        let workspace = Workspace::new(&h.workspace_root, &task.task_id);
        workspace.prepare().await.unwrap();
        seeded.push(workspace);
    }

    assert_eq!(h.manager.cleanup(30).await.unwrap(), 3);

    let remaining = h.manager.list(&TaskQuery::default()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_id, "seed-3");
    assert!(seeded[..3].iter().all(|w| !w.root().exists()));
    assert!(seeded[3].root().exists());
    assert_eq!(h.manager.cleanup(30).await.unwrap(), 0);
}

#[tokio::test]
async fn test_recover_fails_interrupted_and_requeues_queued() {
    let mut h = Harness::new(Script::default()).await;

    let interrupted = Task::queued("left-running".into(), "a1".into(), "https://youtu.be/a1".into());
    h.store.create(&interrupted).await.unwrap();
    let progress = Progress::new(Step::Transcribing, 40.0, "Transcribing").unwrap();
    h.store
        .update(&interrupted.task_id, TaskPatch::processing(progress))
        .await
        .unwrap();
    let waiting = Task::queued("left-queued".into(), "b2".into(), "https://youtu.be/b2".into());
    h.store.create(&waiting).await.unwrap();

    assert_eq!(h.manager.recover().await.unwrap(), (1, 1));
    let scheduler = h.start(1);

    let task = wait_for_terminal(&h.manager, "left-running").await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("interrupted"));
    assert_eq!(wait_for_terminal(&h.manager, "left-queued").await.status, TaskStatus::Completed);

    h.stop(scheduler).await;
}

#[tokio::test]
async fn test_submit_after_shutdown_is_unavailable() {
    let mut h = Harness::new(Script::default()).await;
    let scheduler = h.start(1);
    h.stop(scheduler).await;

    let err = h.manager.submit("https://youtu.be/late01").await.unwrap_err();
    assert!(matches!(err, TaskError::Unavailable(_)));

    let tasks = h.manager.list(&TaskQuery::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_runner_rejects_misordered_stages() {
    let h = Harness::new(Script::default()).await;
    let mut stages = fake_stages(&h.script);
    stages.swap(0, 1);
    assert!(PipelineRunner::new(h.store.clone(), stages, &h.workspace_root).is_err());
}

#[tokio::test]
async fn test_runner_skips_task_that_is_not_queued() {
    let h = Harness::new(Script::default()).await;
    let task = Task::queued("done".into(), "c3".into(), "https://youtu.be/c3".into());
    h.store.create(&task).await.unwrap();
    h.store.update("done", TaskPatch::failed("gave up")).await.unwrap();

    let outcome = h.runner.run("done", &AtomicBool::new(false)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped);
    assert_eq!(h.script.max_running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cleanup_with_unrepresentable_age_deletes_nothing() {
    let h = Harness::new(Script::default()).await;
    let completed_at = Utc::now() - ChronoDuration::days(400);
    let mut task = Task::queued("ancient".into(), "old".into(), "https://youtu.be/old".into());
    task.created_at = completed_at - ChronoDuration::minutes(1);
    task.updated_at = completed_at;
    task.status = TaskStatus::Completed;
    task.completed_at = Some(completed_at);
    h.store.create(&task).await.unwrap();

    assert_eq!(h.manager.cleanup(u32::MAX).await.unwrap(), 0);
    assert_eq!(h.manager.cleanup(100_000_000).await.unwrap(), 0);
    assert_eq!(h.manager.get_status("ancient").await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_unpreparable_workspace_fails_queued_task() {
    let h = Harness::new(Script::default()).await;
    let blocked_root = h._dir.path().join("not-a-dir");
    std::fs::write(&blocked_root, b"occupied").unwrap();
    let runner = PipelineRunner::new(h.store.clone(), fake_stages(&h.script), &blocked_root).unwrap();

    let task = Task::queued("no-room".into(), "d4".into(), "https://youtu.be/d4".into());
    h.store.create(&task).await.unwrap();

    let outcome = runner.run("no-room", &AtomicBool::new(false)).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed);

    let task = h.store.get("no-room").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.completed_at.is_some());
    assert!(task.error_message.unwrap().contains("working storage"));

    let events = h.store.list_events("no-room").await.unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::Failed));
    // the task never entered Processing
    assert!(!events.iter().any(|e| e.event_type == EventType::StatusChange));
    assert_eq!(h.script.max_running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_store_failure_mid_run_is_returned() {
    let h = Harness::new(Script::default()).await;
    // claim, first progress write, then the title write fails
    let flaky: Arc<dyn TaskStore> = Arc::new(FlakyStore {
        inner: h.store.clone(),
        fail_on_update: 3,
        updates: AtomicUsize::new(0),
    });
    let runner = PipelineRunner::new(flaky, fake_stages(&h.script), &h.workspace_root).unwrap();

    let task = Task::queued("flaky".into(), "e5".into(), "https://youtu.be/e5".into());
    h.store.create(&task).await.unwrap();

    let err = runner.run("flaky", &AtomicBool::new(false)).await.unwrap_err();
    assert!(matches!(err, TaskError::Store(_)), "{:?}", err);

    let task = h.store.get("flaky").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("store failure"));
    let events = h.store.list_events("flaky").await.unwrap();
    assert!(!events.iter().any(|e| e.event_type == EventType::Completed));
    assert_eq!(h.script.renders.load(Ordering::SeqCst), 0);
}
