pub mod download;
pub mod merge;
pub mod metadata;
pub mod render;
pub mod segment;
pub mod summarize;
pub mod transcribe;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asr::AsrEngine;
use crate::config::AppConfig;
use crate::schedule::error::TaskError;
use crate::schedule::types::{Step, TaskMetrics};
use crate::schedule::workspace::Workspace;

pub use download::DownloadStage;
pub use merge::MergeStage;
pub use metadata::MetadataStage;
pub use render::RenderStage;
pub use segment::SegmentStage;
pub use summarize::SummarizeStage;
pub use transcribe::TranscribeStage;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFile {
    pub path: PathBuf,
    /// Size on disk in MB.
    pub size_mb: f64,
}

/// One window of the source audio written to `segments/`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFile {
    pub index: usize,
    pub start_ms: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedText {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Transcript of a single window; times are relative to the window start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentTranscript {
    pub segment_number: usize,
    pub start_ms: u64,
    pub text: String,
    pub segments: Vec<TimedText>,
}

/// What a stage hands back to the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Metadata { title: Option<String> },
    Audio(AudioFile),
    Segments(Vec<SegmentFile>),
    Transcripts(Vec<SegmentTranscript>),
    Transcript { text: String, path: PathBuf },
    Summary(String),
    Rendered(PathBuf),
}

/// Outputs of the stages that already ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifacts {
    pub video_title: Option<String>,
    pub audio: Option<AudioFile>,
    pub segments: Vec<SegmentFile>,
    pub transcripts: Vec<SegmentTranscript>,
    pub transcript: Option<String>,
    pub transcript_path: Option<PathBuf>,
    pub summary: Option<String>,
    pub html_path: Option<PathBuf>,
}

impl Artifacts {
    pub fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::Metadata { title } => self.video_title = title,
            StageOutput::Audio(audio) => self.audio = Some(audio),
            StageOutput::Segments(segments) => self.segments = segments,
            StageOutput::Transcripts(transcripts) => self.transcripts = transcripts,
            StageOutput::Transcript { text, path } => {
                self.transcript = Some(text);
                self.transcript_path = Some(path);
            }
            StageOutput::Summary(summary) => self.summary = Some(summary),
            StageOutput::Rendered(path) => self.html_path = Some(path),
        }
    }

    pub fn metrics(&self) -> TaskMetrics {
        TaskMetrics {
            file_size: self.audio.as_ref().map(|a| a.size_mb).unwrap_or(0.0),
            segments_count: self.segments.len() as i64,
            transcription_length: self
                .transcript
                .as_ref()
                .map(|t| t.chars().count() as i64)
                .unwrap_or(0),
        }
    }
}

/// Read-only view a stage runs against.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub task_id: String,
    pub video_id: String,
    pub source_url: String,
    pub workspace: Workspace,
    pub artifacts: Artifacts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageSuccess {
    pub message: String,
    pub output: StageOutput,
}

impl StageSuccess {
    pub fn new(message: impl Into<String>, output: StageOutput) -> Self {
        Self {
            message: message.into(),
            output,
        }
    }
}

#[derive(Error, Debug)]
pub enum StageError {
    /// The stage could not do its work; the task fails with this message.
    #[error("{0}")]
    Failed(String),

    /// A progress write hit the store.
    #[error(transparent)]
    Store(#[from] TaskError),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        StageError::Failed(message.into())
    }

    pub fn missing(what: &str) -> Self {
        StageError::Failed(format!("{} is not available from earlier stages", what))
    }
}

impl From<anyhow::Error> for StageError {
    fn from(e: anyhow::Error) -> Self {
        StageError::Failed(format!("{:#}", e))
    }
}

/// Receives the absolute progress of the running task.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, step: Step, percent: f64, message: String) -> Result<(), TaskError>;
}

/// Progress handle scoped to one stage's band of the 0-100 range.
pub struct StageProgress<'a> {
    sink: &'a dyn ProgressSink,
    step: Step,
    start: f64,
    end: f64,
}

impl<'a> StageProgress<'a> {
    pub fn new(sink: &'a dyn ProgressSink, step: Step, start: f64, end: f64) -> Self {
        Self { sink, step, start, end }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Reports `fraction` (0.0 to 1.0) of the stage as done.
    pub async fn report(&self, fraction: f64, message: impl Into<String>) -> Result<(), TaskError> {
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        let percent = self.start + (self.end - self.start) * fraction;
        self.sink.report(self.step, percent, message.into()).await
    }
}

/// One step of the pipeline. Stages never touch the task store; they only
/// read the context, write into the workspace and report progress.
#[async_trait]
pub trait Stage: Send + Sync {
    fn step(&self) -> Step;

    async fn run(&self, ctx: &StageContext, progress: &StageProgress<'_>) -> Result<StageSuccess, StageError>;
}

/// The production stage sequence.
pub fn default_stages(config: &AppConfig, asr: Arc<dyn AsrEngine>) -> anyhow::Result<Vec<Box<dyn Stage>>> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    Ok(vec![
        Box::new(MetadataStage::new(client.clone())),
        Box::new(DownloadStage::new(config.ytdlp_bin.clone())),
        Box::new(SegmentStage::new(
            config.ffmpeg_bin.clone(),
            config.noise_reduction,
            config.segment_ms,
            config.segment_overlap_ms,
        )),
        Box::new(TranscribeStage::new(asr, config.language.clone())),
        Box::new(MergeStage),
        Box::new(SummarizeStage::new(client, config.llm_url.clone(), config.llm_model.clone())),
        Box::new(RenderStage),
    ])
}
