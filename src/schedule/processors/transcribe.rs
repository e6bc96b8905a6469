use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    SegmentFile, SegmentTranscript, Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess,
    TimedText,
};
use crate::asr::{AsrEngine, AsrParams};
use crate::audio;
use crate::schedule::types::Step;

/// Runs speech recognition over every segment, one at a time.
pub struct TranscribeStage {
    asr: Arc<dyn AsrEngine>,
    language: Option<String>,
}

impl TranscribeStage {
    pub fn new(asr: Arc<dyn AsrEngine>, language: Option<String>) -> Self {
        Self { asr, language }
    }

    async fn transcribe_segment(&self, segment: &SegmentFile) -> anyhow::Result<SegmentTranscript> {
        let path = segment.path.clone();
        let samples = tokio::task::spawn_blocking(move || audio::read_window(&path))
            .await
            .map_err(|e| anyhow!("audio reader panicked: {}", e))??;

        let mut params = AsrParams::new();
        params.set_language(self.language.clone());

        let result = self
            .asr
            .transcribe(samples, params)
            .await
            .with_context(|| format!("failed to transcribe segment {}", segment.index))?;

        Ok(SegmentTranscript {
            segment_number: segment.index,
            start_ms: segment.start_ms,
            text: result.full_text,
            segments: result
                .segments
                .into_iter()
                .map(|s| TimedText {
                    start: s.start,
                    end: s.end,
                    text: s.text,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl Stage for TranscribeStage {
    fn step(&self) -> Step {
        Step::Transcribing
    }

    async fn run(&self, ctx: &StageContext, progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        let segments = &ctx.artifacts.segments;
        if segments.is_empty() {
            return Err(StageError::missing("audio segments"));
        }

        let out_dir = ctx.workspace.transcriptions_dir();
        let total = segments.len();
        let mut transcripts = Vec::with_capacity(total);

        for (done, segment) in segments.iter().enumerate() {
            let transcript = self.transcribe_segment(segment).await?;

            let json_path = out_dir.join(format!("segment_{:04}.json", segment.index));
            let json = serde_json::to_vec_pretty(&transcript).context("failed to encode transcript")?;
            tokio::fs::write(&json_path, json)
                .await
                .with_context(|| format!("failed to write {}", json_path.display()))?;

            debug!(task_id = %ctx.task_id, "transcribed segment {}/{}", done + 1, total);
            transcripts.push(transcript);
            progress
                .report(
                    (done + 1) as f64 / total as f64,
                    format!("Transcribed segment {}/{}", done + 1, total),
                )
                .await?;
        }

        info!(task_id = %ctx.task_id, "transcribed {} segments", total);
        Ok(StageSuccess::new(
            format!("Transcribed {} segments", total),
            StageOutput::Transcripts(transcripts),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::{TranscribeResult, TranscribeSegment};
    use crate::schedule::error::TaskError;
    use crate::schedule::processors::{Artifacts, ProgressSink};
    use crate::schedule::workspace::Workspace;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct EchoAsr;

    #[async_trait]
    impl AsrEngine for EchoAsr {
        async fn transcribe(&self, audio: Vec<f32>, _params: AsrParams) -> anyhow::Result<TranscribeResult> {
            let text = format!("{} samples", audio.len());
            Ok(TranscribeResult {
                segments: vec![TranscribeSegment {
                    text: text.clone(),
                    start: 0.0,
                    end: audio.len() as f64 / 16_000.0,
                }],
                full_text: text,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<f64>>);

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn report(&self, _step: Step, percent: f64, _message: String) -> Result<(), TaskError> {
            self.0.lock().unwrap().push(percent);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transcribes_every_segment_with_sub_progress() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = Workspace::new(dir.path(), "t-1");
        workspace.prepare().await?;

        let mut artifacts = Artifacts::default();
        for (index, seconds) in [(0usize, 2usize), (1, 1)] {
            let path = workspace.segments_dir().join(format!("segment_{:04}.wav", index));
            audio::write_wav(&path, &vec![0.25; seconds * 16_000])?;
            artifacts.segments.push(SegmentFile {
                index,
                start_ms: index as u64 * 18_000,
                path,
            });
        }
        let ctx = StageContext {
            task_id: "t-1".into(),
            video_id: "abc123".into(),
            source_url: "https://www.youtube.com/watch?v=abc123".into(),
            workspace: workspace.clone(),
            artifacts,
        };

        let sink = RecordingSink::default();
        let progress = StageProgress::new(&sink, Step::Transcribing, 25.0, 70.0);
        let success = TranscribeStage::new(Arc::new(EchoAsr), None).run(&ctx, &progress).await?;

        let StageOutput::Transcripts(transcripts) = success.output else {
            panic!("unexpected output");
        };
        assert_eq!(transcripts.len(), 2);
        assert_eq!(transcripts[1].text, "16000 samples");
        assert_eq!(transcripts[1].start_ms, 18_000);
        assert!(workspace.transcriptions_dir().join("segment_0001.json").exists());
        assert_eq!(*sink.0.lock().unwrap(), vec![47.5, 70.0]);
        Ok(())
    }
}
