use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use super::{SegmentTranscript, Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess, TimedText};
use crate::schedule::types::Step;

#[derive(Debug, Serialize)]
struct MergedTranscript {
    /// Window transcripts with absolute timestamps.
    segments: Vec<SegmentTranscript>,
    text: String,
}

/// Joins window transcripts in order into `full_transcriptions/`.
pub struct MergeStage;

fn merge(transcripts: &[SegmentTranscript]) -> MergedTranscript {
    let mut segments = transcripts.to_vec();
    segments.sort_by_key(|t| t.segment_number);

    for window in &mut segments {
        let offset = window.start_ms as f64 / 1000.0;
        window.segments = window
            .segments
            .iter()
            .map(|s| TimedText {
                start: s.start + offset,
                end: s.end + offset,
                text: s.text.clone(),
            })
            .collect();
    }

    let text = segments
        .iter()
        .map(|t| t.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    MergedTranscript { segments, text }
}

async fn write(path: &Path, contents: impl AsRef<[u8]>) -> anyhow::Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

#[async_trait]
impl Stage for MergeStage {
    fn step(&self) -> Step {
        Step::Merging
    }

    async fn run(&self, ctx: &StageContext, _progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        if ctx.artifacts.transcripts.is_empty() {
            return Err(StageError::missing("segment transcripts"));
        }

        let merged = merge(&ctx.artifacts.transcripts);
        if merged.text.is_empty() {
            return Err(StageError::failed("no speech was recognised in the audio"));
        }

        let dir = ctx.workspace.full_transcriptions_dir();
        let json = serde_json::to_vec_pretty(&merged).context("failed to encode transcript")?;
        write(&dir.join("transcript.json"), json).await?;
        let text_path = dir.join("full_text.txt");
        write(&text_path, &merged.text).await?;

        Ok(StageSuccess::new(
            format!("Merged transcript of {} characters", merged.text.chars().count()),
            StageOutput::Transcript {
                text: merged.text,
                path: text_path,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(number: usize, start_ms: u64, text: &str) -> SegmentTranscript {
        SegmentTranscript {
            segment_number: number,
            start_ms,
            text: text.to_string(),
            segments: vec![TimedText {
                start: 0.5,
                end: 2.0,
                text: text.to_string(),
            }],
        }
    }

    #[test]
    fn test_merge_orders_and_offsets_windows() {
        let merged = merge(&[window(1, 18_000, " second "), window(0, 0, "first"), window(2, 36_000, "  ")]);

        assert_eq!(merged.text, "first\nsecond");
        assert_eq!(merged.segments[0].segment_number, 0);
        assert_eq!(merged.segments[1].segments[0].start, 18.5);
        assert_eq!(merged.segments[1].segments[0].end, 20.0);
    }
}
