use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::info;

use super::{SegmentFile, Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess};
use crate::audio;
use crate::schedule::types::Step;

/// Decodes the downloaded audio and cuts it into overlapping 16 kHz WAV windows.
pub struct SegmentStage {
    ffmpeg_bin: String,
    noise_reduction: bool,
    window_ms: u64,
    overlap_ms: u64,
}

impl SegmentStage {
    pub fn new(ffmpeg_bin: impl Into<String>, noise_reduction: bool, window_ms: u64, overlap_ms: u64) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            noise_reduction,
            window_ms,
            overlap_ms,
        }
    }
}

fn split_to_files(
    source: &Path,
    out_dir: &Path,
    ffmpeg_bin: &str,
    noise_reduction: bool,
    window_ms: u64,
    overlap_ms: u64,
) -> anyhow::Result<Vec<SegmentFile>> {
    let samples = audio::load_samples(source, ffmpeg_bin, noise_reduction)?;
    let windows = audio::split_windows(&samples, window_ms, overlap_ms)?;

    windows
        .into_iter()
        .map(|window| {
            let path = out_dir.join(format!("segment_{:04}.wav", window.index));
            audio::write_wav(&path, &window.samples)
                .with_context(|| format!("failed to write segment {}", window.index))?;
            Ok(SegmentFile {
                index: window.index,
                start_ms: window.start_ms,
                path,
            })
        })
        .collect()
}

#[async_trait]
impl Stage for SegmentStage {
    fn step(&self) -> Step {
        Step::Segmenting
    }

    async fn run(&self, ctx: &StageContext, progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        let audio_file = ctx.artifacts.audio.as_ref().ok_or_else(|| StageError::missing("downloaded audio"))?;
        progress.report(0.0, "Splitting audio into segments").await?;

        let source: PathBuf = audio_file.path.clone();
        let out_dir = ctx.workspace.segments_dir();
        let ffmpeg_bin = self.ffmpeg_bin.clone();
        let (noise_reduction, window_ms, overlap_ms) = (self.noise_reduction, self.window_ms, self.overlap_ms);

        let segments = tokio::task::spawn_blocking(move || {
            split_to_files(&source, &out_dir, &ffmpeg_bin, noise_reduction, window_ms, overlap_ms)
        })
        .await
        .map_err(|e| anyhow!("segmentation worker panicked: {}", e))??;

        if segments.is_empty() {
            return Err(StageError::failed("audio is shorter than one second"));
        }

        info!(task_id = %ctx.task_id, "split audio into {} segments", segments.len());
        Ok(StageSuccess::new(
            format!("Created {} segments", segments.len()),
            StageOutput::Segments(segments),
        ))
    }
}
