use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{AudioFile, Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess};
use crate::schedule::types::Step;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Fetches the audio track with yt-dlp into `audio/<video_id>.wav`.
pub struct DownloadStage {
    ytdlp_bin: String,
}

impl DownloadStage {
    pub fn new(ytdlp_bin: impl Into<String>) -> Self {
        Self {
            ytdlp_bin: ytdlp_bin.into(),
        }
    }

    async fn download(&self, url: &str, audio_dir: &Path, video_id: &str) -> anyhow::Result<PathBuf> {
        let target = audio_dir.join(format!("{}.wav", video_id));
        let template = audio_dir.join(format!("{}.%(ext)s", video_id));

        let output = Command::new(&self.ytdlp_bin)
            .args(["--no-playlist", "--no-progress", "--quiet", "--no-warnings"])
            .args(["-f", "bestaudio/best", "-x", "--audio-format", "wav"])
            .arg("-o")
            .arg(&template)
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.ytdlp_bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("yt-dlp exited with {}: {}", output.status, stderr.trim()));
        }
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(anyhow!("audio file not found after download: {}", target.display()));
        }
        Ok(target)
    }
}

/// Size of `path` in MB, or `None` when it does not exist.
async fn file_size_mb(path: &Path) -> Option<f64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len() as f64 / BYTES_PER_MB),
        _ => None,
    }
}

#[async_trait]
impl Stage for DownloadStage {
    fn step(&self) -> Step {
        Step::Downloading
    }

    async fn run(&self, ctx: &StageContext, progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        let audio_dir = ctx.workspace.audio_dir();
        let existing = audio_dir.join(format!("{}.wav", ctx.video_id));

        let path = if file_size_mb(&existing).await.is_some() {
            info!(task_id = %ctx.task_id, "reusing downloaded audio {}", existing.display());
            existing
        } else {
            progress.report(0.0, "Downloading audio").await?;
            self.download(&ctx.source_url, &audio_dir, &ctx.video_id).await?
        };

        let size_mb = match file_size_mb(&path).await {
            Some(size) => size,
            None => {
                warn!(task_id = %ctx.task_id, "downloaded audio is empty");
                return Err(StageError::failed(format!("downloaded audio is empty: {}", path.display())));
            }
        };

        Ok(StageSuccess::new(
            format!("Downloaded {:.2} MB of audio", size_mb),
            StageOutput::Audio(AudioFile { path, size_mb }),
        ))
    }
}
