use std::io;
use std::path::{Path, PathBuf};

const RESULT_FILE: &str = "summary.html";

/// Per-task working storage: `<root>/<task_id>/{audio,segments,transcriptions,full_transcriptions,processed}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(data_root: &Path, task_id: &str) -> Self {
        Self {
            root: data_root.join(task_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.root.join("segments")
    }

    pub fn transcriptions_dir(&self) -> PathBuf {
        self.root.join("transcriptions")
    }

    pub fn full_transcriptions_dir(&self) -> PathBuf {
        self.root.join("full_transcriptions")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    /// The rendered document served as the task result.
    pub fn result_path(&self) -> PathBuf {
        self.processed_dir().join(RESULT_FILE)
    }

    pub async fn prepare(&self) -> io::Result<()> {
        for dir in [
            self.audio_dir(),
            self.segments_dir(),
            self.transcriptions_dir(),
            self.full_transcriptions_dir(),
            self.processed_dir(),
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Removes the whole tree; a workspace that was never created is not an error.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prepare_and_remove() -> io::Result<()> {
        let dir = TempDir::new()?;
        let workspace = Workspace::new(dir.path(), "task-1");

        workspace.prepare().await?;
        assert!(workspace.segments_dir().is_dir());
        assert_eq!(workspace.result_path(), dir.path().join("task-1/processed/summary.html"));

        workspace.remove().await?;
        assert!(!workspace.root().exists());
        workspace.remove().await?;
        Ok(())
    }
}
