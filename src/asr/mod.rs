use anyhow::Result;
use serde::{Serialize, Deserialize};
use async_trait::async_trait;

pub mod whisper;

#[derive(Debug, Clone, Default)]
pub struct AsrParams {
    /// Language hint; `None` lets the engine detect it.
    pub language: Option<String>,
}

impl AsrParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_language(&mut self, language: Option<String>) -> &mut Self {
        self.language = language;
        self
    }
}

/// One recognised span. Times are seconds from the start of the input audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscribeResult {
    pub segments: Vec<TranscribeSegment>,
    pub full_text: String,
}

/// Speech recognition backend. `audio` is mono f32 PCM at 16 kHz.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn transcribe(&self, audio: Vec<f32>, params: AsrParams) -> Result<TranscribeResult>;
}
