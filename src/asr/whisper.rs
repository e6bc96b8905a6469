use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::asr::{AsrEngine, AsrParams, TranscribeResult, TranscribeSegment};

/// whisper.cpp engine. The model is loaded once and shared by every worker;
/// each call creates its own decoding state on a blocking thread.
pub struct WhisperAsr {
    whisper_ctx: Arc<WhisperContext>,
}

impl WhisperAsr {
    pub fn new(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let path = model_path
            .to_str()
            .ok_or_else(|| anyhow!("model path is not valid UTF-8: {}", model_path.display()))?;
        match WhisperContext::new_with_params(path, WhisperContextParameters::default()) {
            Ok(whisper_ctx) => {
                info!("Loaded whisper model from {}", model_path.display());
                Ok(Self { whisper_ctx: Arc::new(whisper_ctx) })
            }
            Err(e) => Err(anyhow!("failed to open whisper model {}: {}", model_path.display(), e)),
        }
    }
}

fn build_params(ap: &AsrParams) -> FullParams<'_, '_> {
    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

    // low temperature keeps the output deterministic
    params.set_temperature(0.0);
    params.set_n_threads(num_threads());
    params.set_translate(false);
    params.set_language(Some(ap.language.as_deref().unwrap_or("auto")));

    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    // windows are transcribed independently
    params.set_no_context(true);
    params.set_single_segment(false);
    params.set_suppress_blank(true);
    params.set_suppress_non_speech_tokens(true);
    params.set_duration_ms(0);
    params.set_max_initial_ts(1.0);

    params
}

fn num_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8) as i32)
        .unwrap_or(4)
}

fn run_full(ctx: &WhisperContext, audio: &[f32], user_params: &AsrParams) -> Result<TranscribeResult> {
    let mut state = ctx.create_state()?;
    let params = build_params(user_params);

    state.full(params, audio)?;
    let num_segments = state.full_n_segments()?;

    let mut segments = Vec::new();
    let mut full_text = String::new();

    for i in 0..num_segments {
        let text = state.full_get_segment_text(i)?;
        // whisper timestamps are in units of 10 ms
        let start = state.full_get_segment_t0(i)? as f64 / 100.0;
        let end = state.full_get_segment_t1(i)? as f64 / 100.0;

        full_text.push_str(&text);
        segments.push(TranscribeSegment {
            text,
            start,
            end,
        });
    }

    debug!("Decoded {} segments from {} samples", segments.len(), audio.len());
    Ok(TranscribeResult {
        segments,
        full_text: full_text.trim().to_string(),
    })
}

#[async_trait::async_trait]
impl AsrEngine for WhisperAsr {
    async fn transcribe(&self, audio: Vec<f32>, user_params: AsrParams) -> Result<TranscribeResult> {
        let ctx = self.whisper_ctx.clone();
        tokio::task::spawn_blocking(move || run_full(&ctx, &audio, &user_params))
            .await
            .map_err(|e| anyhow!("whisper worker panicked: {}", e))?
    }
}
