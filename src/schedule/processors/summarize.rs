use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess};
use crate::schedule::types::Step;

const SYSTEM_PROMPT: &str = "You are an expert educator and instructional designer. \
Follow the instructions precisely and output only the requested structured content.";

const PROMPT_TEMPLATE: &str = r#"Below, between triple backticks, is the raw transcription of a video. It may contain recognition errors, repetitions and broken sentences. Study it carefully and turn it into a structured study document.

```
{transcript}
```

Rules:
- Output valid HTML only: the content that goes inside <body>, with no surrounding document.
- Sections use <div class="section">, questions <div class="question">, answers <div class="answer">, key points <span class="highlight"> and emojis <span class="emoji">.
- Use <h1>, <h2> and <h3> for an outline of the ideas, and proper <table> markup for comparisons.
- Keep every meaningful idea from the transcription and add nothing that is not in it.
- Finish with five conceptual questions with answers, five multiple-choice questions (A-D, with the correct answer explained) and five open-ended questions.
- Write in the language of the transcription."#;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    content: Option<String>,
}

/// Turns the transcript into an HTML body through an OpenAI-compatible chat endpoint.
pub struct SummarizeStage {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl SummarizeStage {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    async fn complete(&self, transcript: &str) -> anyhow::Result<String> {
        let prompt = PROMPT_TEMPLATE.replace("{transcript}", transcript);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT },
                ChatMessage { role: "user", content: &prompt },
            ],
            temperature: 0.3,
            max_tokens: 32_768,
            stream: false,
        };

        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("language model request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("language model returned HTTP {}: {}", status, body.trim()));
        }

        let body: ChatResponse = response.json().await.context("malformed language model response")?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("language model returned no content"))
    }
}

/// Removes `<think>...</think>` reasoning blocks and collapses the blank lines they leave.
pub fn strip_think_blocks(content: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let lower = content.to_ascii_lowercase();
    let mut kept = String::with_capacity(content.len());
    let mut pos = 0;
    while let Some(start) = lower[pos..].find(OPEN).map(|i| pos + i) {
        let Some(end) = lower[start..].find(CLOSE).map(|i| start + i + CLOSE.len()) else {
            break;
        };
        kept.push_str(&content[pos..start]);
        pos = end;
    }
    kept.push_str(&content[pos..]);

    let mut out = String::with_capacity(kept.len());
    let mut blank_run = 0;
    for line in kept.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[async_trait]
impl Stage for SummarizeStage {
    fn step(&self) -> Step {
        Step::Summarizing
    }

    async fn run(&self, ctx: &StageContext, progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        let transcript = ctx.artifacts.transcript.as_deref().ok_or_else(|| StageError::missing("transcript"))?;
        progress.report(0.0, format!("Sending transcript to {}", self.model)).await?;

        let raw = self.complete(transcript).await?;
        let summary = strip_think_blocks(&raw);
        if summary.is_empty() {
            return Err(StageError::failed("language model returned an empty summary"));
        }

        info!(task_id = %ctx.task_id, "summary has {} characters", summary.len());
        Ok(StageSuccess::new("Summary generated", StageOutput::Summary(summary)))
    }
}
