use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess};
use crate::schedule::types::Step;

const OEMBED_URL: &str = "https://www.youtube.com/oembed";

#[derive(Debug, Deserialize)]
struct OEmbed {
    title: Option<String>,
    author_name: Option<String>,
}

/// Looks up the video title through the public oEmbed endpoint.
pub struct MetadataStage {
    client: reqwest::Client,
    endpoint: String,
}

impl MetadataStage {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, OEMBED_URL)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn fetch(&self, source_url: &str) -> anyhow::Result<OEmbed> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("url", source_url), ("format", "json")])
            .send()
            .await
            .context("oEmbed request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("video metadata unavailable: HTTP {}", response.status()));
        }
        response.json::<OEmbed>().await.context("malformed oEmbed response")
    }
}

#[async_trait]
impl Stage for MetadataStage {
    fn step(&self) -> Step {
        Step::FetchingMetadata
    }

    async fn run(&self, ctx: &StageContext, progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        progress.report(0.0, "Fetching video information").await?;
        let meta = self.fetch(&ctx.source_url).await?;

        let title = meta.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        info!(task_id = %ctx.task_id, title = ?title, author = ?meta.author_name, "fetched video metadata");

        let message = match &title {
            Some(title) => format!("Found \"{}\"", title),
            None => "Video has no title".to_string(),
        };
        Ok(StageSuccess::new(message, StageOutput::Metadata { title }))
    }
}
