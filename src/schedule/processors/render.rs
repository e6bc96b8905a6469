use anyhow::Context;
use async_trait::async_trait;

use super::{Stage, StageContext, StageError, StageOutput, StageProgress, StageSuccess};
use crate::schedule::types::Step;

const DEFAULT_TITLE: &str = "Video Transcription Summary";

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>
        body { font-family: serif; line-height: 1.6; margin: 0; padding: 2cm; color: #333; background: #fff; }
        h1 { font-size: 24px; color: #2E4057; text-align: center; margin-bottom: 30px; border-bottom: 2px solid #2E4057; padding-bottom: 10px; }
        h2 { font-size: 20px; color: #2E4057; margin-top: 25px; margin-bottom: 15px; }
        h3 { font-size: 16px; color: #34495E; margin-top: 20px; margin-bottom: 10px; }
        p { margin: 10px 0; text-align: justify; }
        ul, ol { margin: 10px 0; }
        li { margin: 5px 0; }
        .section { margin: 20px 0; padding: 15px; background: #f8f9fa; border-radius: 5px; }
        .highlight { background: #fff3cd; padding: 2px 5px; border-radius: 3px; }
        .question { background: #e3f2fd; padding: 10px; margin: 10px 0; border-radius: 5px; }
        .answer { background: #f1f8e9; padding: 10px; margin: 10px 0; border-radius: 5px; }
        .emoji { font-size: 1.2em; margin: 0 5px; }
        table { width: 100%; border-collapse: collapse; margin: 20px 0; box-shadow: 0 1px 3px rgba(0,0,0,0.1); }
        th, td { padding: 12px; border: 1px solid #ddd; }
        th { background-color: #2E4057; color: white; font-weight: bold; }
        tr:nth-child(even) { background-color: #f8f9fa; }
    </style>
</head>
<body>
{content}
</body>
</html>
"#;

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Wraps a summary body in the result document. The body is trusted HTML.
pub fn render_document(title: Option<&str>, body: &str) -> String {
    let title = escape_html(title.unwrap_or(DEFAULT_TITLE));
    let (head, tail) = HTML_TEMPLATE.split_once("{content}").unwrap_or((HTML_TEMPLATE, ""));
    let mut html = head.replacen("{title}", &title, 1);
    html.push_str(body);
    html.push_str(tail);
    html
}

/// Writes `processed/summary.html`.
pub struct RenderStage;

#[async_trait]
impl Stage for RenderStage {
    fn step(&self) -> Step {
        Step::Rendering
    }

    async fn run(&self, ctx: &StageContext, _progress: &StageProgress<'_>) -> Result<StageSuccess, StageError> {
        let summary = ctx.artifacts.summary.as_deref().ok_or_else(|| StageError::missing("summary"))?;
        let html = render_document(ctx.artifacts.video_title.as_deref(), summary);

        let path = ctx.workspace.result_path();
        tokio::fs::write(&path, html)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(StageSuccess::new("HTML document generated", StageOutput::Rendered(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_is_escaped_and_body_is_not() {
        let html = render_document(Some("Tom & Jerry <live> {content}"), "<div class=\"section\">{title}</div>");
        assert!(html.contains("<title>Tom &amp; Jerry &lt;live&gt; {content}</title>"));
        assert!(html.contains("<div class=\"section\">{title}</div>"));
        assert!(html.starts_with("<!DOCTYPE html>"));
    }

    #[test]
    fn test_default_title() {
        let html = render_document(None, "<p>x</p>");
        assert!(html.contains("<title>Video Transcription Summary</title>"));
    }
}
