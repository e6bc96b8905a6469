use reqwest::Url;

use super::error::TaskError;

/// A video reference the pipeline knows how to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub video_id: String,
    pub url: String,
}

const WATCH_HOSTS: [&str; 4] = ["youtube.com", "www.youtube.com", "m.youtube.com", "music.youtube.com"];

/// Resolves a submitted URL to a video id.
///
/// Accepted forms: `youtu.be/<id>`, `youtube.com/watch?v=<id>`,
/// `youtube.com/shorts/<id>` and `youtube.com/embed/<id>`. Playlists and
/// channel pages have no single video and are rejected.
pub fn parse_source(raw: &str) -> Result<VideoSource, TaskError> {
    let raw = raw.trim();
    let url = Url::parse(raw).map_err(|e| TaskError::InvalidInput(format!("{}: {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(TaskError::InvalidInput(format!("unsupported scheme: {}", url.scheme())));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TaskError::InvalidInput(format!("no host in {}", raw)))?
        .to_ascii_lowercase();

    let video_id = if host == "youtu.be" {
        url.path_segments().and_then(|mut segments| segments.next()).map(str::to_string)
    } else if WATCH_HOSTS.contains(&host.as_str()) {
        let mut segments = url.path_segments().into_iter().flatten();
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some("shorts") | Some("embed") | Some("live") => segments.next().map(str::to_string),
            _ => None,
        }
    } else {
        return Err(TaskError::InvalidInput(format!("not a YouTube URL: {}", raw)));
    };

    let video_id = video_id
        .filter(|id| is_valid_video_id(id))
        .ok_or_else(|| TaskError::InvalidInput(format!("no video id in {}", raw)))?;

    Ok(VideoSource {
        url: format!("https://www.youtube.com/watch?v={}", video_id),
        video_id,
    })
}

fn is_valid_video_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
