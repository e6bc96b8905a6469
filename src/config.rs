use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

const DATABASE_URL: &str = "sqlite://./digest_data/database/tasks.db?mode=rwc";
const DATA_PATH: &str = "./digest_data/tasks";
const LOG_PATH: &str = "./logs";
const LISTEN_ADDR: &str = "127.0.0.1:8000";
const WHISPER_MODEL: &str = "./models/ggml-large-v3-turbo.bin";
const LLM_URL: &str = "http://127.0.0.1:11434";
const LLM_MODEL: &str = "deepseek-r1:32b";

/// Process configuration, read once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub data_path: PathBuf,
    pub log_path: PathBuf,
    pub listen_addr: SocketAddr,
    /// Number of tasks allowed to run at the same time.
    pub concurrency: usize,
    pub whisper_model: PathBuf,
    pub language: Option<String>,
    pub noise_reduction: bool,
    pub segment_ms: u64,
    pub segment_overlap_ms: u64,
    pub llm_url: String,
    pub llm_model: String,
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DATABASE_URL.to_string(),
            data_path: PathBuf::from(DATA_PATH),
            log_path: PathBuf::from(LOG_PATH),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            concurrency: 2,
            whisper_model: PathBuf::from(WHISPER_MODEL),
            language: None,
            noise_reduction: false,
            segment_ms: 20_000,
            segment_overlap_ms: 2_000,
            llm_url: LLM_URL.to_string(),
            llm_model: LLM_MODEL.to_string(),
            ytdlp_bin: "yt-dlp".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads `.env` if present, then resolves every setting from the process
    /// environment first and the `.env` file second.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(lookup)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config = Self {
            database_url: get("DIGEST_DATABASE_URL").unwrap_or_else(|| DATABASE_URL.to_string()),
            data_path: get("DIGEST_DATA_PATH").unwrap_or_else(|| DATA_PATH.to_string()).into(),
            log_path: get("DIGEST_LOG_PATH").unwrap_or_else(|| LOG_PATH.to_string()).into(),
            listen_addr: parse(&get, "DIGEST_LISTEN_ADDR", LISTEN_ADDR)?,
            concurrency: parse(&get, "DIGEST_CONCURRENCY", "2")?,
            whisper_model: get("DIGEST_WHISPER_MODEL").unwrap_or_else(|| WHISPER_MODEL.to_string()).into(),
            language: get("DIGEST_LANGUAGE").filter(|lang| !lang.trim().is_empty()),
            noise_reduction: parse(&get, "DIGEST_NOISE_REDUCTION", "false")?,
            segment_ms: parse(&get, "DIGEST_SEGMENT_MS", "20000")?,
            segment_overlap_ms: parse(&get, "DIGEST_SEGMENT_OVERLAP_MS", "2000")?,
            llm_url: get("DIGEST_LLM_URL").unwrap_or_else(|| LLM_URL.to_string()),
            llm_model: get("DIGEST_LLM_MODEL").unwrap_or_else(|| LLM_MODEL.to_string()),
            ytdlp_bin: get("DIGEST_YTDLP_BIN").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg_bin: get("DIGEST_FFMPEG_BIN").unwrap_or_else(|| "ffmpeg".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("DIGEST_CONCURRENCY must be at least 1"));
        }
        if self.segment_overlap_ms >= self.segment_ms {
            return Err(anyhow!(
                "DIGEST_SEGMENT_OVERLAP_MS ({}) must be smaller than DIGEST_SEGMENT_MS ({})",
                self.segment_overlap_ms,
                self.segment_ms
            ));
        }
        Ok(())
    }

    /// Directory holding the SQLite file, when the database URL names one.
    pub fn database_dir(&self) -> Option<PathBuf> {
        let path = self.database_url.strip_prefix("sqlite://")?;
        let path = path.split('?').next()?;
        if path.is_empty() || path.starts_with(":memory:") {
            return None;
        }
        PathBuf::from(path).parent().map(PathBuf::from)
    }
}

fn lookup(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(key).ok(),
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid value for {}: {:?}", key, raw))
}
