#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tube_digest::{
    asr::{whisper::WhisperAsr, AsrEngine},
    config::AppConfig,
    schedule::{default_stages, PipelineRunner, TaskManager, TaskScheduler},
    storage::task::{SqliteTaskStore, TaskStore},
    utils::logger,
    AppContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    let _guard = logger::init(&config.log_path)?;

    info!("Starting tube-digest {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));

    // create the directories the store and the pipeline write into
    if let Some(dir) = config.database_dir() {
        std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::create_dir_all(&config.data_path)
        .with_context(|| format!("failed to create {}", config.data_path.display()))?;

    info!("Opening task store at {}", config.database_url);
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&config.database_url).await?);

    info!("Initializing Whisper ASR model...");
    let asr: Arc<dyn AsrEngine> = Arc::new(WhisperAsr::new(&config.whisper_model)?);

    let stages = default_stages(&config, asr)?;
    let runner = Arc::new(PipelineRunner::new(store.clone(), stages, &config.data_path)?);
    let (task_manager, jobs) = TaskManager::new(store.clone(), &config.data_path);
    let task_manager = Arc::new(task_manager);

    info!("Starting {} workers...", config.concurrency);
    let scheduler = TaskScheduler::start(task_manager.clone(), runner, jobs, config.concurrency);
    task_manager.recover().await?;

    let addr = config.listen_addr;
    let ctx = Arc::new(AppContext {
        config,
        task_manager: task_manager.clone(),
    });

    let served = tube_digest::web::start_server(ctx, addr, shutdown_signal()).await;
    if let Err(e) = &served {
        error!("Server error: {:#}", e);
    }

    info!("Shutting down, waiting for running tasks...");
    task_manager.shutdown().await;
    scheduler.join().await?;
    store.close().await;
    info!("Shutdown complete");

    served
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
