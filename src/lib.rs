pub mod asr;
pub mod audio;
pub mod config;
pub mod schedule;
pub mod storage;
pub mod utils;
pub mod web;

use std::sync::Arc;

use config::AppConfig;
use schedule::TaskManager;

/// Shared state of the request-serving layer.
pub struct AppContext {
    pub config: AppConfig,
    pub task_manager: Arc<TaskManager>,
}
