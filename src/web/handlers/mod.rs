use axum::Router;
use std::sync::Arc;
use crate::AppContext;

pub mod tasks;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new().nest("/api", tasks::tasks_router(ctx.task_manager.clone()))
}
