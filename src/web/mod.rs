use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub mod handlers;
mod pagination;

pub use pagination::Pagination;

use crate::AppContext;

/// Serves the API until `shutdown` resolves, then drains in-flight requests.
pub async fn start_server(
    ctx: Arc<AppContext>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = handlers::router(ctx);

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}
