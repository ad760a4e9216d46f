use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;

/// Serve the liveness endpoint until the shutdown signal flips. Does no
/// database work: 200 means the process is accepting work.
pub async fn serve_health(bind: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let app = Router::new().route("/healthz", get(healthz));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "health server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("health server stopped");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}
