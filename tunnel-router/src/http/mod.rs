use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::StatusCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

/// Serves `/metrics` and `/readyz` until `cancel` fires. The agent reports
/// ready by cancelling `ready` once bootstrap has finished.
pub async fn serve_metrics(
    addr: SocketAddr,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics listening");

    axum::serve(listener, router(ready))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn router(ready: CancellationToken) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

async fn metrics() -> String {
    crate::metrics::encode()
}

async fn readyz(State(ready): State<CancellationToken>) -> Bootstrap {
    if ready.is_cancelled() {
        Bootstrap::Done
    } else {
        Bootstrap::Pending
    }
}

/// Whether the host has been bootstrapped and cycles are running.
enum Bootstrap {
    Done,
    Pending,
}

impl IntoResponse for Bootstrap {
    fn into_response(self) -> Response {
        match self {
            Bootstrap::Done => (StatusCode::OK, "Ok").into_response(),
            Bootstrap::Pending => (StatusCode::SERVICE_UNAVAILABLE, "NotReady").into_response(),
        }
    }
}
