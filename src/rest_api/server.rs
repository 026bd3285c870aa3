//! Axum HTTP server exposing `/healthz` and `/metrics`.

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};

async fn healthz() -> &'static str {
    "ok"
}

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY).unwrap();
    buffer
}

/// Run the HTTP endpoint until the process exits.
pub async fn run_server(addr: SocketAddr) -> Result<()> {
    let app = Router::new().route("/healthz", get(healthz));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    let app = app.layer(TraceLayer::new_for_http());

    info!("operator HTTP endpoint listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {addr}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {e}")))?;

    Ok(())
}
