//! HTTP metrics server for Prometheus scraping

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Metrics server state
#[derive(Clone)]
struct MetricsServerState {
    registry: Arc<Registry>,
}

fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(MetricsServerState { registry })
}

/// Serves `/metrics` and `/health` on `[::1]:port` until cancelled.
pub async fn start_metrics_server(
    registry: Arc<Registry>,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from((Ipv6Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Starting metrics server on http://[::1]:{}/metrics", port);

    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// Handle /metrics endpoint - Prometheus text format
async fn metrics_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status": "healthy"}"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_bpf::{IpSetsMetrics, PrometheusIpSetsMetrics};

    #[tokio::test]
    async fn test_metrics_handler_renders_registry() {
        let registry = Arc::new(Registry::new());
        let metrics = PrometheusIpSetsMetrics::with_registry(registry.clone()).unwrap();
        metrics.set_num_ip_sets(2);

        let response = metrics_handler(State(MetricsServerState { registry }))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("felix_bpf_num_ip_sets 2"));
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
