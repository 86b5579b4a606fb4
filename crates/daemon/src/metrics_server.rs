//! Local HTTP endpoint for metrics while monitoring runs.
//!
//! Serves the registry snapshot as JSON for dashboards and scripts.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),
}

/// Handler for GET /metrics: the current registry snapshot as JSON.
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

/// Creates the axum Router with the metrics endpoint.
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Runs the metrics HTTP server on 127.0.0.1 at the given port until the
/// process shuts down.
pub async fn run_metrics_server(metrics: SharedMetrics, port: u16) -> Result<(), ServerError> {
    let app = create_metrics_router(metrics);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{names, new_shared_metrics};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let metrics = new_shared_metrics();
        metrics.inc_by(names::CYCLES_RUN, 3);
        metrics.inc_by(names::DUE_PICKED, 12);
        metrics.set_gauge("cpu_usage_percent", 42.5);
        metrics.observe_ms(names::TICK_MS, 7.0);

        let app = create_metrics_router(metrics);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: MetricsSnapshot = serde_json::from_slice(&body).unwrap();

        assert_eq!(snapshot.counters.get(names::CYCLES_RUN), Some(&3));
        assert_eq!(snapshot.counters.get(names::DUE_PICKED), Some(&12));
        assert_eq!(snapshot.gauges.get("cpu_usage_percent"), Some(&42.5));
        assert_eq!(snapshot.timings.get(names::TICK_MS).unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = create_metrics_router(new_shared_metrics());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
