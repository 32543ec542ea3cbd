//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::topology::QUEUES;

use crate::AppState;

/// State for the scrape handler: the recorder plus the fabric to sample.
pub struct MetricsState<S> {
    pub handle: PrometheusHandle,
    pub app: Arc<AppState<S>>,
}

/// GET /metrics
///
/// Queue depths are sampled at scrape time.
pub async fn get<S>(State(state): State<Arc<MetricsState<S>>>) -> impl IntoResponse {
    for queue in QUEUES {
        if let Ok(depth) = state.app.broker.queue_depth(queue).await {
            metrics::gauge!("queue_depth", "queue" => queue).set(depth as f64);
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.handle.render(),
    )
}
