use axum::routing::{get, patch, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::app_state::AppState;

pub mod error;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod scoring;
pub mod submissions;

/// API routes plus the Prometheus scrape endpoint.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/submissions", post(submissions::create_submission))
        .route("/api/submissions/{id}", patch(submissions::update_submission))
        .route(
            "/api/submissions/{id}/submit",
            post(submissions::submit_submission),
        )
        .route("/api/score-jobs", post(scoring::create_scoring_job))
        .route("/api/score-jobs/{job_id}", get(scoring::get_job_status))
        .route("/api/queue/stats", get(queue::queue_stats))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
}
