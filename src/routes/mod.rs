use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use self::metrics::MetricsState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// 1000 numeric ids fit comfortably.
const BODY_LIMIT_BYTES: usize = 64 * 1024;

/// Build the API router. `/metrics` is only mounted when a recorder is installed.
pub fn router(state: AppState, metrics_state: Option<MetricsState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .with_state(state);

    if let Some(metrics_state) = metrics_state {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics_state),
        );
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
}
