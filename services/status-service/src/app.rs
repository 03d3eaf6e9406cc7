use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::handlers::{healthz, readyz, stream, webhook, webhook_status};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/optimization/webhook",
            get(webhook_status).post(webhook),
        )
        .route("/api/optimization/stream", get(stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
