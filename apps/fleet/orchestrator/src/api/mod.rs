//! Admin read-view over the status aggregator.

pub mod health;
pub mod status;

use crate::state::AppState;
use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

/// Build the admin router.
///
/// `/healthz` is the process-level liveness probe from `axum-helpers`;
/// `/health` and `/ready` carry the machine semantics (process table and
/// phase).
pub fn router(state: AppState) -> Router {
    let liveness = axum_helpers::liveness_router(state.app);

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/ready", get(health::ready_handler))
        .route("/status", get(status::status_handler))
        .route("/services", get(status::services_handler))
        .route("/services/{name}/health", get(status::service_health_handler))
        .route("/metrics", get(status::metrics_handler))
        .with_state(state)
        .merge(liveness)
        .layer(TraceLayer::new_for_http())
}
