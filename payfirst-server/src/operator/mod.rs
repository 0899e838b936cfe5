//! Operator HTTP API.
//!
//! Rollout control, pending-work inspection and manual completion, plus the
//! request-path hooks the registration flow calls (flow assignment, outcome
//! recording and the pending-work hand-off).

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/sweep", post(handlers::run_sweep))
        .route("/pending", post(handlers::enqueue))
        .route("/pending/stats", get(handlers::pending_stats))
        .route("/pending/failed", get(handlers::list_failed))
        .route("/pending/:id", get(handlers::get_pending))
        .route("/pending/:id/complete", post(handlers::complete_pending))
        .route("/flags/:name", get(handlers::get_flag))
        .route("/flags/:name/health", get(handlers::get_flag_health))
        .route("/flags/:name/percentage", put(handlers::set_percentage))
        .route("/flags/:name/enabled", put(handlers::set_enabled))
        .route("/flags/:name/advance", post(handlers::advance_rollout))
        .route(
            "/flags/:name/gradual",
            post(handlers::schedule_gradual_rollout).delete(handlers::cancel_gradual_rollout),
        )
        .route("/flags/:name/target-groups", put(handlers::set_target_groups))
        .route("/flags/:name/rollback", post(handlers::rollback))
        .route("/flags/:name/assign", post(handlers::assign_flow))
        .route("/flags/:name/outcomes", post(handlers::record_outcome))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
