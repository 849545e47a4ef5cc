mod health;
mod metrics;
mod quiz;
mod usage;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::state::AppState;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use quiz::{EXPLAIN_ROUTE, GENERATE_ROUTE, THROTTLED_ROUTES, explain_handler, generate_handler};
pub use usage::usage_handler;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(GENERATE_ROUTE, post(generate_handler))
        .route(EXPLAIN_ROUTE, post(explain_handler))
        .route("/api/usage", get(usage_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
