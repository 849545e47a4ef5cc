use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::RouteUsage;
use crate::state::AppState;

const MAX_HOURS: u32 = 24 * 30;

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_hours")]
    hours: u32,
}

fn default_hours() -> u32 {
    24
}

// Per-route request, 429 and 5xx counts from the api event log
pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<RouteUsage>>, ApiError> {
    let hours = query.hours.clamp(1, MAX_HOURS);
    let since = chrono::Utc::now() - chrono::Duration::hours(i64::from(hours));

    state
        .events
        .usage_since(since)
        .await
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}
