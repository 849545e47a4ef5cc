use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ApiError;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL, UPSTREAM_FAILURES};
use crate::models::ApiRequestEvent;
use crate::state::AppState;

pub const GENERATE_ROUTE: &str = "/api/generate";
pub const EXPLAIN_ROUTE: &str = "/api/explain";
pub const THROTTLED_ROUTES: [&str; 2] = [GENERATE_ROUTE, EXPLAIN_ROUTE];

pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(&state, GENERATE_ROUTE, "generate_quiz", &headers, &body).await
}

pub async fn explain_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(&state, EXPLAIN_ROUTE, "explain_answer", &headers, &body).await
}

// Throttle, then parse the body and call the quiz service. One api event
// is logged whatever happened, malformed bodies included
async fn forward(
    state: &AppState,
    route: &'static str,
    action: &'static str,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();
    let mut client_key = None;
    let mut metadata = Map::new();

    let outcome = match state.policy_for(route) {
        Some(policy) => {
            let (key, decision) = state.limiter.throttle_request(headers, policy).await;
            client_key = Some(key);
            metadata.insert("bucket".into(), Value::from(policy.bucket()));
            metadata.insert("remaining".into(), Value::from(decision.remaining));

            if decision.limited {
                Err(ApiError::RateLimited(decision))
            } else {
                match serde_json::from_slice::<Value>(body) {
                    Ok(payload) => call_upstream(state, route, &payload)
                        .await
                        .map(|reply| (decision, reply)),
                    Err(e) => Err(ApiError::InvalidBody(e.to_string())),
                }
            }
        }
        None => Err(ApiError::Internal(format!("no rate limit policy for {route}"))),
    };

    let (response, error_message) = match outcome {
        Ok((decision, reply)) => {
            let mut response = Json(reply).into_response();
            decision.apply_headers(response.headers_mut());
            (response, None)
        }
        Err(err) => {
            let message = err.to_string();
            (err.into_response(), Some(message))
        }
    };

    let elapsed = start_time.elapsed();
    REQUEST_LATENCY.observe(elapsed.as_secs_f64());

    let event = ApiRequestEvent {
        route: route.to_string(),
        action: action.to_string(),
        client_key,
        status_code: response.status().as_u16(),
        duration_ms: elapsed.as_millis().try_into().unwrap_or(u64::MAX),
        error_message,
        metadata,
        created_at: chrono::Utc::now(),
    };
    // best effort, never changes the response
    if let Err(err) = state.events.record_api_event(&event).await {
        tracing::warn!(route, error = %err, "failed to record api request event");
    }

    response
}

async fn call_upstream(
    state: &AppState,
    route: &str,
    payload: &Value,
) -> Result<Value, ApiError> {
    let url = format!("{}{}", state.upstream_url, route);

    let res = state.client.post(&url).json(payload).send().await.map_err(|e| {
        UPSTREAM_FAILURES.inc();
        tracing::warn!(route, error = %e, "upstream request failed");
        ApiError::Upstream(e.to_string())
    })?;

    let status = res.status();
    if !status.is_success() {
        UPSTREAM_FAILURES.inc();
        return Err(ApiError::Upstream(format!("quiz service returned {status}")));
    }

    res.json::<Value>()
        .await
        .map_err(|e| ApiError::Upstream(format!("Parse Error: {}", e)))
}
