use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::models::ThrottleDecision;

pub type StoreResult<T> = Result<T, StoreError>;

// Anything that goes wrong talking to the event store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode event metadata: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

// Invalid throttle configuration. Rejected instead of clamped
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("limit must be at least 1")]
    InvalidLimit,
    #[error("window must be longer than 0ms")]
    InvalidWindow,
    #[error("bucket must not be empty")]
    EmptyBucket,
    #[error("expected ROUTE=LIMIT/WINDOW_MS[@BUCKET], got `{0}`")]
    Malformed(String),
}

// Errors a route handler turns into an HTTP response
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limit exceeded, try again later")]
    RateLimited(ThrottleDecision),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    // Stable machine-readable code for the JSON body
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RateLimited(_) => "rate_limited",
            ApiError::InvalidBody(_) => "invalid_body",
            ApiError::Upstream(_) => "upstream_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        let mut response = (self.status(), body).into_response();

        if let ApiError::RateLimited(decision) = &self {
            let headers = response.headers_mut();
            decision.apply_headers(headers);
            headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
        }
        response
    }
}
