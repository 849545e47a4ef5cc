use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

// One throttled-route attempt. Never updated, only inserted or pruned by age
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEvent {
    pub client_key: String,
    pub route: String,
    pub created_at: DateTime<Utc>,
}

// One completed API handler invocation, whatever the outcome
#[derive(Debug, Clone)]
pub struct ApiRequestEvent {
    pub route: String,
    pub action: String,
    pub client_key: Option<String>,
    pub status_code: u16,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

// Hits inside the trailing window for one (client_key, route) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub count: u64,
    pub oldest: Option<DateTime<Utc>>,
}

/// Outcome of one throttle check.
///
/// `reset_time` is epoch milliseconds: when the oldest hit in the current
/// window slides out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub limited: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: i64,
}

impl ThrottleDecision {
    // X-RateLimit-Reset is sent as epoch seconds, rounded up
    pub fn reset_epoch_secs(&self) -> i64 {
        (self.reset_time + 999).div_euclid(1000)
    }

    pub fn retry_after_secs(&self) -> u64 {
        let now_ms = Utc::now().timestamp_millis();
        let wait_ms = (self.reset_time - now_ms).max(0) as u64;
        wait_ms.div_ceil(1000)
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_epoch_secs()));
    }
}

// Per-route aggregate over the API event log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteUsage {
    pub route: String,
    pub requests: u64,
    pub limited: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_header_rounds_up_to_seconds() {
        let decision = ThrottleDecision {
            limited: false,
            limit: 10,
            remaining: 9,
            reset_time: 1_700_000_000_001,
        };
        assert_eq!(decision.reset_epoch_secs(), 1_700_000_001);

        let exact = ThrottleDecision {
            reset_time: 1_700_000_000_000,
            ..decision
        };
        assert_eq!(exact.reset_epoch_secs(), 1_700_000_000);
    }

    #[test]
    fn retry_after_never_negative() {
        let decision = ThrottleDecision {
            limited: true,
            limit: 1,
            remaining: 0,
            reset_time: 0,
        };
        assert_eq!(decision.retry_after_secs(), 0);
    }

    #[test]
    fn headers_are_written() {
        let decision = ThrottleDecision {
            limited: false,
            limit: 5,
            remaining: 3,
            reset_time: 2_000,
        };
        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "3");
        assert_eq!(headers[X_RATELIMIT_RESET], "2");
    }
}
