use lazy_static::lazy_static;
use prometheus::{Counter, Histogram, register_counter, register_histogram};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter = register_counter!(
        "quiz_gateway_requests_total",
        "Total number of throttled-route requests"
    )
    .unwrap();
    pub static ref THROTTLE_ALLOWED: Counter = register_counter!(
        "quiz_gateway_throttle_allowed_total",
        "Requests allowed by the rate limiter"
    )
    .unwrap();
    pub static ref THROTTLE_LIMITED: Counter = register_counter!(
        "quiz_gateway_throttle_limited_total",
        "Requests rejected with 429"
    )
    .unwrap();
    pub static ref THROTTLE_FAIL_OPEN: Counter = register_counter!(
        "quiz_gateway_throttle_fail_open_total",
        "Requests allowed because the event store failed"
    )
    .unwrap();
    pub static ref PRUNED_EVENTS: Counter = register_counter!(
        "quiz_gateway_pruned_events_total",
        "Rate limit events removed by cleanup"
    )
    .unwrap();
    pub static ref UPSTREAM_FAILURES: Counter = register_counter!(
        "quiz_gateway_upstream_failures_total",
        "Upstream quiz service calls that failed"
    )
    .unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "quiz_gateway_request_latency_seconds",
        "Request latency in seconds"
    )
    .unwrap();
}
