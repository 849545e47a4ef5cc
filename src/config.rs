use clap::Parser;
use std::time::Duration;

use crate::error::PolicyError;
use crate::rate_limit::{DEFAULT_LIMIT, DEFAULT_WINDOW, RateLimitPolicy};

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "quiz-gateway")]
#[command(about = "Throttling and usage-accounting gateway for the quiz API")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Upstream quiz service that allowed requests are forwarded to
    #[arg(short, long, default_value = "http://localhost:3000")]
    pub upstream_url: String,

    // Shared event store, sqlite or postgres. Omit for the in-process store
    // Example: "sqlite://data/gateway.db" or "postgres://gateway@db/quiz"
    #[arg(short, long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    // Default max requests per window
    #[arg(
        long,
        default_value_t = DEFAULT_LIMIT,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub rate_limit: u32,

    // Default window length in milliseconds
    #[arg(
        long,
        default_value_t = DEFAULT_WINDOW.as_millis() as u64,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub rate_window_ms: u64,

    // Per-route override, repeatable: ROUTE=LIMIT/WINDOW_MS[@BUCKET]
    // Example: "/api/explain=5/60000" or "/api/generate=3/60000@quiz"
    #[arg(long = "route-limit", value_parser = parse_route_limit)]
    pub route_limits: Vec<RouteLimit>,

    // How long rate limit events are kept before pruning
    #[arg(long, default_value_t = 48)]
    pub retention_hours: u64,

    // Chance per throttled call to prune old events in the background
    #[arg(long, default_value_t = 0.02, value_parser = parse_probability)]
    pub cleanup_probability: f64,

    // Also prune on a fixed schedule (seconds). Off when unset
    #[arg(long)]
    pub cleanup_interval_secs: Option<u64>,

    // Upper bound on a throttle check before it fails open
    #[arg(long, default_value_t = 2_000)]
    pub store_timeout_ms: u64,
}

impl Args {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// One `--route-limit` entry.
#[derive(Debug, Clone)]
pub struct RouteLimit {
    pub route: String,
    pub policy: RateLimitPolicy,
}

fn parse_route_limit(raw: &str) -> Result<RouteLimit, PolicyError> {
    let malformed = || PolicyError::Malformed(raw.to_string());

    let (route, rest) = raw.split_once('=').ok_or_else(malformed)?;
    let route = route.trim();
    if route.is_empty() {
        return Err(malformed());
    }

    let (quota, bucket) = match rest.split_once('@') {
        Some((quota, bucket)) => (quota, bucket.trim()),
        None => (rest, route),
    };
    let (limit, window_ms) = quota.split_once('/').ok_or_else(malformed)?;
    let limit: u32 = limit.trim().parse().map_err(|_| malformed())?;
    let window_ms: u64 = window_ms.trim().parse().map_err(|_| malformed())?;

    let policy = RateLimitPolicy::new(bucket, limit, Duration::from_millis(window_ms))?;
    Ok(RouteLimit {
        route: route.to_string(),
        policy,
    })
}

fn parse_probability(raw: &str) -> Result<f64, String> {
    let value: f64 = raw.parse().map_err(|_| format!("not a number: {raw}"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("probability must be within 0..=1, got {value}"));
    }
    Ok(value)
}
