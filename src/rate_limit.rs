use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::client_key::derive_client_key;
use crate::clock::Clock;
use crate::error::{PolicyError, StoreError, StoreResult};
use crate::metrics::{PRUNED_EVENTS, THROTTLE_ALLOWED, THROTTLE_FAIL_OPEN, THROTTLE_LIMITED};
use crate::models::{RateLimitEvent, ThrottleDecision, WindowStats};
use crate::store::EventStore;

pub const DEFAULT_LIMIT: u32 = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Limit and window for one bucket, validated by `new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    bucket: String,
    limit: u32,
    window: Duration,
}

impl RateLimitPolicy {
    pub fn new(
        bucket: impl Into<String>,
        limit: u32,
        window: Duration,
    ) -> Result<Self, PolicyError> {
        let bucket = bucket.into();
        if bucket.trim().is_empty() {
            return Err(PolicyError::EmptyBucket);
        }
        if limit == 0 {
            return Err(PolicyError::InvalidLimit);
        }
        if window.is_zero() {
            return Err(PolicyError::InvalidWindow);
        }
        Ok(Self {
            bucket,
            limit,
            window,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX)
    }
}

// Background pruning of old hits
#[derive(Debug, Clone, Copy)]
pub struct Maintenance {
    pub retention: Duration,
    pub cleanup_probability: f64,
}

impl Default for Maintenance {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(2 * 24 * 3600),
            cleanup_probability: 0.02,
        }
    }
}

/// Sliding-window throttle over a shared [`EventStore`].
// No lock around insert-then-count, concurrent calls from one client may overshoot
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    maintenance: Maintenance,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        maintenance: Maintenance,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            maintenance,
            store_timeout,
        }
    }

    /// Record this attempt, then count hits in `(now - window, now]`.
    pub async fn hit(
        &self,
        client_key: &str,
        policy: &RateLimitPolicy,
    ) -> StoreResult<(DateTime<Utc>, WindowStats)> {
        let now = self.clock.now();
        let event = RateLimitEvent {
            client_key: client_key.to_string(),
            route: policy.bucket().to_string(),
            created_at: now,
        };
        self.store.record_hit(&event).await?;

        let since = sub_saturating(now, policy.window_chrono());
        let stats = self
            .store
            .window_stats(client_key, policy.bucket(), since)
            .await?;
        Ok((now, stats))
    }

    // Writes one hit per call, denied ones included, and may schedule a prune
    pub async fn check(
        &self,
        client_key: &str,
        policy: &RateLimitPolicy,
    ) -> StoreResult<ThrottleDecision> {
        let (now, stats) = self.hit(client_key, policy).await?;

        let limit = u64::from(policy.limit());
        let limited = stats.count > limit;
        let remaining = limit.saturating_sub(stats.count) as u32;
        let reset_at = add_saturating(stats.oldest.unwrap_or(now), policy.window_chrono());

        self.maybe_schedule_cleanup();

        Ok(ThrottleDecision {
            limited,
            limit: policy.limit(),
            remaining,
            reset_time: reset_at.timestamp_millis(),
        })
    }

    /// Fail-open wrapper around [`check`](Self::check).
    pub async fn throttle(&self, client_key: &str, policy: &RateLimitPolicy) -> ThrottleDecision {
        let outcome = tokio::time::timeout(self.store_timeout, self.check(client_key, policy))
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Unavailable(format!(
                    "throttle check exceeded {:?}",
                    self.store_timeout
                )))
            });

        match outcome {
            Ok(decision) => {
                if decision.limited {
                    THROTTLE_LIMITED.inc();
                    tracing::debug!(
                        bucket = policy.bucket(),
                        limit = decision.limit,
                        "request throttled"
                    );
                } else {
                    THROTTLE_ALLOWED.inc();
                }
                decision
            }
            Err(err) => {
                THROTTLE_FAIL_OPEN.inc();
                tracing::error!(
                    bucket = policy.bucket(),
                    error = %err,
                    "rate limit check failed, allowing request"
                );
                self.open_decision(policy)
            }
        }
    }

    pub async fn throttle_request(
        &self,
        headers: &HeaderMap,
        policy: &RateLimitPolicy,
    ) -> (String, ThrottleDecision) {
        let client_key = derive_client_key(headers);
        let decision = self.throttle(&client_key, policy).await;
        (client_key, decision)
    }

    fn open_decision(&self, policy: &RateLimitPolicy) -> ThrottleDecision {
        let reset_at = add_saturating(self.clock.now(), policy.window_chrono());
        ThrottleDecision {
            limited: false,
            limit: policy.limit(),
            remaining: policy.limit(),
            reset_time: reset_at.timestamp_millis(),
        }
    }

    /// Delete hits older than the retention horizon.
    pub async fn prune(&self) -> StoreResult<u64> {
        let retention = chrono::Duration::from_std(self.maintenance.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = sub_saturating(self.clock.now(), retention);
        let removed = self.store.prune_hits(cutoff).await?;
        PRUNED_EVENTS.inc_by(removed as f64);
        Ok(removed)
    }

    // Fire-and-forget: the caller never waits on it and failures are only logged
    pub fn maybe_schedule_cleanup(&self) -> Option<JoinHandle<()>> {
        if rand::random::<f64>() >= self.maintenance.cleanup_probability {
            return None;
        }
        let limiter = self.clone();
        Some(tokio::spawn(async move {
            match limiter.prune().await {
                Ok(removed) => tracing::debug!(removed, "pruned old rate limit events"),
                Err(err) => tracing::warn!(error = %err, "rate limit cleanup failed"),
            }
        }))
    }
}

fn add_saturating(at: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn sub_saturating(at: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    at.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// Scheduled pruning on top of the probabilistic trigger
pub async fn cleanup_loop(limiter: RateLimiter, every: Duration) {
    let mut interval = interval(every);

    tracing::info!(interval = ?every, "rate limit cleanup task started");

    loop {
        interval.tick().await;
        match limiter.prune().await {
            Ok(removed) => tracing::debug!(removed, "scheduled prune finished"),
            Err(err) => tracing::warn!(error = %err, "scheduled prune failed"),
        }
    }
}
