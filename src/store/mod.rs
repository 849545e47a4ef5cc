mod memory;
mod postgres;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::StoreResult;
use crate::models::{ApiRequestEvent, RateLimitEvent, RouteUsage, WindowStats};

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;
pub use sqlite::SqliteEventStore;

/// Append-only storage for rate limit hits and API request events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record_hit(&self, event: &RateLimitEvent) -> StoreResult<()>;

    /// Count hits for the pair with `created_at > since`, plus the oldest one.
    async fn window_stats(
        &self,
        client_key: &str,
        route: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<WindowStats>;

    /// Delete hits with `created_at < older_than`. Returns rows removed.
    async fn prune_hits(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn record_api_event(&self, event: &ApiRequestEvent) -> StoreResult<()>;

    /// Per-route aggregates over API events with `created_at >= since`.
    async fn usage_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<RouteUsage>>;
}

fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

// Picks the backend from the url scheme, anything not postgres goes to sqlite
pub fn connect(url: &str) -> StoreResult<Arc<dyn EventStore>> {
    if is_postgres_url(url) {
        tracing::info!("using postgres event store");
        Ok(Arc::new(PgEventStore::connect_lazy(url)?))
    } else {
        tracing::info!("using sqlite event store");
        Ok(Arc::new(SqliteEventStore::connect_lazy(url)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_backend() {
        assert!(is_postgres_url("postgres://gateway:secret@db:5432/quiz"));
        assert!(is_postgres_url("postgresql://db/quiz"));
        assert!(!is_postgres_url("sqlite://data/gateway.db"));
        assert!(!is_postgres_url("sqlite::memory:"));
    }

    // Lazy pools never dial out, so both backends build without a server
    #[tokio::test]
    async fn connect_accepts_both_schemes() {
        assert!(connect("postgres://gateway@127.0.0.1:1/quiz").is_ok());
        assert!(connect("sqlite::memory:").is_ok());
        assert!(connect("postgres://[bad").is_err());
    }
}
