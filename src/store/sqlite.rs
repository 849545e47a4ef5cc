use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::EventStore;
use crate::error::StoreResult;
use crate::models::{ApiRequestEvent, RateLimitEvent, RouteUsage, WindowStats};

// Both tables are append-only. Timestamps are epoch milliseconds
const SCHEMA: [&str; 4] = [
    r#"CREATE TABLE IF NOT EXISTS rate_limit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        client_key TEXT NOT NULL,
        route TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_rate_limit_events_key_route_created
        ON rate_limit_events (client_key, route, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS api_request_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        route TEXT NOT NULL,
        action TEXT NOT NULL,
        client_key TEXT,
        status_code INTEGER NOT NULL,
        duration_ms INTEGER NOT NULL,
        error_message TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_api_request_events_route_created
        ON api_request_events (route, created_at)"#,
];

/// Event store on a SQLite file, shared by the gateway processes on one host.
// Pool connects lazily and the schema is created on first use; a failed
// bootstrap leaves the cell empty so the next call retries
pub struct SqliteEventStore {
    pool: SqlitePool,
    schema: OnceCell<()>,
}

#[derive(Debug, FromRow)]
struct UsageRow {
    route: String,
    requests: i64,
    limited: i64,
    errors: i64,
    avg_duration_ms: f64,
}

impl SqliteEventStore {
    // Avoid logging `url`, it may carry credentials
    pub fn connect_lazy(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(3))
            .connect_lazy_with(options);
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            schema: OnceCell::new(),
        }
    }

    // Private in-memory database. One connection, kept open for the pool's lifetime
    #[cfg(test)]
    pub fn in_memory() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid in-memory url");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(options);
        Self::from_pool(pool)
    }

    async fn ready(&self) -> StoreResult<()> {
        self.schema
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                tracing::info!("event store schema ready");
                Ok::<(), crate::error::StoreError>(())
            })
            .await?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn record_hit(&self, event: &RateLimitEvent) -> StoreResult<()> {
        self.ready().await?;
        sqlx::query(
            "INSERT INTO rate_limit_events (client_key, route, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(&event.client_key)
        .bind(&event.route)
        .bind(event.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn window_stats(
        &self,
        client_key: &str,
        route: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<WindowStats> {
        self.ready().await?;
        let (count, oldest): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(created_at) FROM rate_limit_events \
             WHERE client_key = ?1 AND route = ?2 AND created_at > ?3",
        )
        .bind(client_key)
        .bind(route)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(WindowStats {
            count: count.max(0) as u64,
            oldest: oldest.and_then(from_millis),
        })
    }

    async fn prune_hits(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.ready().await?;
        let result = sqlx::query("DELETE FROM rate_limit_events WHERE created_at < ?1")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_api_event(&self, event: &ApiRequestEvent) -> StoreResult<()> {
        self.ready().await?;
        let metadata = serde_json::to_string(&event.metadata)?;
        sqlx::query(
            "INSERT INTO api_request_events \
             (route, action, client_key, status_code, duration_ms, \
              error_message, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&event.route)
        .bind(&event.action)
        .bind(event.client_key.as_deref())
        .bind(i64::from(event.status_code))
        .bind(i64::try_from(event.duration_ms).unwrap_or(i64::MAX))
        .bind(event.error_message.as_deref())
        .bind(metadata)
        .bind(event.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<RouteUsage>> {
        self.ready().await?;
        let rows = sqlx::query_as::<_, UsageRow>(
            "SELECT route, \
                COUNT(*) AS requests, \
                COALESCE(SUM(CASE WHEN status_code = 429 THEN 1 ELSE 0 END), 0) AS limited, \
                COALESCE(SUM(CASE WHEN status_code >= 500 THEN 1 ELSE 0 END), 0) AS errors, \
                COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms \
             FROM api_request_events WHERE created_at >= ?1 \
             GROUP BY route ORDER BY route",
        )
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RouteUsage {
                route: row.route,
                requests: row.requests.max(0) as u64,
                limited: row.limited.max(0) as u64,
                errors: row.errors.max(0) as u64,
                avg_duration_ms: row.avg_duration_ms,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn hit(client_key: &str, route: &str, at: DateTime<Utc>) -> RateLimitEvent {
        RateLimitEvent {
            client_key: client_key.to_string(),
            route: route.to_string(),
            created_at: at,
        }
    }

    fn api_event(
        route: &str,
        status_code: u16,
        duration_ms: u64,
        at: DateTime<Utc>,
    ) -> ApiRequestEvent {
        ApiRequestEvent {
            route: route.to_string(),
            action: "forward".to_string(),
            client_key: Some("abc".to_string()),
            status_code,
            duration_ms,
            error_message: None,
            metadata: serde_json::Map::new(),
            created_at: at,
        }
    }

    #[tokio::test]
    async fn window_counts_only_recent_hits_for_the_pair() {
        let store = SqliteEventStore::in_memory();
        let now = Utc::now();
        let window = ChronoDuration::seconds(60);

        for ago in [90, 30, 0] {
            let at = now - ChronoDuration::seconds(ago);
            store.record_hit(&hit("abc", "/api/explain", at)).await.unwrap();
        }
        store.record_hit(&hit("abc", "/api/generate", now)).await.unwrap();
        store.record_hit(&hit("xyz", "/api/explain", now)).await.unwrap();

        let stats = store.window_stats("abc", "/api/explain", now - window).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(
            stats.oldest.map(|t| t.timestamp_millis()),
            Some((now - ChronoDuration::seconds(30)).timestamp_millis())
        );
    }

    #[tokio::test]
    async fn window_lower_bound_is_exclusive() {
        let store = SqliteEventStore::in_memory();
        let now = Utc::now();
        store.record_hit(&hit("abc", "/r", now)).await.unwrap();

        let stats = store.window_stats("abc", "/r", now).await.unwrap();
        assert_eq!(stats, WindowStats { count: 0, oldest: None });
    }

    #[tokio::test]
    async fn prune_removes_only_old_hits() {
        let store = SqliteEventStore::in_memory();
        let now = Utc::now();
        store.record_hit(&hit("abc", "/r", now - ChronoDuration::days(3))).await.unwrap();
        store.record_hit(&hit("abc", "/r", now - ChronoDuration::days(1))).await.unwrap();

        let removed = store.prune_hits(now - ChronoDuration::days(2)).await.unwrap();
        assert_eq!(removed, 1);

        let stats = store.window_stats("abc", "/r", now - ChronoDuration::days(10)).await.unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn usage_groups_api_events_by_route() {
        let store = SqliteEventStore::in_memory();
        let now = Utc::now();
        store.record_api_event(&api_event("/api/explain", 200, 100, now)).await.unwrap();
        store.record_api_event(&api_event("/api/explain", 429, 10, now)).await.unwrap();
        store.record_api_event(&api_event("/api/generate", 502, 40, now)).await.unwrap();
        store
            .record_api_event(&api_event("/api/generate", 200, 40, now - ChronoDuration::days(2)))
            .await
            .unwrap();

        let usage = store.usage_since(now - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].route, "/api/explain");
        assert_eq!(usage[0].requests, 2);
        assert_eq!(usage[0].limited, 1);
        assert_eq!(usage[0].errors, 0);
        assert!((usage[0].avg_duration_ms - 55.0).abs() < f64::EPSILON);
        assert_eq!(usage[1].route, "/api/generate");
        assert_eq!(usage[1].requests, 1);
        assert_eq!(usage[1].errors, 1);
    }
}
