use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::EventStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{ApiRequestEvent, RateLimitEvent, RouteUsage, WindowStats};

// Same layout as the sqlite store, epoch milliseconds in BIGINT columns
const SCHEMA: [&str; 4] = [
    r#"CREATE TABLE IF NOT EXISTS rate_limit_events (
        id BIGSERIAL PRIMARY KEY,
        client_key TEXT NOT NULL,
        route TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_rate_limit_events_key_route_created
        ON rate_limit_events (client_key, route, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS api_request_events (
        id BIGSERIAL PRIMARY KEY,
        route TEXT NOT NULL,
        action TEXT NOT NULL,
        client_key TEXT,
        status_code INTEGER NOT NULL,
        duration_ms BIGINT NOT NULL,
        error_message TEXT,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at BIGINT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_api_request_events_route_created
        ON api_request_events (route, created_at)"#,
];

/// Event store on a shared Postgres database, for gateways spread over
/// several hosts.
pub struct PgEventStore {
    pool: PgPool,
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

impl PgEventStore {
    // Avoid logging `url`, it may carry credentials
    pub fn connect_lazy(url: &str) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(3))
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            schema: OnceCell::new(),
        })
    }

    async fn ready(&self) -> StoreResult<()> {
        self.schema
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                tracing::info!("postgres event store schema ready");
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn record_hit(&self, event: &RateLimitEvent) -> StoreResult<()> {
        self.ready().await?;
        sqlx::query(
            "INSERT INTO rate_limit_events (client_key, route, created_at) VALUES ($1, $2, $3)",
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
             WHERE client_key = $1 AND route = $2 AND created_at > $3",
        )
        .bind(client_key)
        .bind(route)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(WindowStats {
            count: count.max(0) as u64,
            oldest: oldest.and_then(DateTime::from_timestamp_millis),
        })
    }

    async fn prune_hits(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.ready().await?;
        let result = sqlx::query("DELETE FROM rate_limit_events WHERE created_at < $1")
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
             VALUES ($1, $2, $3, $4, $5, $6, $7::jsonb, $8)",
        )
        .bind(&event.route)
        .bind(&event.action)
        .bind(event.client_key.as_deref())
        .bind(i32::from(event.status_code))
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
                COUNT(*) FILTER (WHERE status_code = 429) AS limited, \
                COUNT(*) FILTER (WHERE status_code >= 500) AS errors, \
                COALESCE(AVG(duration_ms), 0)::DOUBLE PRECISION AS avg_duration_ms \
             FROM api_request_events WHERE created_at >= $1 \
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
