use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use super::EventStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{ApiRequestEvent, RateLimitEvent, RouteUsage, WindowStats};

// Oldest api events are dropped past this many, even between prunes
const MAX_API_EVENTS: usize = 10_000;

/// In-process event store. Only correct for a single gateway instance, used
/// for local runs and tests.
#[derive(Default)]
pub struct MemoryEventStore {
    hits: DashMap<(String, String), Vec<DateTime<Utc>>>, // (client_key, route) -> timestamps
    api_events: Mutex<VecDeque<ApiRequestEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn api_events(&self) -> Vec<ApiRequestEvent> {
        match self.api_events.lock() {
            Ok(events) => events.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn record_hit(&self, event: &RateLimitEvent) -> StoreResult<()> {
        self.hits
            .entry((event.client_key.clone(), event.route.clone()))
            .or_default()
            .push(event.created_at);
        Ok(())
    }

    async fn window_stats(
        &self,
        client_key: &str,
        route: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<WindowStats> {
        let key = (client_key.to_string(), route.to_string());
        let Some(entry) = self.hits.get(&key) else {
            return Ok(WindowStats { count: 0, oldest: None });
        };

        let in_window = entry.iter().filter(|at| **at > since);
        Ok(WindowStats {
            count: in_window.clone().count() as u64,
            oldest: in_window.min().copied(),
        })
    }

    async fn prune_hits(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut removed = 0u64;
        self.hits.retain(|_, timestamps| {
            let before = timestamps.len();
            timestamps.retain(|at| *at >= older_than);
            removed += (before - timestamps.len()) as u64;
            !timestamps.is_empty()
        });

        // api events share the retention horizon, they are not counted in the result
        self.api_events
            .lock()
            .map_err(|_| StoreError::Unavailable("api event log lock poisoned".into()))?
            .retain(|event| event.created_at >= older_than);
        Ok(removed)
    }

    async fn record_api_event(&self, event: &ApiRequestEvent) -> StoreResult<()> {
        let mut events = self
            .api_events
            .lock()
            .map_err(|_| StoreError::Unavailable("api event log lock poisoned".into()))?;
        events.push_back(event.clone());
        while events.len() > MAX_API_EVENTS {
            events.pop_front();
        }
        Ok(())
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<RouteUsage>> {
        let events = self
            .api_events
            .lock()
            .map_err(|_| StoreError::Unavailable("api event log lock poisoned".into()))?;

        // route -> (requests, limited, errors, total duration)
        let mut by_route: BTreeMap<&str, (u64, u64, u64, u64)> = BTreeMap::new();
        for event in events.iter().filter(|e| e.created_at >= since) {
            let entry = by_route.entry(event.route.as_str()).or_default();
            entry.0 += 1;
            if event.status_code == 429 {
                entry.1 += 1;
            }
            if event.status_code >= 500 {
                entry.2 += 1;
            }
            entry.3 += event.duration_ms;
        }

        Ok(by_route
            .into_iter()
            .map(|(route, (requests, limited, errors, total_ms))| RouteUsage {
                route: route.to_string(),
                requests,
                limited,
                errors,
                avg_duration_ms: total_ms as f64 / requests as f64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hit(client_key: &str, route: &str, at: DateTime<Utc>) -> RateLimitEvent {
        RateLimitEvent {
            client_key: client_key.to_string(),
            route: route.to_string(),
            created_at: at,
        }
    }

    #[tokio::test]
    async fn window_is_scoped_to_key_and_route() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        let since = now - Duration::seconds(60);
        store
            .record_hit(&hit("abc", "/a", now - Duration::seconds(10)))
            .await
            .unwrap();
        store.record_hit(&hit("abc", "/a", now)).await.unwrap();
        store.record_hit(&hit("abc", "/b", now)).await.unwrap();

        let stats = store.window_stats("abc", "/a", since).await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.oldest, Some(now - Duration::seconds(10)));

        let other = store.window_stats("xyz", "/a", since).await.unwrap();
        assert_eq!(other.count, 0);
    }

    #[tokio::test]
    async fn prune_drops_empty_pairs() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        store
            .record_hit(&hit("abc", "/a", now - Duration::days(3)))
            .await
            .unwrap();
        store.record_hit(&hit("abc", "/b", now)).await.unwrap();

        assert_eq!(store.prune_hits(now - Duration::days(2)).await.unwrap(), 1);
        assert_eq!(store.hits.len(), 1);
    }

    fn api_event(route: &str, at: DateTime<Utc>) -> ApiRequestEvent {
        ApiRequestEvent {
            route: route.to_string(),
            action: "explain_answer".to_string(),
            client_key: None,
            status_code: 200,
            duration_ms: 5,
            error_message: None,
            metadata: Default::default(),
            created_at: at,
        }
    }

    #[tokio::test]
    async fn prune_also_drops_old_api_events() {
        let store = MemoryEventStore::new();
        let now = Utc::now();
        for _ in 0..1_000 {
            store
                .record_api_event(&api_event("/api/explain", now - Duration::days(30)))
                .await
                .unwrap();
        }
        store
            .record_api_event(&api_event("/api/generate", now))
            .await
            .unwrap();

        // no hits were stored, so the reported count stays at zero
        assert_eq!(store.prune_hits(now - Duration::days(2)).await.unwrap(), 0);

        let remaining = store.api_events();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].route, "/api/generate");
    }

    #[tokio::test]
    async fn api_event_log_is_capped() {
        let store = MemoryEventStore::new();
        let start = Utc::now();
        for i in 0..(MAX_API_EVENTS + 5) {
            let at = start + Duration::milliseconds(i as i64);
            store.record_api_event(&api_event("/api/explain", at)).await.unwrap();
        }

        let events = store.api_events();
        assert_eq!(events.len(), MAX_API_EVENTS);
        assert_eq!(events[0].created_at, start + Duration::milliseconds(5));
    }
}
