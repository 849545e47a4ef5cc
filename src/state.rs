use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RouteLimit;
use crate::error::PolicyError;
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::store::EventStore;

// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub upstream_url: String,                           // where allowed requests go
    pub limiter: RateLimiter,
    pub events: Arc<dyn EventStore>,                    // api request log, limiter's store
    pub policies: HashMap<&'static str, RateLimitPolicy>, // route -> policy
}

impl AppState {
    /// Resolve a policy for every throttled route: the matching `--route-limit`
    /// override, else the default limit and window bucketed by the route path.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        upstream_url: &str,
        limiter: RateLimiter,
        events: Arc<dyn EventStore>,
        routes: &[&'static str],
        default_limit: u32,
        default_window: Duration,
        overrides: &[RouteLimit],
    ) -> Result<Self, PolicyError> {
        let mut policies = HashMap::new();
        for route in routes {
            let policy = match overrides.iter().rev().find(|o| o.route == *route) {
                Some(o) => o.policy.clone(),
                None => RateLimitPolicy::new(*route, default_limit, default_window)?,
            };
            policies.insert(*route, policy);
        }

        for o in overrides {
            if !routes.contains(&o.route.as_str()) {
                tracing::warn!(route = %o.route, "rate limit override for unknown route ignored");
            }
        }

        Ok(Self {
            client,
            upstream_url: upstream_url.trim_end_matches('/').to_string(),
            limiter,
            events,
            policies,
        })
    }

    pub fn policy_for(&self, route: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(route)
    }
}
