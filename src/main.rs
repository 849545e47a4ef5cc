mod client_key;
mod clock;
mod config;
mod error;
mod handlers;
mod metrics;
mod models;
mod rate_limit;
mod state;
mod store;

use clap::Parser; // for cli
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::Args;
use crate::handlers::{THROTTLED_ROUTES, router};
use crate::rate_limit::{Maintenance, RateLimiter, cleanup_loop};
use crate::state::AppState;
use crate::store::{EventStore, MemoryEventStore};

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("quiz_gateway=info")),
        )
        .init();

    // parse cli arguments
    let args = Args::parse();

    let store: Arc<dyn EventStore> = match &args.database_url {
        Some(url) => store::connect(url)?,
        None => {
            tracing::warn!(
                "no database url given, rate limits are counted in process memory \
                 and not shared between instances"
            );
            Arc::new(MemoryEventStore::new())
        }
    };

    let limiter = RateLimiter::new(
        store.clone(),
        Arc::new(SystemClock),
        Maintenance {
            retention: args.retention(),
            cleanup_probability: args.cleanup_probability,
        },
        args.store_timeout(),
    );

    // optional scheduled cleanup next to the per-request one
    if let Some(secs) = args.cleanup_interval_secs {
        tokio::spawn(cleanup_loop(limiter.clone(), Duration::from_secs(secs.max(1))));
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;

    let state = Arc::new(AppState::new(
        client,
        &args.upstream_url,
        limiter,
        store,
        &THROTTLED_ROUTES,
        args.rate_limit,
        args.rate_window(),
        &args.route_limits,
    )?);

    for (route, policy) in &state.policies {
        tracing::info!(
            route,
            bucket = policy.bucket(),
            limit = policy.limit(),
            window_ms = policy.window().as_millis() as u64,
            "rate limit policy"
        );
    }

    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Gateway running on http://localhost:{}", args.port);
    tracing::info!("Forwarding to quiz service at {}", args.upstream_url);
    axum::serve(listener, app).await?;
    Ok(())
}
