//! Process entrypoint: wires the store, dispatcher, gateway session, and
//! HTTP adapter together and runs them until one fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use platform_client::{PlatformClient, RateLimiter};
use relay_common::{Config, OutcomeStatus};
use relay_dispatch::{Dispatcher, RetryPolicy};
use relay_gateway::{GatewaySession, SessionEvent, WsConnector};
use relay_store::{init_schema, CommandStore, ConnectionPool};

mod api;
mod handler;
mod sweep;

use handler::BridgeHandler;

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Queue depth between the gateway session and the dispatcher. The session
/// backpressures on the socket when the pipeline is this far behind.
const GATEWAY_EVENT_DEPTH: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("Starting relay-server");

    let config = Config::from_env();
    config.log_redacted();

    let pool = ConnectionPool::new(
        &config.database_url,
        config.pool_capacity,
        config.pool_acquire_timeout,
    );
    // Fail fast before serving traffic.
    pool.check().await.context("store connectivity check failed")?;
    init_schema(&pool).await.context("schema bootstrap failed")?;
    handler::init_records(&pool)
        .await
        .context("records bootstrap failed")?;
    info!(capacity = pool.capacity(), "Store ready");

    let limiter = RateLimiter::new(config.rate_bucket_capacity, config.rate_bucket_window);
    let platform = PlatformClient::new(
        config.platform_api_url.clone(),
        config.platform_token.clone(),
        limiter,
    );

    let store = Arc::new(CommandStore::new(
        pool.clone(),
        Arc::new(BridgeHandler::new(platform)),
    ));
    let policy = RetryPolicy::new(config.retry_max_attempts, config.retry_base, config.retry_cap);
    let dispatcher = Dispatcher::new(Arc::clone(&store), policy, config.partition_workers);

    pool.spawn_health_probe(HEALTH_PROBE_INTERVAL);
    sweep::spawn_retention_sweep((*store).clone(), config.outcome_retention, SWEEP_INTERVAL);

    // Bridge the gateway session into the dispatcher. Outcomes for gateway
    // commands are fire-and-forget; failures are recorded in the store and
    // logged by the dispatch pipeline itself.
    let (events_tx, mut events_rx) = mpsc::channel::<SessionEvent>(GATEWAY_EVENT_DEPTH);
    let bridge = dispatcher.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SessionEvent::Command(cmd) => {
                    let key = cmd.idempotency_key.clone();
                    match bridge.enqueue(cmd).await {
                        Ok(waiter) => {
                            // No caller to notify; terminal failures are an
                            // operator concern.
                            tokio::spawn(async move {
                                match waiter.wait().await {
                                    Ok(outcome) if outcome.status == OutcomeStatus::Failed => {
                                        error!(
                                            key = %key,
                                            kind = ?outcome.failure_kind,
                                            attempts = outcome.attempts,
                                            "Gateway command failed terminally"
                                        );
                                    }
                                    Ok(_) => {}
                                    Err(e) => {
                                        error!(key = %key, error = %e, "Gateway command lost its outcome");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(key = %key, error = %e, "Failed to enqueue gateway command");
                        }
                    }
                }
                SessionEvent::Reset => {
                    info!("Gateway session invalidated, sequence continuity reset");
                }
            }
        }
    });

    let mut session = GatewaySession::new(
        WsConnector::new(config.gateway_url.clone()),
        config.platform_token.clone(),
        events_tx,
    );
    let gateway = tokio::spawn(async move { session.run().await });

    let state = Arc::new(api::AppState {
        dispatcher,
        store,
    });
    let router = api::build_router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "API listening");

    tokio::select! {
        res = axum::serve(listener, router) => {
            res.context("API server exited")?;
        }
        res = gateway => {
            res.context("gateway session task panicked")??;
        }
    }
    Ok(())
}
