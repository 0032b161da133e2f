//! Identity Broker
//!
//! Single-binary service that:
//! 1. Loads pool definitions from TOML
//! 2. Opens the shared identity file (optional) and loads each pool
//! 3. Serves acquisition and lifecycle calls over HTTP
//! 4. Flushes every pool to the store on shutdown

mod api;
mod config;
mod error;
mod factory;
mod metrics;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use identity_pool::{Pool, StatusClassifier};
use identity_store::{FileStore, IdentityStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{ApiState, Pools};
use crate::config::Config;
use crate::factory::HttpFactory;

/// Upper bound on draining in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state for the service-level handlers
#[derive(Clone)]
struct AppState {
    pools: Pools,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router: service endpoints plus the pool API.
///
/// Every route is timed by the metrics middleware; the concurrency limit
/// applies to the whole router.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let pool_api = api::build_pool_router(ApiState::new(state.pools.clone()));
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(pool_api)
        .layer(axum::middleware::from_fn(metrics::track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

/// Open the store (if configured) and build one pool per `[[pools]]` entry.
///
/// Configured pools get an empty store document on first boot so that loading
/// them never fails for lack of one.
async fn build_pools(config: &Config) -> Result<Pools> {
    let store: Option<Arc<dyn IdentityStore>> = match &config.store {
        Some(store_config) => {
            let store = FileStore::open(store_config.path.clone())
                .await
                .with_context(|| {
                    format!("failed to open store {}", store_config.path.display())
                })?
                .with_wait_poll_interval(store_config.wait_poll_interval());
            for pool in &config.pools {
                store
                    .ensure_pool(&pool.name)
                    .await
                    .with_context(|| format!("failed to prepare store for pool {}", pool.name))?;
            }
            info!(path = %store_config.path.display(), "identity store opened");
            Some(Arc::new(store))
        }
        None => {
            warn!("no [store] configured, identities live in memory only");
            None
        }
    };

    let client = reqwest::Client::new();
    let mut pools = BTreeMap::new();
    for pool_config in &config.pools {
        let classifier = StatusClassifier::new()
            .with_retryable_statuses(pool_config.retry_statuses.iter().copied());
        let mut builder = Pool::builder(&pool_config.name)
            .options(pool_config.options.clone())
            .classifier(Arc::new(classifier));
        if let Some(url) = &pool_config.factory_url {
            builder = builder.factory(Arc::new(HttpFactory::new(
                client.clone(),
                url.clone(),
                pool_config.name.clone(),
                config.factory.token.clone(),
                pool_config.create_timeout(),
            )));
        }
        if let Some(store) = &store {
            builder = builder.store(Arc::clone(store));
        }
        let pool = builder
            .build()
            .await
            .with_context(|| format!("failed to initialize pool {}", pool_config.name))?;
        pools.insert(pool_config.name.clone(), pool);
    }
    Ok(Arc::new(pools))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting identity-broker");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.broker.listen_addr,
        pools = config.pools.len(),
        store = config.store.is_some(),
        factory_token = config.factory.token.is_some(),
        "configuration loaded"
    );

    let pools = build_pools(&config).await?;

    let state = AppState {
        pools: pools.clone(),
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(state, config.broker.max_connections);

    let listen_addr = config.broker.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown: stop accepting on signal, drain in-flight requests
    // for at most DRAIN_TIMEOUT (measured from signal receipt), then flush
    // every pool to the store.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    shutdown_pools(&pools).await;

    info!("shutdown complete");
    Ok(())
}

/// Final store flush for every pool. Failures are logged, not fatal.
async fn shutdown_pools(pools: &Pools) {
    for (name, pool) in pools.iter() {
        if let Err(e) = pool.shutdown().await {
            error!(pool = %name, error = %e, "final store sync failed");
        }
    }
}

/// Health endpoint: always 200 while serving. `status` is `healthy` when every
/// pool is healthy and `degraded` otherwise; a fully leased pool is busy, not
/// broken.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut summaries = Vec::with_capacity(state.pools.len());
    let mut all_healthy = true;
    for pool in state.pools.values() {
        let health = pool.health().await;
        all_healthy &= health["status"] == "healthy";
        summaries.push(serde_json::json!({
            "pool": health["pool"],
            "status": health["status"],
            "identities_total": health["identities_total"],
            "identities_available": health["identities_available"],
        }));
    }

    let body = serde_json::json!({
        "status": if all_healthy { "healthy" } else { "degraded" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "pools": summaries,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
