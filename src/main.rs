//! room-ads-engine server entry point.
//!
//! Wires storage, coordination and collaborators from the environment,
//! starts the background workers and serves the REST and WebSocket
//! endpoints.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use room_ads_engine::api;
use room_ads_engine::app_state::{AppState, Backends, Collaborators};
use room_ads_engine::config::{EngineConfig, LogFormat};
use room_ads_engine::coordination::{MemoryCoordinator, RedisCoordinator};
use room_ads_engine::external::http::{
    HttpChainClient, HttpConferencing, HttpIdentity, HttpSwapAggregator, build_client,
};
use room_ads_engine::external::{
    ChainClient, ConferencingProvider, IdentityResolver, SwapAggregator,
};
use room_ads_engine::persistence::{MemoryStore, PostgresStore};
use room_ads_engine::service::{DistributionSweep, ReservationReaper};
use room_ads_engine::testing::{FakeChain, FakeSwap, MapIdentity, StaticConferencing};
use room_ads_engine::webhook::RetryWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = EngineConfig::from_env().map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    init_tracing(config.log_format);
    tracing::info!(
        addr = %config.listen_addr,
        instance = %config.instance_id,
        "starting room-ads-engine"
    );

    // Build storage, coordination and collaborators
    let backends = build_backends(&config).await?;
    let collaborators = build_collaborators(&config)?;
    let webhook_client =
        build_client(config.webhook_timeout).context("building webhook client")?;
    if config.webhook_url.is_none() {
        tracing::warn!("ADS_WEBHOOK_URL not set; webhooks are disabled");
    }

    // Build application state
    let state = AppState::assemble(&config, backends, collaborators, webhook_client);

    // Resume rotations left behind by a previous process
    match state.sessions.recover().await {
        Ok(report) => tracing::info!(?report, "session recovery finished"),
        Err(e) => tracing::error!(error = %e, "session recovery failed"),
    }

    // Background workers
    Arc::new(
        RetryWorker::new(
            Arc::clone(&state.webhooks),
            Arc::clone(&state.backends.retry_queue),
            Arc::clone(&state.backends.locks),
            config.instance_id.as_str(),
        )
        .with_backoff(config.webhook_policy),
    )
    .spawn();
    ReservationReaper::new(state.sessions.clone())
        .with_schedule(config.reaper_interval, chrono::Duration::minutes(5))
        .spawn();
    Arc::new(
        DistributionSweep::new(
            state.distribution.clone(),
            Arc::clone(&state.backends.rooms),
            Arc::clone(&state.backends.payouts),
            Arc::clone(&state.backends.locks),
            config.instance_id.as_str(),
        )
        .with_schedule(config.sweep_interval, chrono::Duration::days(7)),
    )
    .spawn();

    // Build router
    let app = api::app(state, config.request_timeout);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn build_backends(config: &EngineConfig) -> anyhow::Result<Backends> {
    let redis = match &config.redis_url {
        Some(url) => {
            let coordinator = RedisCoordinator::connect(url, config.watch_ttl)
                .await
                .context("connecting to redis")?;
            coordinator.ping().await.context("pinging redis")?;
            Some(Arc::new(coordinator))
        }
        None => {
            tracing::warn!("REDIS_URL not set; locks and snapshots are local to this process");
            None
        }
    };

    if config.persistence_enabled {
        let store = PostgresStore::connect(&config.database_url, config.database_max_connections)
            .await
            .context("connecting to postgres")?;
        store.migrate().await.context("running migrations")?;
        let store = Arc::new(store);
        Ok(match redis {
            Some(coordinator) => Backends::new(&store, &coordinator, "postgres", "redis"),
            None => Backends::new(
                &store,
                &Arc::new(MemoryCoordinator::new()),
                "postgres",
                "memory",
            ),
        })
    } else {
        tracing::warn!("PERSISTENCE_ENABLED is off; all state is kept in memory");
        let store = Arc::new(MemoryStore::new());
        Ok(match redis {
            Some(coordinator) => Backends::new(&store, &coordinator, "memory", "redis"),
            None => Backends::in_memory(&store, &Arc::new(MemoryCoordinator::new())),
        })
    }
}

/// Builds HTTP collaborators, substituting in-process doubles for any
/// service without a configured URL.
fn build_collaborators(config: &EngineConfig) -> anyhow::Result<Collaborators> {
    let client = build_client(config.external_timeout).context("building http client")?;

    let conferencing: Arc<dyn ConferencingProvider> = match &config.conferencing_url {
        Some(url) => Arc::new(HttpConferencing::new(
            client.clone(),
            url.as_str(),
            config.conferencing_api_key.clone(),
        )),
        None => {
            tracing::warn!("CONFERENCING_URL not set; using a static participant count");
            Arc::new(StaticConferencing::new(1))
        }
    };

    let identity: Arc<dyn IdentityResolver> = match &config.identity_url {
        Some(url) => Arc::new(HttpIdentity::new(client.clone(), url.as_str())),
        None => {
            tracing::warn!("IDENTITY_URL not set; no wallets will resolve");
            Arc::new(MapIdentity::new())
        }
    };

    type Payments = (Arc<dyn SwapAggregator>, Arc<dyn ChainClient>);
    let (swap, chain): Payments = match (&config.chain_url, &config.swap_url) {
        (Some(chain_url), Some(swap_url)) => {
            let chain: Arc<dyn ChainClient> = Arc::new(HttpChainClient::new(
                client.clone(),
                chain_url.as_str(),
                std::time::Duration::from_secs(2),
            ));
            let swap = Arc::new(HttpSwapAggregator::new(
                client,
                swap_url.as_str(),
                config.swap_api_key.clone(),
                Arc::clone(&chain),
            ));
            (swap, chain)
        }
        (None, None) => {
            tracing::warn!("CHAIN_SIGNER_URL and SWAP_API_URL not set; payouts are simulated");
            let chain = Arc::new(FakeChain::new(config.distribution.treasury.as_str()));
            let swap = Arc::new(FakeSwap::new(Arc::clone(&chain), 1, 1));
            (swap, chain)
        }
        _ => anyhow::bail!("CHAIN_SIGNER_URL and SWAP_API_URL must be set together"),
    };

    Ok(Collaborators {
        conferencing,
        identity,
        swap,
        chain,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
