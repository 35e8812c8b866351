//! Nexus Relayer - threshold-signature relayer for lock/mint bridges
//!
//! This relayer watches bridge contracts on every configured chain, validates
//! lock and burn events, collects signatures from a set of independent
//! relayers, and submits the threshold-signed release on the destination.

use anyhow::{Context, Result};
use ethers::signers::LocalWallet;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod consensus;
mod coordination;
mod error;
mod events;
mod metrics;
mod recovery;
mod retry;
mod state;
mod tx;
mod types;
mod validation;

#[cfg(test)]
mod test_utils;

use chain::ChainManager;
use config::{DatabaseBackend, Settings};
use consensus::{HttpTransport, SignatureCoordinator};
use coordination::{CoordinationEngine, EngineConfig};
use metrics::MetricsServer;
use recovery::ReorgRecoveryManager;
use retry::RetryPolicy;
use state::{MemoryStore, StateManager, TransferStore};
use tx::TransactionExecutor;
use validation::EventValidator;

/// Buffered watcher signals per chain before the watcher waits on the engine
const SIGNAL_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Nexus Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let wallet = load_wallet(&settings)?;

    let store = open_store(&settings).await?;
    seed_store(&settings, store.as_ref()).await?;

    // Initialize chain manager (one adapter per chain)
    let chain_manager = Arc::new(ChainManager::new(&settings, Some(wallet.clone()))?);
    chain_manager.connect_all().await?;
    info!("Chain connections initialized");

    let retry = RetryPolicy::from(&settings.retry);

    let validator = chain_manager.adapters().into_iter().fold(
        EventValidator::new(store.clone()),
        |validator, adapter| validator.with_chain(adapter),
    );
    let validator = Arc::new(validator);

    let configured_set = settings.consensus.validator_set();
    configured_set.validate()?;
    let validator_set = store
        .latest_validator_set()
        .await?
        .unwrap_or_else(|| configured_set.clone());
    let transport = HttpTransport::new(
        settings.consensus.peers.clone(),
        settings.rpc.request_timeout(),
    )?;
    let coordinator = Arc::new(
        SignatureCoordinator::new(
            store.clone(),
            validator_set,
            wallet,
            settings.consensus.signature_timeout(),
        )
        .with_broadcast(Arc::new(transport)),
    );
    coordinator.adopt_configured(configured_set).await?;
    info!("Signing as {}", coordinator.address());

    let mut executor = TransactionExecutor::new(store.clone(), coordinator.clone(), retry.clone());
    for chain_id in chain_manager.chain_ids() {
        executor = executor.with_destination(chain_manager.destination(chain_id)?);
    }
    let executor = Arc::new(executor);

    let recovery = Arc::new(ReorgRecoveryManager::new(store.clone(), validator.clone()));

    let engine_config = EngineConfig {
        max_concurrent_transfers: settings.relayer.max_concurrent_transfers,
        tick_interval: Duration::from_millis(settings.relayer.poll_interval_ms),
        rebroadcast_interval: Duration::from_secs(settings.consensus.rebroadcast_interval_secs),
        stale_execution_after: settings.consensus.signature_timeout(),
    };
    let mut engine = CoordinationEngine::new(
        store.clone(),
        validator,
        coordinator,
        executor,
        recovery.clone(),
        retry.clone(),
        engine_config,
    );
    for chain_id in chain_manager.chain_ids() {
        let config = chain_manager.config(chain_id)?;
        engine = engine.with_source_chain(chain_id, config.required_confirmations);
    }
    let engine = Arc::new(engine);
    info!("Coordination engine initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start chain watchers from their checkpoints
    let mut receivers = Vec::new();
    let mut watcher_handles = Vec::new();
    for chain_id in chain_manager.chain_ids() {
        let mut watcher = chain_manager.watcher(chain_id, retry.clone())?;
        watcher.resume(store.get_checkpoint(chain_id).await?);
        watcher.connect().await?;

        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        receivers.push(signals_rx);
        let shutdown = shutdown_rx.clone();
        watcher_handles.push(tokio::spawn(async move {
            if let Err(e) = watcher.run(signals_tx, shutdown).await {
                error!("Chain {} watcher error: {}", chain_id, e);
            }
        }));
    }

    // Start coordination engine
    let coordination_handle = tokio::spawn({
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = engine.run(receivers, shutdown).await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            store: store.clone(),
            chains: chain_manager.clone(),
            engine: engine.clone(),
            recovery,
            started_at: std::time::Instant::now(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, chain_ok) in chain_manager.health_check().await {
                    if !chain_ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Nexus Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Watchers and the engine stop at their next select point
    let _ = shutdown_tx.send(true);
    for handle in watcher_handles {
        let _ = handle.await;
    }
    let _ = coordination_handle.await;

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Nexus Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,nexus_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT").map_or(false, |f| f == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

fn load_wallet(settings: &Settings) -> Result<LocalWallet> {
    let var = &settings.wallet.private_key_env;
    let key = std::env::var(var).with_context(|| format!("{} is not set", var))?;
    key.trim_start_matches("0x")
        .parse::<LocalWallet>()
        .with_context(|| format!("{} does not hold a valid private key", var))
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn TransferStore>> {
    match settings.database.backend {
        DatabaseBackend::Postgres => {
            let manager = StateManager::new(&settings.database).await?;
            info!("Database connection established");
            manager.run_migrations().await?;
            info!("Database migrations complete");
            Ok(Arc::new(manager))
        }
        DatabaseBackend::Memory => {
            warn!("Using the in-memory store; state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Mirror the configured registry into the store
async fn seed_store(settings: &Settings, store: &dyn TransferStore) -> Result<()> {
    for token in &settings.tokens {
        store.upsert_token(&token.to_supported_token()?).await?;
    }
    for (_, chain) in settings.enabled_chains() {
        store.upsert_chain_config(chain).await?;
    }
    info!("Token registry holds {} tokens", store.list_tokens().await?.len());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
