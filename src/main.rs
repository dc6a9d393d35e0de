//! Maker relayer - cross-chain liquidity bridge settlement
//!
//! Watches the makers' addresses on every configured chain and pays users out
//! on the destination chain their transfer amount names.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use maker_relayer::chain::{ChainRegistry, EvmChainProvider, TransferListener, WatchList};
use maker_relayer::config::{ChainKind, Settings};
use maker_relayer::metrics::{self, MetricsServer};
use maker_relayer::pipeline::{route_transfers, PipelineSettings, SettlementPipeline};
use maker_relayer::pool::PoolBook;
use maker_relayer::retry::{Poller, RetryPolicy, TokioSleeper};
use maker_relayer::state::PgLedger;
use maker_relayer::tx::{MakerKeys, SettlementExecutor};

/// Buffered transfers between the listeners and the router
const TRANSFER_CHANNEL_SIZE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Maker Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains and {} pools",
        settings.enabled_chains().len(),
        settings.pools.len()
    );

    // Initialize database connection
    let ledger = Arc::new(PgLedger::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    ledger.run_migrations().await?;

    let registry = Arc::new(ChainRegistry::from_settings(&settings)?);
    let book = Arc::new(PoolBook::from_configs(&settings.pools)?);
    // No rollup client ships with the binary; pools on rollups cannot be served
    registry.ensure_serves(&book)?;
    let keys = MakerKeys::from_configs(&settings.makers)?;
    info!(
        "{} chains, {} pool rules, {} maker keys",
        registry.chain_ids().len(),
        book.rules().len(),
        keys.len()
    );

    let relayer = &settings.relayer;
    let poller = Poller::new(
        RetryPolicy::from_config(relayer.poll_interval_ms, &relayer.retry),
        Arc::new(TokioSleeper),
    );
    let executor = Arc::new(SettlementExecutor::new(registry.clone(), keys, poller.clone()));
    let pipeline = Arc::new(SettlementPipeline::new(
        registry.clone(),
        ledger.clone(),
        ledger.clone(),
        executor,
        poller,
        PipelineSettings {
            source_confirmations: relayer.source_confirmations,
            destination_confirmations: relayer.destination_confirmations,
            max_send_attempts: relayer.retry.max_send_attempts,
        },
    ));
    info!("Settlement pipeline initialized");

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

    // Start chain listeners
    let (transfers, transfer_rx) = mpsc::channel(TRANSFER_CHANNEL_SIZE);
    let mut listener_handles = Vec::new();
    for (name, chain_config) in settings.enabled_chains() {
        if chain_config.kind != ChainKind::Evm {
            continue;
        }
        let watch = WatchList::for_chain(&book, chain_config.chain_id);
        if watch.is_empty() {
            info!("No pools watch chain {}, not listening", name);
            continue;
        }

        let provider = Arc::new(EvmChainProvider::new(chain_config)?);
        let listener = TransferListener::new(
            provider,
            watch,
            transfers.clone(),
            Duration::from_millis(relayer.listener_interval_ms),
        );
        listener_handles.push(tokio::spawn(async move {
            if let Err(e) = listener.listen().await {
                error!("Listener for chain {} failed: {}", listener.chain_id(), e);
            }
        }));
    }
    drop(transfers);

    let router_handle = tokio::spawn(route_transfers(transfer_rx, book.clone(), pipeline.clone()));

    // Pending retries from a previous run are picked up on the first sweep
    let sweep_handle = tokio::spawn(
        pipeline
            .clone()
            .run_retry_sweep(Duration::from_secs(relayer.retry_sweep_interval_secs)),
    );

    // Health check loop
    let health_handle = tokio::spawn({
        let registry = registry.clone();
        let ledger = ledger.clone();
        let interval = relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, chain_healthy) in registry.health_check().await {
                    if !chain_healthy {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = ledger.health_check().await {
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

    info!(
        "Maker Relayer {} is running with {} listeners",
        relayer.instance_id,
        listener_handles.len()
    );
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // In-flight settlements are recovered from the ledgers on the next start
    for handle in listener_handles {
        handle.abort();
    }
    router_handle.abort();
    sweep_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Maker Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,maker_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
