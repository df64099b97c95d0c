//! Deposit Relayer - exactly-once mirroring of bridge deposits between EVM chains
//!
//! Watches the bridge contract on every enabled chain for `Deposit` events,
//! waits for source-chain finality and calls `distribute` on the paired
//! destination chain, recording every step in a durable ledger.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod state;
#[cfg(test)]
mod testing;
mod tx;

use chain::{ChainManager, ChainWatcher, ConfirmationTracker, TrackerConfig, WatcherConfig};
use config::Settings;
use coordination::RelayCoordinator;
use metrics::MetricsServer;
use state::{Ledger, MemoryLedger, PgLedger, SupportedToken};
use tx::{DistributionExecutor, ExecutorConfig, RetryConfig, TransactionSender};

/// Database URL that selects the in-process ledger for dry runs
const MEMORY_LEDGER_URL: &str = "memory://";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Deposit Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Configuration and signer are both fatal when missing
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );
    let wallet = TransactionSender::load_wallet(&settings.signer_key()?)?;

    let ledger: Arc<dyn Ledger> = if settings.database.url == MEMORY_LEDGER_URL {
        warn!("Using the in-memory ledger, nothing survives a restart");
        Arc::new(MemoryLedger::new())
    } else {
        let ledger = PgLedger::new(&settings.database).await?;
        info!("Database connection established");
        ledger.run_migrations().await?;
        info!("Database migrations complete");
        Arc::new(ledger)
    };

    seed_reference_data(&settings, ledger.as_ref()).await?;

    let chain_manager = Arc::new(ChainManager::new(&settings, wallet)?);
    info!("Chain connections initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relayer = &settings.relayer;

    // One executor per destination chain
    let mut executors = Vec::new();
    let mut targets: Vec<u64> = settings
        .enabled_chains()
        .iter()
        .map(|(_, c)| c.target_chain_id)
        .collect();
    targets.sort_unstable();
    targets.dedup();
    for target in targets {
        let executor = Arc::new(DistributionExecutor::new(
            chain_manager.get_client(target)?,
            ledger.clone(),
            ExecutorConfig {
                retry: RetryConfig::from(relayer),
                receipt_timeout: relayer.receipt_timeout(),
                receipt_poll_interval: relayer.confirmation_poll_interval(),
            },
        ));
        executors.push(executor);
    }

    let mut coordinator = RelayCoordinator::new(
        ledger.clone(),
        Duration::from_millis(relayer.retry_delay_ms),
        shutdown_rx.clone(),
    );
    for (_, chain_config) in settings.enabled_chains() {
        let tracker = Arc::new(ConfirmationTracker::new(
            chain_manager.get_client(chain_config.chain_id)?,
            TrackerConfig {
                poll_interval: relayer.confirmation_poll_interval(),
                timeout: relayer.confirmation_timeout(),
                dropped_after_misses: relayer.dropped_after_misses,
            },
        ));
        coordinator = coordinator.with_route(
            chain_config.chain_id,
            chain_config.target_chain_id,
            tracker,
        );
    }
    for executor in &executors {
        coordinator = coordinator.with_executor(executor.clone());
    }
    let coordinator = Arc::new(coordinator);

    let mut executor_handles = Vec::new();
    for executor in executors {
        let shutdown = shutdown_rx.clone();
        executor_handles.push(tokio::spawn(async move { executor.run(shutdown).await }));
    }

    // Unfinished work is resumed before any new event is accepted
    coordinator.resume().await?;

    let (events_tx, events_rx) = mpsc::channel(relayer.event_channel_capacity);
    let coordinator_handle = tokio::spawn(coordinator.clone().run(events_rx));

    let mut watcher_handles = Vec::new();
    for (name, chain_config) in settings.enabled_chains() {
        let watcher = ChainWatcher::new(
            chain_manager.get_client(chain_config.chain_id)?,
            ledger.clone(),
            events_tx.clone(),
            WatcherConfig {
                poll_interval: relayer.poll_interval(),
                reconnect_delay: relayer.reconnect_delay(),
                max_block_range: relayer.max_block_range,
                genesis_block: chain_config.genesis_block,
            },
        );
        info!("Watching {} (chain {})", name, chain_config.chain_id);
        let shutdown = shutdown_rx.clone();
        watcher_handles.push(tokio::spawn(async move { watcher.run(shutdown).await }));
    }
    // Watchers hold the only senders; the coordinator stops once they are gone
    drop(events_tx);

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            ledger: ledger.clone(),
            chain_manager: chain_manager.clone(),
            started_at: Instant::now(),
        };
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
        let ledger = ledger.clone();
        let interval = relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (chain_id, ok) in chain_manager.health_check().await {
                    if !ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = ledger.health_check().await {
                    warn!("Ledger health check failed: {}", e);
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

    info!("Deposit Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    if shutdown_tx.send(true).is_err() {
        warn!("No task was listening for shutdown");
    }

    // In-flight work gets a grace period; anything cut off resumes on restart
    let grace = Duration::from_secs(relayer.shutdown_grace_secs);
    let workers = async {
        futures::future::join_all(watcher_handles).await;
        futures::future::join_all(executor_handles).await;
        let _ = coordinator_handle.await;
    };
    if tokio::time::timeout(grace, workers).await.is_err() {
        warn!("Workers did not stop within {:?}, aborting", grace);
    }

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Deposit Relayer stopped");
    Ok(())
}

/// Register every enabled chain and the configured tokens. Existing cursors
/// are left untouched.
async fn seed_reference_data(settings: &Settings, ledger: &dyn Ledger) -> Result<()> {
    for (name, chain_config) in settings.enabled_chains() {
        let meta = ledger
            .register_chain(chain_config.chain_id, chain_config.required_confirmations())
            .await?;
        info!(
            "Chain {} requires {} confirmations, cursor at {:?}",
            name, meta.required_confirmations, meta.last_block_scanned
        );
    }

    let mut by_chain: HashMap<u64, usize> = HashMap::new();
    for token in &settings.tokens {
        ledger
            .upsert_supported_token(&SupportedToken {
                chain_id: token.chain_id,
                token_address: token.address.parse()?,
                symbol: token.symbol.clone(),
                decimals: token.decimals,
            })
            .await?;
        *by_chain.entry(token.chain_id).or_default() += 1;
    }
    for (chain_id, count) in by_chain {
        info!("Seeded {} supported tokens for chain {}", count, chain_id);
    }

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,deposit_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("RELAYER_LOG_FORMAT").is_ok_and(|f| f == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
