//! Relay coordinator: the deposit state machine driver
//!
//! Watchers hand deposits over a channel; the coordinator persists each one
//! before acknowledging it, tracks its confirmations, and hands confirmed
//! deposits to the executor of their destination chain. On startup it
//! resumes every unfinished deposit from the ledger.

use crate::chain::finality::recommended_confirmations;
use crate::chain::{ConfirmationTracker, FinalityOutcome, WatcherMessage};
use crate::error::{RelayerError, RelayerResult};
use crate::events::DepositObserved;
use crate::state::{Deposit, DepositStatus, Ledger, NewDeposit, StatusUpdate};
use crate::tx::DistributionExecutor;

use dashmap::DashMap;
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Source chain wiring
struct Route {
    target_chain: u64,
    tracker: Arc<ConfirmationTracker>,
}

pub struct RelayCoordinator {
    ledger: Arc<dyn Ledger>,
    routes: HashMap<u64, Route>,
    executors: HashMap<u64, Arc<DistributionExecutor>>,
    /// Deposits with a live confirmation task
    in_flight: DashMap<(u64, U256), ()>,
    /// Pause before re-checking after a ledger write failed
    retry_delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RelayCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        retry_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ledger,
            routes: HashMap::new(),
            executors: HashMap::new(),
            in_flight: DashMap::new(),
            retry_delay,
            shutdown,
        }
    }

    /// Relay deposits seen on `source_chain` to `target_chain`
    pub fn with_route(
        mut self,
        source_chain: u64,
        target_chain: u64,
        tracker: Arc<ConfirmationTracker>,
    ) -> Self {
        self.routes.insert(
            source_chain,
            Route {
                target_chain,
                tracker,
            },
        );
        self
    }

    pub fn with_executor(mut self, executor: Arc<DistributionExecutor>) -> Self {
        self.executors.insert(executor.chain_id(), executor);
        self
    }

    /// Number of deposits currently waiting on confirmations
    pub fn tracking_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Pick up every unfinished deposit where it left off
    pub async fn resume(self: &Arc<Self>) -> RelayerResult<usize> {
        let unfinished = self.ledger.list_unfinished().await?;
        let count = unfinished.len();

        for deposit in unfinished {
            match deposit.status {
                DepositStatus::Pending => self.spawn_tracking(deposit),
                DepositStatus::Confirmed | DepositStatus::Distributing => {
                    self.dispatch(deposit).await
                }
                DepositStatus::Completed | DepositStatus::Failed => {}
            }
        }

        info!("Resumed {} unfinished deposits", count);
        Ok(count)
    }

    /// Consume watcher hand-offs until shutdown or all watchers are gone
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<WatcherMessage>) {
        let mut shutdown = self.shutdown.clone();
        info!("Relay coordinator started");

        loop {
            tokio::select! {
                message = events.recv() => {
                    let Some(WatcherMessage { event, ack }) = message else {
                        break;
                    };
                    let result = self.handle_observed(&event).await;
                    if let Err(e) = &result {
                        error!(
                            source_chain = event.chain_id,
                            nonce = %event.nonce,
                            "Failed to record deposit: {}", e
                        );
                    }
                    // The watcher may already have given up on this range
                    let _ = ack.send(result);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Relay coordinator stopped");
    }

    /// Persist an observed deposit and start tracking it. Replays of known
    /// deposits change nothing.
    pub async fn handle_observed(self: &Arc<Self>, event: &DepositObserved) -> RelayerResult<()> {
        let route = self
            .routes
            .get(&event.chain_id)
            .ok_or(RelayerError::ChainNotFound {
                chain_id: event.chain_id,
            })?;

        let outcome = self
            .ledger
            .record_deposit(&NewDeposit::from_observed(event, route.target_chain))
            .await?;

        if outcome.created {
            info!(
                source_chain = event.chain_id,
                target_chain = route.target_chain,
                nonce = %event.nonce,
                amount = %event.amount,
                tx_hash = ?event.tx_hash,
                "Deposit observed"
            );
            crate::metrics::record_deposit_observed(event.chain_id);
        } else {
            debug!(
                source_chain = event.chain_id,
                nonce = %event.nonce,
                status = %outcome.deposit.status,
                "Deposit already recorded"
            );
        }

        if outcome.deposit.status == DepositStatus::Pending {
            self.spawn_tracking(outcome.deposit);
        }
        Ok(())
    }

    /// Start a confirmation task unless one already runs for this deposit
    fn spawn_tracking(self: &Arc<Self>, deposit: Deposit) {
        let key = deposit.key();
        if self.in_flight.insert(key, ()).is_some() {
            debug!(source_chain = key.0, nonce = %key.1, "Deposit already tracked");
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.track(deposit).await;
            this.in_flight.remove(&key);
        });
    }

    async fn required_confirmations(&self, chain_id: u64) -> u64 {
        match self.ledger.get_chain_metadata(chain_id).await {
            Ok(Some(meta)) => meta.required_confirmations,
            Ok(None) => recommended_confirmations(chain_id),
            Err(e) => {
                warn!("Could not read metadata for chain {}: {}", chain_id, e);
                recommended_confirmations(chain_id)
            }
        }
    }

    async fn track(self: &Arc<Self>, deposit: Deposit) {
        let (source_chain, nonce) = deposit.key();
        let Some(route) = self.routes.get(&source_chain) else {
            error!(source_chain, "No route for deposit source chain");
            return;
        };
        let mut shutdown = self.shutdown.clone();

        loop {
            let required = self.required_confirmations(source_chain).await;
            let wait = route.tracker.await_finality(
                deposit.deposit_tx_hash,
                deposit.source_block_hash,
                required,
            );

            let outcome = tokio::select! {
                outcome = wait => outcome,
                _ = shutdown.changed() => return,
            };

            let written = match outcome {
                FinalityOutcome::Confirmed { confirmations } => {
                    self.confirm(&deposit, confirmations).await
                }
                FinalityOutcome::Dropped { reason } => self.evict(&deposit, reason).await,
                FinalityOutcome::TimedOut { last_depth } => {
                    warn!(
                        source_chain,
                        nonce = %nonce,
                        depth = ?last_depth,
                        required,
                        "Confirmation wait timed out, continuing"
                    );
                    if let Some(depth) = last_depth {
                        if let Err(e) = self
                            .ledger
                            .update_confirmations(source_chain, nonce, depth)
                            .await
                        {
                            warn!("Could not record confirmations: {}", e);
                        }
                    }
                    continue;
                }
            };

            match written {
                Ok(()) => return,
                Err(RelayerError::InvalidStateTransition { from, .. }) => {
                    debug!(source_chain, nonce = %nonce, "Deposit moved on to {}", from);
                    return;
                }
                Err(e) => {
                    warn!(source_chain, nonce = %nonce, "Ledger write failed, retrying: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }

    async fn confirm(self: &Arc<Self>, deposit: &Deposit, confirmations: u64) -> RelayerResult<()> {
        let updated = self
            .ledger
            .transition(
                deposit.source_chain,
                deposit.nonce,
                DepositStatus::Confirmed,
                StatusUpdate::with_confirmations(confirmations),
            )
            .await?;
        crate::metrics::record_deposit_confirmed(deposit.source_chain);
        self.dispatch(updated).await;
        Ok(())
    }

    async fn evict(&self, deposit: &Deposit, reason: String) -> RelayerResult<()> {
        let err = RelayerError::ReorgDetected {
            chain_id: deposit.source_chain,
            block_number: deposit.source_block_number,
        };
        error!(
            alert = err.should_alert(),
            source_chain = deposit.source_chain,
            nonce = %deposit.nonce,
            "{}: {}", err, reason
        );
        self.ledger
            .transition(
                deposit.source_chain,
                deposit.nonce,
                DepositStatus::Failed,
                StatusUpdate::failed(reason),
            )
            .await?;
        crate::metrics::record_deposit_failed(deposit.source_chain, "confirmation");

        // Higher nonces of the pair may be held behind this one
        if let Some(executor) = self.executors.get(&deposit.target_chain) {
            executor.wake();
        }
        Ok(())
    }

    async fn dispatch(&self, deposit: Deposit) {
        match self.executors.get(&deposit.target_chain) {
            Some(executor) => executor.enqueue(deposit).await,
            None => error!(
                target_chain = deposit.target_chain,
                nonce = %deposit.nonce,
                "No executor for destination chain"
            ),
        }
    }
}
