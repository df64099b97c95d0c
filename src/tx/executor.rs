//! Ordered distribution executor for one destination chain
//!
//! All distributions to a chain go through a single worker, so the signer
//! never races itself. Queued deposits drain in ascending (source chain,
//! nonce) order, and a deposit is only released once no lower nonce of
//! its (source, target) pair is still open in the ledger.

use super::retry::RetryConfig;
use crate::chain::{ChainClient, DistributionReceipt, SubmitError};
use crate::error::{RelayerError, RelayerResult};
use crate::events::DistributionCall;
use crate::state::{Deposit, DepositStatus, Ledger, StatusUpdate};

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::{H256, U256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryConfig,
    /// How long to poll for a receipt before asking whether the node still
    /// has the transaction
    pub receipt_timeout: Duration,
    /// Receipt polling cadence, also how often held deposits are rechecked
    pub receipt_poll_interval: Duration,
}

/// Result of one submission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionOutcome {
    Submitted(H256),
    /// The bridge already paid this nonce; counts as success
    AlreadyDistributed,
    /// Structural problem; the deposit must not be retried
    Rejected(String),
    /// Worth another attempt after backoff
    Transient(String),
}

impl From<Result<H256, SubmitError>> for DistributionOutcome {
    fn from(result: Result<H256, SubmitError>) -> Self {
        match result {
            Ok(tx_hash) => DistributionOutcome::Submitted(tx_hash),
            Err(SubmitError::AlreadyDistributed) => DistributionOutcome::AlreadyDistributed,
            Err(SubmitError::Structural(reason)) => DistributionOutcome::Rejected(reason),
            Err(SubmitError::Transient(reason)) => DistributionOutcome::Transient(reason),
        }
    }
}

/// Where a broadcast distribution stands after one receipt wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Mined,
    Reverted,
    /// No receipt yet but the node still has it
    Pending,
    /// Neither mined nor known to the node
    Dropped,
}

pub struct DistributionExecutor {
    client: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    config: ExecutorConfig,
    queue: Mutex<BTreeMap<(u64, U256), Deposit>>,
    /// Consecutive aborted attempts per queued deposit
    aborts: DashMap<(u64, U256), u32>,
    notify: Notify,
}

impl DistributionExecutor {
    pub fn new(client: Arc<dyn ChainClient>, ledger: Arc<dyn Ledger>, config: ExecutorConfig) -> Self {
        Self {
            client,
            ledger,
            config,
            queue: Mutex::new(BTreeMap::new()),
            aborts: DashMap::new(),
            notify: Notify::new(),
        }
    }

    /// Destination chain served by this executor
    pub fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }

    /// Queue a confirmed deposit. Queuing the same deposit twice is a no-op.
    pub async fn enqueue(&self, deposit: Deposit) {
        let key = deposit.key();
        let mut queue = self.queue.lock().await;
        if queue.insert(key, deposit).is_none() {
            debug!(
                target_chain = self.chain_id(),
                source_chain = key.0,
                nonce = %key.1,
                "Deposit queued for distribution"
            );
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Recheck held deposits now, e.g. after a lower nonce failed
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Work the queue until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Distribution executor started for chain {}", self.chain_id());
        loop {
            self.drain(&shutdown).await;
            let holding = !self.queue.lock().await.is_empty();
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.receipt_poll_interval), if holding => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Distribution executor stopped for chain {}", self.chain_id());
    }

    /// Process every queued deposit that is free to go, lowest key first.
    /// Returns when the queue is empty or everything left is held behind a
    /// lower open nonce.
    pub async fn drain(&self, shutdown: &watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let deposit = match self.next_ready().await {
                Ok(Some(deposit)) => deposit,
                Ok(None) => return,
                Err(e) => {
                    warn!("Queue check on chain {} failed: {}", self.chain_id(), e);
                    return;
                }
            };

            let key = deposit.key();
            match self.process(&deposit).await {
                Ok(()) => {
                    self.aborts.remove(&key);
                }
                Err(e) => self.requeue(deposit, e, shutdown).await,
            }
        }
    }

    /// Pop the lowest queued deposit whose pair has no lower open nonce
    async fn next_ready(&self) -> RelayerResult<Option<Deposit>> {
        // Only the lowest queued nonce of each source can be ready
        let heads: Vec<(u64, U256)> = {
            let queue = self.queue.lock().await;
            let mut heads: Vec<(u64, U256)> = Vec::new();
            for &(source_chain, nonce) in queue.keys() {
                if heads.last().map_or(true, |(last, _)| *last != source_chain) {
                    heads.push((source_chain, nonce));
                }
            }
            heads
        };

        for (source_chain, nonce) in heads {
            let lowest = self
                .ledger
                .lowest_open_nonce(source_chain, self.chain_id())
                .await?;
            match lowest {
                Some(open) if open < nonce => {
                    debug!(
                        source_chain,
                        nonce = %nonce,
                        waiting_on = %open,
                        "Holding distribution behind lower nonce"
                    );
                }
                _ => {
                    if let Some(deposit) = self.queue.lock().await.remove(&(source_chain, nonce)) {
                        return Ok(Some(deposit));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Put an aborted deposit back after a backoff. Past the retry budget it
    /// stays non-terminal in the ledger for the next restart.
    async fn requeue(&self, deposit: Deposit, err: RelayerError, shutdown: &watch::Receiver<bool>) {
        let key = deposit.key();
        let aborts = {
            let mut count = self.aborts.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        let retry = &self.config.retry;
        if !retry.should_retry(aborts - 1) {
            self.aborts.remove(&key);
            error!(
                alert = true,
                source_chain = key.0,
                nonce = %key.1,
                "Distribution aborted {} times, leaving it for restart: {}", aborts, err
            );
            return;
        }

        let backoff = retry.backoff_for_attempt(aborts - 1);
        warn!(
            source_chain = key.0,
            nonce = %key.1,
            ?backoff,
            "Distribution aborted, requeueing: {}", err
        );
        let mut shutdown = shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        self.queue.lock().await.entry(key).or_insert(deposit);
    }

    /// Drive one deposit to a terminal state
    pub async fn process(&self, queued: &Deposit) -> RelayerResult<()> {
        let (source_chain, nonce) = queued.key();
        let Some(deposit) = self.ledger.get_deposit(source_chain, nonce).await? else {
            warn!(source_chain, nonce = %nonce, "Queued deposit missing from ledger");
            return Ok(());
        };

        let outstanding = match deposit.status {
            DepositStatus::Completed | DepositStatus::Failed => {
                debug!(source_chain, nonce = %nonce, status = %deposit.status, "Skipping finished deposit");
                return Ok(());
            }
            DepositStatus::Pending => {
                warn!(source_chain, nonce = %nonce, "Refusing to distribute unconfirmed deposit");
                return Ok(());
            }
            DepositStatus::Distributing => {
                if let Some(tx_hash) = deposit.distribution_tx_hash {
                    info!(
                        source_chain,
                        nonce = %nonce,
                        tx_hash = ?tx_hash,
                        "Reconciling earlier distribution"
                    );
                }
                deposit.distribution_tx_hash
            }
            DepositStatus::Confirmed => {
                self.ledger
                    .transition(
                        source_chain,
                        nonce,
                        DepositStatus::Distributing,
                        StatusUpdate::default(),
                    )
                    .await?;
                None
            }
        };

        self.distribute(&deposit, outstanding).await
    }

    /// Submit with backoff until the deposit reaches a terminal state. While
    /// a broadcast is outstanding nothing new is sent for the deposit; a
    /// fresh submission only follows a revert or a dropped transaction.
    async fn distribute(&self, deposit: &Deposit, mut outstanding: Option<H256>) -> RelayerResult<()> {
        let call = DistributionCall {
            target_chain: self.chain_id(),
            token: deposit.token,
            recipient: deposit.recipient,
            amount: deposit.amount,
            nonce: deposit.nonce,
        };
        let retry = &self.config.retry;
        let mut attempt = 0u32;
        let mut stalls = 0u32;

        loop {
            let failure = match outstanding {
                Some(tx_hash) => match self.settle(tx_hash).await {
                    Settlement::Mined => return self.complete(deposit, Some(tx_hash)).await,
                    Settlement::Pending => {
                        stalls += 1;
                        if stalls == 1 {
                            error!(
                                alert = true,
                                target_chain = self.chain_id(),
                                nonce = %deposit.nonce,
                                tx_hash = ?tx_hash,
                                "Distribution unmined after {:?}, waiting on it",
                                self.config.receipt_timeout
                            );
                        }
                        continue;
                    }
                    Settlement::Reverted => {
                        self.forget_broadcast(deposit).await?;
                        outstanding = None;
                        format!("distribution {:?} reverted", tx_hash)
                    }
                    Settlement::Dropped => {
                        self.forget_broadcast(deposit).await?;
                        outstanding = None;
                        format!("distribution {:?} dropped from the mempool", tx_hash)
                    }
                },
                None => match self.submit(&call).await {
                    DistributionOutcome::AlreadyDistributed => {
                        info!(
                            source_chain = deposit.source_chain,
                            nonce = %deposit.nonce,
                            "Destination bridge already distributed this nonce"
                        );
                        return self.complete(deposit, None).await;
                    }
                    DistributionOutcome::Rejected(reason) => {
                        return self.fail(deposit, reason).await;
                    }
                    DistributionOutcome::Submitted(tx_hash) => {
                        self.ledger
                            .record_distribution_tx(deposit.source_chain, deposit.nonce, Some(tx_hash))
                            .await?;
                        outstanding = Some(tx_hash);
                        stalls = 0;
                        continue;
                    }
                    DistributionOutcome::Transient(reason) => reason,
                },
            };

            if !retry.should_retry(attempt) {
                error!(
                    alert = true,
                    source_chain = deposit.source_chain,
                    target_chain = self.chain_id(),
                    nonce = %deposit.nonce,
                    "Distribution retries exhausted: {}", failure
                );
                return self
                    .fail(deposit, format!("retries exhausted: {}", failure))
                    .await;
            }

            let backoff = retry.backoff_for_attempt(attempt);
            attempt += 1;
            warn!(
                attempt,
                max = retry.max_retries,
                ?backoff,
                nonce = %deposit.nonce,
                "Distribution failed, retrying: {}", failure
            );
            crate::metrics::record_distribution_retry(self.chain_id());
            tokio::time::sleep(backoff).await;
        }
    }

    /// One `distribute` attempt on the destination chain
    pub async fn submit(&self, call: &DistributionCall) -> DistributionOutcome {
        self.client.send_distribution(call).await.into()
    }

    /// Wait one receipt timeout for a broadcast, then ask the node whether
    /// it still has it. An RPC error counts as still pending.
    async fn settle(&self, tx_hash: H256) -> Settlement {
        if let Some(receipt) = self.wait_for_receipt(tx_hash).await {
            return if receipt.success {
                Settlement::Mined
            } else {
                Settlement::Reverted
            };
        }
        match self.client.distribution_known(tx_hash).await {
            Ok(true) => Settlement::Pending,
            Ok(false) => Settlement::Dropped,
            Err(e) => {
                warn!("Mempool lookup for {:?} failed: {}", tx_hash, e);
                Settlement::Pending
            }
        }
    }

    /// Poll for a receipt until the receipt timeout. RPC errors only delay.
    async fn wait_for_receipt(&self, tx_hash: H256) -> Option<DistributionReceipt> {
        let deadline = Instant::now() + self.config.receipt_timeout;
        loop {
            match self.client.distribution_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => warn!("Receipt lookup for {:?} failed: {}", tx_hash, e),
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }

    /// A recorded hash that did not pay must not end up on the deposit
    async fn forget_broadcast(&self, deposit: &Deposit) -> RelayerResult<()> {
        self.ledger
            .record_distribution_tx(deposit.source_chain, deposit.nonce, None)
            .await
    }

    async fn complete(&self, deposit: &Deposit, tx_hash: Option<H256>) -> RelayerResult<()> {
        let updated = self
            .ledger
            .transition(
                deposit.source_chain,
                deposit.nonce,
                DepositStatus::Completed,
                StatusUpdate::with_tx_hash(tx_hash),
            )
            .await;

        match updated {
            Ok(done) => {
                let latency = (Utc::now() - done.created_at).num_milliseconds() as f64 / 1000.0;
                crate::metrics::record_deposit_completed(done.source_chain, done.target_chain, latency);
                info!(
                    source_chain = done.source_chain,
                    target_chain = done.target_chain,
                    nonce = %done.nonce,
                    distribution_tx = ?done.distribution_tx_hash,
                    "Deposit completed"
                );
                Ok(())
            }
            Err(RelayerError::InvalidStateTransition { from, .. }) => {
                debug!(nonce = %deposit.nonce, "Deposit already {}", from);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, deposit: &Deposit, reason: String) -> RelayerResult<()> {
        warn!(
            source_chain = deposit.source_chain,
            nonce = %deposit.nonce,
            "Deposit failed: {}", reason
        );
        self.ledger
            .transition(
                deposit.source_chain,
                deposit.nonce,
                DepositStatus::Failed,
                StatusUpdate::failed(reason),
            )
            .await?;
        crate::metrics::record_deposit_failed(deposit.source_chain, "distribution");
        Ok(())
    }
}
