//! Deposit scanning for one source chain
//!
//! The watcher walks the chain in bounded block ranges starting from the
//! persisted cursor. Every deposit in a range is handed to the coordinator
//! and acknowledged before the cursor moves past the range, so a crash at
//! any point re-scans from the last durable position.

use super::ChainClient;
use crate::error::{RelayerError, RelayerResult};
use crate::events::DepositObserved;
use crate::state::Ledger;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// A deposit handed to the coordinator; `ack` resolves once it is persisted
#[derive(Debug)]
pub struct WatcherMessage {
    pub event: DepositObserved,
    pub ack: oneshot::Sender<RelayerResult<()>>,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_block_range: u64,
    /// First block to scan when no cursor has been persisted
    pub genesis_block: Option<u64>,
}

/// What one scan pass achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProgress {
    /// The chain is marked inactive
    Inactive,
    /// Nothing new past the cursor
    Idle,
    /// Scanned up to `to`; `caught_up` when `to` was the head
    Scanned { from: u64, to: u64, events: usize, caught_up: bool },
    /// The cursor was repaired while the range was in flight and was left
    /// where the operator put it
    Superseded { cursor: Option<u64> },
}

pub struct ChainWatcher {
    client: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    events: mpsc::Sender<WatcherMessage>,
    config: WatcherConfig,
}

impl ChainWatcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        ledger: Arc<dyn Ledger>,
        events: mpsc::Sender<WatcherMessage>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            events,
            config,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }

    /// Scan until shutdown. Errors restart the scan from the persisted
    /// cursor after the reconnect delay.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let chain_id = self.chain_id();
        info!("Watcher started for chain {}", chain_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.scan_once().await {
                Ok(ScanProgress::Scanned {
                    caught_up: false, ..
                })
                | Ok(ScanProgress::Superseded { .. }) => continue,
                Ok(_) => self.config.poll_interval,
                Err(e) => {
                    error!("Watcher error for chain {}: {}", chain_id, e);
                    crate::metrics::record_watcher_error(chain_id);
                    self.config.reconnect_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Watcher stopped for chain {}", chain_id);
    }

    /// Scan the next block range past the persisted cursor
    pub async fn scan_once(&self) -> RelayerResult<ScanProgress> {
        let chain_id = self.chain_id();
        let meta = self
            .ledger
            .get_chain_metadata(chain_id)
            .await?
            .ok_or(RelayerError::ChainNotFound { chain_id })?;

        if !meta.is_active {
            debug!("Chain {} inactive, skipping scan", chain_id);
            return Ok(ScanProgress::Inactive);
        }

        let head = self.client.block_number().await?;
        crate::metrics::record_chain_height(chain_id, head);

        let from = match meta.last_block_scanned {
            Some(cursor) => cursor + 1,
            None => self.config.genesis_block.unwrap_or(head),
        };
        if from > head {
            return Ok(ScanProgress::Idle);
        }
        let to = head.min(from + self.config.max_block_range.max(1) - 1);

        let deposits = self.client.deposit_logs(from, to).await?;
        let count = deposits.len();

        // Hand everything over first, then wait for every acknowledgement
        let mut acks = Vec::with_capacity(count);
        for event in deposits {
            let (ack, done) = oneshot::channel();
            self.events
                .send(WatcherMessage { event, ack })
                .await
                .map_err(|_| RelayerError::ChannelClosed)?;
            acks.push(done);
        }
        for done in acks {
            done.await.map_err(|_| RelayerError::ChannelClosed)??;
        }

        let cursor = self
            .ledger
            .advance_cursor(chain_id, meta.last_block_scanned, to)
            .await?;
        if cursor != Some(to) {
            warn!(
                "Chain {} cursor moved to {:?} during scan of {}..={}, keeping it",
                chain_id, cursor, from, to
            );
            return Ok(ScanProgress::Superseded { cursor });
        }
        if count > 0 {
            info!(
                "Chain {}: {} deposits in blocks {}..={}",
                chain_id, count, from, to
            );
        }
        debug!("Chain {} cursor at {:?}", chain_id, cursor);

        Ok(ScanProgress::Scanned {
            from,
            to,
            events: count,
            caught_up: to >= head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryLedger;
    use crate::testing::{observed, FakeChain};
    use ethers::types::U256;
    use tokio::time::Instant;

    const HOLESKY: u64 = 17000;

    fn config(range: u64, genesis: Option<u64>) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(10),
            reconnect_delay: Duration::from_millis(10),
            max_block_range: range,
            genesis_block: genesis,
        }
    }

    async fn setup(
        range: u64,
        genesis: Option<u64>,
    ) -> (
        Arc<FakeChain>,
        Arc<MemoryLedger>,
        ChainWatcher,
        mpsc::Receiver<WatcherMessage>,
    ) {
        let chain = Arc::new(FakeChain::new(HOLESKY));
        let ledger = Arc::new(MemoryLedger::new());
        ledger.register_chain(HOLESKY, 5).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let watcher = ChainWatcher::new(chain.clone(), ledger.clone(), tx, config(range, genesis));
        (chain, ledger, watcher, rx)
    }

    fn ack_all(mut rx: mpsc::Receiver<WatcherMessage>, result: fn() -> RelayerResult<()>) {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let _ = msg.ack.send(result());
            }
        });
    }

    #[tokio::test]
    async fn test_cursor_advances_after_acks() {
        let (chain, ledger, watcher, rx) = setup(100, Some(0)).await;
        chain.set_head(10);
        chain.add_deposit(observed(HOLESKY, 1, 5));
        chain.add_deposit(observed(HOLESKY, 2, 8));
        ack_all(rx, || Ok(()));

        let progress = watcher.scan_once().await.unwrap();
        assert_eq!(
            progress,
            ScanProgress::Scanned {
                from: 0,
                to: 10,
                events: 2,
                caught_up: true
            }
        );
        let meta = ledger.get_chain_metadata(HOLESKY).await.unwrap().unwrap();
        assert_eq!(meta.last_block_scanned, Some(10));

        chain.set_head(12);
        let progress = watcher.scan_once().await.unwrap();
        assert!(matches!(progress, ScanProgress::Scanned { from: 11, to: 12, events: 0, .. }));
    }

    #[tokio::test]
    async fn test_failed_ack_keeps_cursor() {
        let (chain, ledger, watcher, rx) = setup(100, Some(0)).await;
        chain.set_head(10);
        chain.add_deposit(observed(HOLESKY, 1, 5));
        ack_all(rx, || Err(RelayerError::Internal("store down".to_string())));

        assert!(watcher.scan_once().await.is_err());
        let meta = ledger.get_chain_metadata(HOLESKY).await.unwrap().unwrap();
        assert_eq!(meta.last_block_scanned, None);
    }

    #[tokio::test]
    async fn test_bounded_ranges_and_head_start() {
        let (chain, _ledger, watcher, _rx) = setup(4, Some(0)).await;
        chain.set_head(10);
        let progress = watcher.scan_once().await.unwrap();
        assert!(matches!(progress, ScanProgress::Scanned { from: 0, to: 3, caught_up: false, .. }));

        // Without a genesis block the first scan starts at the head
        let (chain, _ledger, watcher, _rx) = setup(4, None).await;
        chain.set_head(50);
        let progress = watcher.scan_once().await.unwrap();
        assert!(matches!(progress, ScanProgress::Scanned { from: 50, to: 50, .. }));
    }

    #[tokio::test]
    async fn test_inactive_chain_is_skipped() {
        let (chain, ledger, watcher, _rx) = setup(100, Some(0)).await;
        chain.set_head(10);
        ledger.set_chain_active(HOLESKY, false).await.unwrap();

        assert_eq!(watcher.scan_once().await.unwrap(), ScanProgress::Inactive);
        let meta = ledger.get_chain_metadata(HOLESKY).await.unwrap().unwrap();
        assert_eq!(meta.last_block_scanned, None);
    }

    async fn cursor(ledger: &MemoryLedger) -> Option<u64> {
        ledger
            .get_chain_metadata(HOLESKY)
            .await
            .unwrap()
            .unwrap()
            .last_block_scanned
    }

    #[tokio::test]
    async fn test_run_resumes_after_rpc_outage() {
        let (chain, ledger, watcher, mut rx) = setup(100, Some(0)).await;
        ledger.advance_cursor(HOLESKY, None, 4).await.unwrap();
        chain.set_head(10);
        chain.add_deposit(observed(HOLESKY, 9, 3));
        chain.add_deposit(observed(HOLESKY, 1, 7));
        chain.set_rpc_down(true);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = Arc::new(watcher);
        let handle = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(cursor(&ledger).await, Some(4));

        chain.set_rpc_down(false);
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.event.nonce, U256::one());
        msg.ack.send(Ok(())).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while cursor(&ledger).await != Some(10) {
            assert!(Instant::now() < deadline, "cursor never reached the head");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        // Block 3 sits below the persisted cursor and nonce 1 went out once
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cursor_repair_during_scan_is_kept() {
        let (chain, ledger, watcher, mut rx) = setup(100, Some(0)).await;
        ledger.advance_cursor(HOLESKY, None, 20).await.unwrap();
        chain.set_head(30);
        chain.add_deposit(observed(HOLESKY, 1, 25));

        let repair = async {
            let msg = rx.recv().await.unwrap();
            ledger.set_cursor(HOLESKY, Some(2)).await.unwrap();
            msg.ack.send(Ok(())).unwrap();
        };
        let (progress, ()) = tokio::join!(watcher.scan_once(), repair);
        assert_eq!(
            progress.unwrap(),
            ScanProgress::Superseded { cursor: Some(2) }
        );
        assert_eq!(cursor(&ledger).await, Some(2));

        // The next pass rescans from the repaired position
        ack_all(rx, || Ok(()));
        let progress = watcher.scan_once().await.unwrap();
        assert!(matches!(
            progress,
            ScanProgress::Scanned { from: 3, to: 30, events: 1, .. }
        ));
        assert_eq!(cursor(&ledger).await, Some(30));
    }
}
