//! Confirmation tracking for source-chain deposits
//!
//! A deposit is final enough once its transaction is buried under the
//! chain's required depth at the block hash it was first observed in. A
//! different block hash, or a receipt that keeps disappearing, means the
//! deposit was reorged out.

use super::{ChainClient, Inclusion};
use crate::error::RelayerResult;

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    /// Give up waiting (without failing the deposit) after this long
    pub timeout: Duration,
    /// Consecutive polls without a receipt before the deposit is dropped
    pub dropped_after_misses: u32,
}

/// How a wait for finality ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalityOutcome {
    Confirmed { confirmations: u64 },
    /// The transaction is gone from its original block; terminal
    Dropped { reason: String },
    /// No decision within the horizon; retryable
    TimedOut { last_depth: Option<u64> },
}

/// Result of a single poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthCheck {
    Reached(u64),
    Waiting(u64),
    Missing,
    Moved(Inclusion),
}

/// Tracks finality of transactions on a single chain
pub struct ConfirmationTracker {
    client: Arc<dyn ChainClient>,
    config: TrackerConfig,
}

impl ConfirmationTracker {
    pub fn new(client: Arc<dyn ChainClient>, config: TrackerConfig) -> Self {
        Self { client, config }
    }

    pub fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }

    /// Poll until `tx_hash` is `required` blocks deep at `block_hash`, has
    /// been dropped, or the horizon passes.
    pub async fn await_finality(
        &self,
        tx_hash: H256,
        block_hash: H256,
        required: u64,
    ) -> FinalityOutcome {
        let chain_id = self.chain_id();
        let deadline = Instant::now() + self.config.timeout;
        let mut misses = 0u32;
        let mut last_depth = None;

        loop {
            match self.check(tx_hash, block_hash, required).await {
                Ok(DepthCheck::Reached(confirmations)) => {
                    info!(
                        "Deposit tx {:?} final on chain {} ({} confirmations)",
                        tx_hash, chain_id, confirmations
                    );
                    return FinalityOutcome::Confirmed { confirmations };
                }
                Ok(DepthCheck::Waiting(depth)) => {
                    misses = 0;
                    last_depth = Some(depth);
                    debug!(
                        "Deposit tx {:?} has {} / {} confirmations on chain {}",
                        tx_hash, depth, required, chain_id
                    );
                }
                Ok(DepthCheck::Missing) => {
                    misses += 1;
                    warn!(
                        "Receipt for {:?} missing on chain {} ({} / {})",
                        tx_hash, chain_id, misses, self.config.dropped_after_misses
                    );
                    if misses >= self.config.dropped_after_misses {
                        return FinalityOutcome::Dropped {
                            reason: format!(
                                "transaction {:?} not found on chain {} in {} consecutive polls",
                                tx_hash, chain_id, misses
                            ),
                        };
                    }
                }
                Ok(DepthCheck::Moved(inclusion)) => {
                    return FinalityOutcome::Dropped {
                        reason: format!(
                            "transaction {:?} now in block {} ({:?}), observed in {:?}",
                            tx_hash, inclusion.block_number, inclusion.block_hash, block_hash
                        ),
                    };
                }
                Err(e) => {
                    // RPC trouble says nothing about the deposit itself
                    warn!("Confirmation check failed on chain {}: {}", chain_id, e);
                }
            }

            if Instant::now() >= deadline {
                return FinalityOutcome::TimedOut { last_depth };
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One confirmation poll
    pub async fn check(
        &self,
        tx_hash: H256,
        block_hash: H256,
        required: u64,
    ) -> RelayerResult<DepthCheck> {
        let Some(inclusion) = self.client.transaction_inclusion(tx_hash).await? else {
            return Ok(DepthCheck::Missing);
        };
        if inclusion.block_hash != block_hash {
            return Ok(DepthCheck::Moved(inclusion));
        }

        let head = self.client.block_number().await?;
        let depth = confirmation_depth(head, inclusion.block_number);
        if depth >= required {
            Ok(DepthCheck::Reached(depth))
        } else {
            Ok(DepthCheck::Waiting(depth))
        }
    }
}

/// Blocks on top of and including the inclusion block
pub fn confirmation_depth(head: u64, inclusion_block: u64) -> u64 {
    if head < inclusion_block {
        0
    } else {
        head - inclusion_block + 1
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Holesky
        17000 => 5,
        // Sepolia
        11155111 => 12,
        // Base and Base Sepolia
        8453 | 84532 => 12,
        // Optimism
        10 | 11155420 => 64,
        // Arbitrum
        42161 | 421614 => 64,
        // Polygon mainnet
        137 => 128,
        // Default conservative
        _ => 64,
    }
}
