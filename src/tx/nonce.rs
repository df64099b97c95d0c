//! Signer nonce management for distribution transactions
//!
//! Handles:
//! - Local nonce tracking so concurrent submissions never collide
//! - Releasing nonces of transactions that never reached the mempool
//! - Resync with the chain after "nonce too low"

use crate::chain::ChainProvider;
use crate::error::{RelayerError, RelayerResult};

use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
struct ChainNonceState {
    /// Next nonce to hand out
    current: u64,
    /// Broadcast but unconfirmed: nonce -> tx hash
    pending: BTreeMap<u64, H256>,
}

/// Manages signer nonces across destination chains
pub struct NonceManager {
    wallet_address: Address,
    chain_state: DashMap<u64, Mutex<ChainNonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet_address
    }

    /// Initialize nonce for a chain from its pending transaction count
    pub async fn init_chain(&self, provider: &ChainProvider) -> RelayerResult<()> {
        let on_chain_nonce = provider.get_transaction_count(self.wallet_address).await?;
        self.set_initial(provider.chain_id(), on_chain_nonce);
        Ok(())
    }

    pub(crate) fn set_initial(&self, chain_id: u64, nonce: u64) {
        let state = ChainNonceState {
            current: nonce,
            pending: BTreeMap::new(),
        };
        self.chain_state.insert(chain_id, Mutex::new(state));
        debug!("Initialized nonce for chain {}: {}", chain_id, nonce);
    }

    pub fn is_initialized(&self, chain_id: u64) -> bool {
        self.chain_state.contains_key(&chain_id)
    }

    fn not_initialized(chain_id: u64) -> RelayerError {
        RelayerError::Nonce {
            chain_id,
            message: "Chain not initialized".to_string(),
        }
    }

    /// Get the next nonce for a chain
    pub async fn get_nonce(&self, chain_id: u64) -> RelayerResult<u64> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Mark a nonce as pending with transaction hash
    pub async fn mark_pending(&self, chain_id: u64, nonce: u64, tx_hash: H256) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        state.lock().await.pending.insert(nonce, tx_hash);
        Ok(())
    }

    /// Forget a mined transaction
    pub async fn confirm(&self, chain_id: u64, tx_hash: H256) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        state.lock().await.pending.retain(|_, hash| *hash != tx_hash);
        Ok(())
    }

    /// Release a nonce whose transaction never reached the mempool
    pub async fn release_nonce(&self, chain_id: u64, nonce: u64) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed out again
        if state.current.checked_sub(1) == Some(nonce) {
            state.current = nonce;
        }
        Ok(())
    }

    /// Forget a broadcast the node dropped without mining it. The next
    /// nonce falls back to the chain's count, but never below a later
    /// broadcast that is still outstanding.
    pub async fn drop_pending(&self, provider: &ChainProvider, tx_hash: H256) -> RelayerResult<()> {
        let on_chain_nonce = provider.get_transaction_count(self.wallet_address).await?;
        self.apply_dropped(provider.chain_id(), tx_hash, on_chain_nonce)
            .await
    }

    pub(crate) async fn apply_dropped(
        &self,
        chain_id: u64,
        tx_hash: H256,
        on_chain_nonce: u64,
    ) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        state.pending.retain(|_, hash| *hash != tx_hash);

        let floor = state
            .pending
            .keys()
            .next_back()
            .map_or(on_chain_nonce, |highest| on_chain_nonce.max(highest + 1));
        if floor < state.current {
            warn!(
                "Rewinding nonce on chain {} from {} to {} after dropped tx {:?}",
                chain_id, state.current, floor, tx_hash
            );
            state.current = floor;
        }
        Ok(())
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> RelayerResult<()> {
        let chain_id = provider.chain_id();
        let on_chain_nonce = provider.get_transaction_count(self.wallet_address).await?;
        self.apply_chain_nonce(chain_id, on_chain_nonce).await
    }

    pub(crate) async fn apply_chain_nonce(&self, chain_id: u64, on_chain_nonce: u64) -> RelayerResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;

        if on_chain_nonce > state.current {
            warn!(
                "Nonce gap detected on chain {}: local {}, chain {}",
                chain_id, state.current, on_chain_nonce
            );
            state.current = on_chain_nonce;
        }

        // Anything below the chain nonce has been mined or replaced
        state.pending = state.pending.split_off(&on_chain_nonce);
        Ok(())
    }

    pub async fn pending_count(&self, chain_id: u64) -> usize {
        match self.chain_state.get(&chain_id) {
            Some(state) => state.lock().await.pending.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_and_release() {
        let manager = NonceManager::new(Address::zero());
        manager.set_initial(8453, 10);

        assert_eq!(manager.get_nonce(8453).await.unwrap(), 10);
        assert_eq!(manager.get_nonce(8453).await.unwrap(), 11);

        // An older nonce cannot be reclaimed once a newer one is out
        manager.release_nonce(8453, 10).await.unwrap();
        assert_eq!(manager.get_nonce(8453).await.unwrap(), 12);

        manager.release_nonce(8453, 12).await.unwrap();
        assert_eq!(manager.get_nonce(8453).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_resync_clears_mined() {
        let manager = NonceManager::new(Address::zero());
        manager.set_initial(8453, 0);
        for _ in 0..3 {
            let nonce = manager.get_nonce(8453).await.unwrap();
            manager
                .mark_pending(8453, nonce, H256::from_low_u64_be(nonce))
                .await
                .unwrap();
        }
        assert_eq!(manager.pending_count(8453).await, 3);

        manager.apply_chain_nonce(8453, 2).await.unwrap();
        assert_eq!(manager.pending_count(8453).await, 1);

        manager.apply_chain_nonce(8453, 7).await.unwrap();
        assert_eq!(manager.get_nonce(8453).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_tx_rewinds_nonce() {
        let manager = NonceManager::new(Address::zero());
        manager.set_initial(8453, 4);
        let dropped = H256::repeat_byte(0x04);
        let nonce = manager.get_nonce(8453).await.unwrap();
        manager.mark_pending(8453, nonce, dropped).await.unwrap();

        manager.apply_dropped(8453, dropped, 4).await.unwrap();
        assert_eq!(manager.pending_count(8453).await, 0);
        assert_eq!(manager.get_nonce(8453).await.unwrap(), 4);

        // A later broadcast still in the mempool keeps its nonce reserved
        let lost = H256::repeat_byte(0x14);
        manager.mark_pending(8453, 4, lost).await.unwrap();
        let nonce = manager.get_nonce(8453).await.unwrap();
        manager.mark_pending(8453, nonce, H256::repeat_byte(0x15)).await.unwrap();
        manager.apply_dropped(8453, lost, 4).await.unwrap();
        assert_eq!(manager.get_nonce(8453).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_uninitialized_chain() {
        let manager = NonceManager::new(Address::zero());
        assert!(matches!(
            manager.get_nonce(1).await,
            Err(RelayerError::Nonce { chain_id: 1, .. })
        ));
    }
}
