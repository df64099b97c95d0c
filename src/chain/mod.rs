//! Chain module - connections, deposit scanning and finality
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - The [`ChainClient`] seam the relay engine talks through
//! - Bounded-range deposit scanning with persisted cursors
//! - Confirmation depth tracking with reorg eviction

pub mod client;
pub mod finality;
pub mod provider;
pub mod watcher;

pub use client::{ChainClient, DistributionReceipt, EvmChainClient, Inclusion, SubmitError};
#[cfg(test)]
pub use client::MockChainClient;
pub use finality::{ConfirmationTracker, FinalityOutcome, TrackerConfig};
pub use provider::{ChainProvider, GasPrice};
pub use watcher::{ChainWatcher, WatcherConfig, WatcherMessage};

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::events::EventParser;
use crate::tx::{NonceManager, TransactionSender};

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use tracing::info;

/// Manages connections to all configured chains
pub struct ChainManager {
    providers: DashMap<u64, Arc<ChainProvider>>,
    clients: DashMap<u64, Arc<EvmChainClient>>,
    nonce_manager: Arc<NonceManager>,
}

impl ChainManager {
    /// Connect every enabled chain. The one signer is shared by all
    /// destination chains.
    pub fn new(settings: &Settings, wallet: LocalWallet) -> RelayerResult<Self> {
        let providers = DashMap::new();
        let clients = DashMap::new();
        let nonce_manager = Arc::new(NonceManager::new(wallet.address()));

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );

            let bridge_address = chain_config
                .bridge_address()
                .map_err(|e| RelayerError::Config(e.to_string()))?;

            let provider = Arc::new(ChainProvider::new(chain_config.clone())?);
            providers.insert(chain_config.chain_id, provider.clone());

            let sender = Arc::new(TransactionSender::new(
                provider.clone(),
                nonce_manager.clone(),
                wallet.clone(),
                bridge_address,
            ));
            let parser = EventParser::new(chain_config.chain_id, bridge_address);
            let client = EvmChainClient::new(provider, parser, sender);
            clients.insert(chain_config.chain_id, Arc::new(client));
        }

        info!("Relayer signer: {:?}", wallet.address());

        Ok(Self {
            providers,
            clients,
            nonce_manager,
        })
    }

    /// Get the relay-engine client for a chain
    pub fn get_client(&self, chain_id: u64) -> RelayerResult<Arc<dyn ChainClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone() as Arc<dyn ChainClient>)
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let providers: Vec<Arc<ChainProvider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();

        let mut results = Vec::with_capacity(providers.len());
        for provider in providers {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(provider.chain_id(), healthy);
            results.push((provider.chain_id(), healthy));
        }
        results.sort_by_key(|(chain_id, _)| *chain_id);
        results
    }

    /// Last head seen per chain, without a network round trip
    pub fn last_seen_blocks(&self) -> Vec<(u64, u64)> {
        let mut blocks: Vec<(u64, u64)> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().last_seen_block()))
            .collect();
        blocks.sort_by_key(|(chain_id, _)| *chain_id);
        blocks
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.providers.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }

    /// Signer transactions broadcast but not yet mined, per chain
    pub async fn pending_signer_txs(&self) -> Vec<(u64, usize)> {
        let mut pending = Vec::new();
        for chain_id in self.connected_chains() {
            pending.push((chain_id, self.nonce_manager.pending_count(chain_id).await));
        }
        pending
    }

    pub fn signer_address(&self) -> ethers::types::Address {
        self.nonce_manager.wallet_address()
    }
}
