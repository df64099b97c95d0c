//! In-process ledger used by tests and dry runs

use super::models::*;
use super::Ledger;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{H256, U256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::warn;

/// Ledger held entirely in memory. Enforces the same invariants as
/// [`super::PgLedger`].
#[derive(Default)]
pub struct MemoryLedger {
    deposits: RwLock<BTreeMap<(u64, U256), Deposit>>,
    chains: RwLock<HashMap<u64, ChainMetadata>>,
    tokens: RwLock<Vec<SupportedToken>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_deposit(&self, deposit: &NewDeposit) -> RelayerResult<RecordOutcome> {
        let mut deposits = self.deposits.write().await;
        let key = (deposit.source_chain, deposit.nonce);

        if let Some(existing) = deposits.get(&key) {
            if existing.deposit_tx_hash != deposit.deposit_tx_hash {
                warn!(
                    source_chain = deposit.source_chain,
                    nonce = %deposit.nonce,
                    "Nonce already recorded under a different transaction"
                );
            }
            return Ok(RecordOutcome {
                deposit: existing.clone(),
                created: false,
            });
        }

        let record = Deposit::pending(deposit, Utc::now());
        deposits.insert(key, record.clone());
        Ok(RecordOutcome {
            deposit: record,
            created: true,
        })
    }

    async fn get_deposit(&self, source_chain: u64, nonce: U256) -> RelayerResult<Option<Deposit>> {
        Ok(self.deposits.read().await.get(&(source_chain, nonce)).cloned())
    }

    async fn list_deposits(&self, query: &DepositQuery) -> RelayerResult<Vec<Deposit>> {
        let deposits = self.deposits.read().await;
        Ok(deposits
            .values()
            .filter(|d| query.status.map_or(true, |s| d.status == s))
            .filter(|d| query.source_chain.map_or(true, |c| d.source_chain == c))
            .take(query.limit() as usize)
            .cloned()
            .collect())
    }

    async fn list_unfinished(&self) -> RelayerResult<Vec<Deposit>> {
        let deposits = self.deposits.read().await;
        let mut unfinished: Vec<Deposit> = deposits
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|d| (d.source_chain, d.target_chain, d.nonce));
        Ok(unfinished)
    }

    async fn lowest_open_nonce(
        &self,
        source_chain: u64,
        target_chain: u64,
    ) -> RelayerResult<Option<U256>> {
        let deposits = self.deposits.read().await;
        Ok(deposits
            .range((source_chain, U256::zero())..=(source_chain, U256::MAX))
            .map(|(_, d)| d)
            .find(|d| d.target_chain == target_chain && !d.status.is_terminal())
            .map(|d| d.nonce))
    }

    async fn update_confirmations(
        &self,
        source_chain: u64,
        nonce: U256,
        confirmations: u64,
    ) -> RelayerResult<()> {
        let mut deposits = self.deposits.write().await;
        let deposit = deposits
            .get_mut(&(source_chain, nonce))
            .ok_or_else(|| RelayerError::DepositNotFound {
                source_chain,
                nonce: nonce.to_string(),
            })?;
        deposit.confirmations = confirmations;
        deposit.updated_at = Utc::now();
        Ok(())
    }

    async fn transition(
        &self,
        source_chain: u64,
        nonce: U256,
        to: DepositStatus,
        update: StatusUpdate,
    ) -> RelayerResult<Deposit> {
        let mut deposits = self.deposits.write().await;
        let deposit = deposits
            .get_mut(&(source_chain, nonce))
            .ok_or_else(|| RelayerError::DepositNotFound {
                source_chain,
                nonce: nonce.to_string(),
            })?;

        if !deposit.status.can_transition_to(to) {
            return Err(RelayerError::InvalidStateTransition {
                from: deposit.status.to_string(),
                to: to.to_string(),
            });
        }

        deposit.status = to;
        if let Some(hash) = update.distribution_tx_hash {
            deposit.distribution_tx_hash = Some(hash);
        }
        if let Some(reason) = update.failure_reason {
            deposit.failure_reason = Some(reason);
        }
        if let Some(confirmations) = update.confirmations {
            deposit.confirmations = confirmations;
        }
        deposit.updated_at = Utc::now();

        Ok(deposit.clone())
    }

    async fn record_distribution_tx(
        &self,
        source_chain: u64,
        nonce: U256,
        tx_hash: Option<H256>,
    ) -> RelayerResult<()> {
        let mut deposits = self.deposits.write().await;
        match deposits.get_mut(&(source_chain, nonce)) {
            Some(deposit) if deposit.status == DepositStatus::Distributing => {
                deposit.distribution_tx_hash = tx_hash;
                deposit.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(RelayerError::DepositNotFound {
                source_chain,
                nonce: nonce.to_string(),
            }),
        }
    }

    async fn get_chain_metadata(&self, chain_id: u64) -> RelayerResult<Option<ChainMetadata>> {
        Ok(self.chains.read().await.get(&chain_id).cloned())
    }

    async fn list_chain_metadata(&self) -> RelayerResult<Vec<ChainMetadata>> {
        let mut chains: Vec<ChainMetadata> = self.chains.read().await.values().cloned().collect();
        chains.sort_by_key(|c| c.chain_id);
        Ok(chains)
    }

    async fn register_chain(
        &self,
        chain_id: u64,
        required_confirmations: u64,
    ) -> RelayerResult<ChainMetadata> {
        let mut chains = self.chains.write().await;
        let entry = chains.entry(chain_id).or_insert_with(|| ChainMetadata {
            chain_id,
            last_block_scanned: None,
            required_confirmations,
            is_active: true,
            updated_at: Utc::now(),
        });
        entry.required_confirmations = required_confirmations;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn advance_cursor(
        &self,
        chain_id: u64,
        scanned_from: Option<u64>,
        block_number: u64,
    ) -> RelayerResult<Option<u64>> {
        let mut chains = self.chains.write().await;
        let meta = chains
            .get_mut(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })?;

        if meta.last_block_scanned != scanned_from {
            return Ok(meta.last_block_scanned);
        }
        let next = meta
            .last_block_scanned
            .map_or(block_number, |current| current.max(block_number));
        meta.last_block_scanned = Some(next);
        meta.updated_at = Utc::now();
        Ok(Some(next))
    }

    async fn set_cursor(
        &self,
        chain_id: u64,
        block_number: Option<u64>,
    ) -> RelayerResult<ChainMetadata> {
        let mut chains = self.chains.write().await;
        let meta = chains
            .get_mut(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })?;
        meta.last_block_scanned = block_number;
        meta.updated_at = Utc::now();
        Ok(meta.clone())
    }

    async fn set_chain_active(&self, chain_id: u64, active: bool) -> RelayerResult<ChainMetadata> {
        let mut chains = self.chains.write().await;
        let meta = chains
            .get_mut(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })?;
        meta.is_active = active;
        meta.updated_at = Utc::now();
        Ok(meta.clone())
    }

    async fn upsert_supported_token(&self, token: &SupportedToken) -> RelayerResult<()> {
        let mut tokens = self.tokens.write().await;
        match tokens
            .iter_mut()
            .find(|t| t.chain_id == token.chain_id && t.token_address == token.token_address)
        {
            Some(existing) => *existing = token.clone(),
            None => tokens.push(token.clone()),
        }
        Ok(())
    }

    async fn list_supported_tokens(
        &self,
        chain_id: Option<u64>,
    ) -> RelayerResult<Vec<SupportedToken>> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .iter()
            .filter(|t| chain_id.map_or(true, |c| t.chain_id == c))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> RelayerResult<DepositStats> {
        let deposits = self.deposits.read().await;
        let mut stats = DepositStats::default();
        for deposit in deposits.values() {
            match deposit.status {
                DepositStatus::Pending => stats.pending += 1,
                DepositStatus::Confirmed => stats.confirmed += 1,
                DepositStatus::Distributing => stats.distributing += 1,
                DepositStatus::Completed => stats.completed += 1,
                DepositStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
