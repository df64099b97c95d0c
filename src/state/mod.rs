//! Ledger: the persistent record of deposits and chain scan cursors
//!
//! Handles:
//! - Idempotent deposit recording keyed by (source chain, nonce)
//! - Monotonic status transitions
//! - Per-chain scan cursors for restart recovery
//! - Supported token reference data
//!
//! Every invariant lives behind the [`Ledger`] trait so callers cannot
//! bypass it.

mod manager;
mod memory;
mod models;

pub use manager::PgLedger;
pub use memory::MemoryLedger;
pub use models::*;

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::{H256, U256};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Record an observed deposit. Re-recording an existing (source chain,
    /// nonce) returns the stored record unchanged.
    async fn record_deposit(&self, deposit: &NewDeposit) -> RelayerResult<RecordOutcome>;

    async fn get_deposit(&self, source_chain: u64, nonce: U256) -> RelayerResult<Option<Deposit>>;

    /// Deposits matching a filter, ordered by source chain then nonce
    async fn list_deposits(&self, query: &DepositQuery) -> RelayerResult<Vec<Deposit>>;

    /// Every non-terminal deposit, ordered by (source, target, nonce)
    async fn list_unfinished(&self) -> RelayerResult<Vec<Deposit>>;

    /// Lowest nonce of a (source, target) pair that is not yet completed
    /// or failed
    async fn lowest_open_nonce(
        &self,
        source_chain: u64,
        target_chain: u64,
    ) -> RelayerResult<Option<U256>>;

    async fn update_confirmations(
        &self,
        source_chain: u64,
        nonce: U256,
        confirmations: u64,
    ) -> RelayerResult<()>;

    /// Move a deposit forward in its lifecycle. Fails with
    /// `InvalidStateTransition` when the move would not be monotonic.
    async fn transition(
        &self,
        source_chain: u64,
        nonce: U256,
        to: DepositStatus,
        update: StatusUpdate,
    ) -> RelayerResult<Deposit>;

    /// Remember a broadcast distribution transaction before its receipt
    /// exists. `None` clears a hash whose transaction reverted or vanished.
    async fn record_distribution_tx(
        &self,
        source_chain: u64,
        nonce: U256,
        tx_hash: Option<H256>,
    ) -> RelayerResult<()>;

    async fn get_chain_metadata(&self, chain_id: u64) -> RelayerResult<Option<ChainMetadata>>;

    async fn list_chain_metadata(&self) -> RelayerResult<Vec<ChainMetadata>>;

    /// Create the metadata row for a chain or refresh its required depth.
    /// Never touches an existing cursor or active flag.
    async fn register_chain(
        &self,
        chain_id: u64,
        required_confirmations: u64,
    ) -> RelayerResult<ChainMetadata>;

    /// Move the cursor from `scanned_from` to `block_number`. Leaves it
    /// unchanged when the stored cursor no longer equals `scanned_from`
    /// (an operator repaired it mid-scan) or when the move would go
    /// backwards. Returns the stored cursor.
    async fn advance_cursor(
        &self,
        chain_id: u64,
        scanned_from: Option<u64>,
        block_number: u64,
    ) -> RelayerResult<Option<u64>>;

    /// Operator cursor repair, the only way to move a cursor backwards
    async fn set_cursor(
        &self,
        chain_id: u64,
        block_number: Option<u64>,
    ) -> RelayerResult<ChainMetadata>;

    async fn set_chain_active(&self, chain_id: u64, active: bool) -> RelayerResult<ChainMetadata>;

    async fn upsert_supported_token(&self, token: &SupportedToken) -> RelayerResult<()>;

    async fn list_supported_tokens(&self, chain_id: Option<u64>)
        -> RelayerResult<Vec<SupportedToken>>;

    async fn stats(&self) -> RelayerResult<DepositStats>;

    async fn health_check(&self) -> RelayerResult<()>;
}
