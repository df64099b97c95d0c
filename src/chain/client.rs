//! The chain seam used by watchers, trackers and executors

use super::ChainProvider;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{DepositObserved, DistributionCall, EventParser};
use crate::tx::retry::{classify_error, ErrorClass};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::types::H256;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Where a transaction was mined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inclusion {
    pub block_number: u64,
    pub block_hash: H256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionReceipt {
    pub success: bool,
    pub block_number: u64,
}

/// Why a `distribute` submission did not reach the mempool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("nonce already distributed on the destination bridge")]
    AlreadyDistributed,

    #[error("rejected: {0}")]
    Structural(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl SubmitError {
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorClass::AlreadyDistributed => SubmitError::AlreadyDistributed,
            ErrorClass::Structural => SubmitError::Structural(message),
            ErrorClass::NonceTooLow | ErrorClass::Transient => SubmitError::Transient(message),
        }
    }
}

impl From<RelayerError> for SubmitError {
    fn from(err: RelayerError) -> Self {
        match err {
            // These carry node or revert text worth classifying
            RelayerError::GasEstimation(_) | RelayerError::Transaction(_) => {
                SubmitError::from_message(err.to_string())
            }
            other if other.is_retryable() => SubmitError::Transient(other.to_string()),
            other => SubmitError::from_message(other.to_string()),
        }
    }
}

/// Everything the relay engine needs from one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> RelayerResult<u64>;

    /// Bridge deposits in an inclusive block range, in log order
    async fn deposit_logs(&self, from_block: u64, to_block: u64)
        -> RelayerResult<Vec<DepositObserved>>;

    /// `None` when the chain no longer knows the transaction
    async fn transaction_inclusion(&self, tx_hash: H256) -> RelayerResult<Option<Inclusion>>;

    /// Sign and broadcast a `distribute` call
    async fn send_distribution(&self, call: &DistributionCall) -> Result<H256, SubmitError>;

    async fn distribution_receipt(&self, tx_hash: H256)
        -> RelayerResult<Option<DistributionReceipt>>;

    /// Whether the node still knows a broadcast distribution, mined or in
    /// the mempool. `false` means it is gone and may be sent again.
    async fn distribution_known(&self, tx_hash: H256) -> RelayerResult<bool>;
}

/// [`ChainClient`] over an EVM JSON-RPC provider
pub struct EvmChainClient {
    provider: Arc<ChainProvider>,
    parser: EventParser,
    sender: Arc<TransactionSender>,
}

impl EvmChainClient {
    pub fn new(
        provider: Arc<ChainProvider>,
        parser: EventParser,
        sender: Arc<TransactionSender>,
    ) -> Self {
        Self {
            provider,
            parser,
            sender,
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        self.provider.get_block_number().await
    }

    async fn deposit_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<DepositObserved>> {
        let filter = self.parser.deposit_filter(from_block, to_block);
        let logs = self.provider.get_logs(&filter).await?;
        self.parser.parse_logs(logs)
    }

    async fn transaction_inclusion(&self, tx_hash: H256) -> RelayerResult<Option<Inclusion>> {
        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        Ok(receipt.and_then(|r| match (r.block_number, r.block_hash) {
            (Some(number), Some(hash)) => Some(Inclusion {
                block_number: number.as_u64(),
                block_hash: hash,
            }),
            _ => None,
        }))
    }

    async fn send_distribution(&self, call: &DistributionCall) -> Result<H256, SubmitError> {
        self.sender.send_distribution(call).await
    }

    async fn distribution_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<DistributionReceipt>> {
        let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        self.sender.confirm(tx_hash).await;
        Ok(Some(DistributionReceipt {
            success: receipt.status == Some(1.into()),
            block_number: block_number.as_u64(),
        }))
    }

    async fn distribution_known(&self, tx_hash: H256) -> RelayerResult<bool> {
        if self.provider.get_transaction(tx_hash).await?.is_some() {
            return Ok(true);
        }
        warn!(
            chain_id = self.chain_id(),
            tx_hash = ?tx_hash,
            "Distribution dropped from the mempool"
        );
        self.sender.forget(tx_hash).await;
        Ok(false)
    }
}
