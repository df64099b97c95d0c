//! Signs and broadcasts `distribute` transactions on one destination chain

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use super::retry::{classify_error, ErrorClass};
use crate::chain::{ChainProvider, GasPrice, SubmitError};
use crate::error::{RelayerError, RelayerResult};
use crate::events::DistributionCall;

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Transaction sender for a single destination bridge
pub struct TransactionSender {
    provider: Arc<ChainProvider>,
    nonce_manager: Arc<NonceManager>,
    gas_estimator: GasEstimator,
    /// Wallet bound to this chain's id
    wallet: LocalWallet,
    bridge_address: Address,
}

impl TransactionSender {
    pub fn new(
        provider: Arc<ChainProvider>,
        nonce_manager: Arc<NonceManager>,
        wallet: LocalWallet,
        bridge_address: Address,
    ) -> Self {
        let wallet = wallet.with_chain_id(provider.chain_id());
        Self {
            provider,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            bridge_address,
        }
    }

    /// Parse the signer credential
    pub fn load_wallet(private_key: &str) -> RelayerResult<LocalWallet> {
        private_key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
    }

    /// Build, sign and broadcast a `distribute` call. One attempt; the
    /// caller owns retries.
    pub async fn send_distribution(&self, call: &DistributionCall) -> Result<H256, SubmitError> {
        let chain_id = self.provider.chain_id();
        let data = call.calldata();

        // Estimation doubles as the revert preflight
        let draft = self.build_tx(data.clone(), None, None, None);
        let gas_limit = self
            .gas_estimator
            .estimate_gas_limit(&self.provider, &draft)
            .await?;
        let gas_price = self.gas_estimator.get_gas_price(&self.provider).await?;

        self.ensure_balance(gas_limit, &gas_price).await?;

        let nonce = self.next_nonce().await?;
        let tx = self.build_tx(data, Some(nonce), Some(gas_limit), Some(&gas_price));

        match self.sign_and_send(tx).await {
            Ok(tx_hash) => {
                if let Err(e) = self.nonce_manager.mark_pending(chain_id, nonce, tx_hash).await {
                    warn!("Could not track nonce {} on chain {}: {}", nonce, chain_id, e);
                }
                crate::metrics::record_tx_submitted(chain_id);
                info!(
                    chain_id,
                    nonce = %call.nonce,
                    tx_hash = ?tx_hash,
                    "Distribution broadcast"
                );
                Ok(tx_hash)
            }
            Err(message) => {
                if let Err(e) = self.nonce_manager.release_nonce(chain_id, nonce).await {
                    warn!("Could not release nonce {} on chain {}: {}", nonce, chain_id, e);
                }
                if classify_error(&message) == ErrorClass::NonceTooLow {
                    warn!("Nonce too low on chain {}, syncing", chain_id);
                    if let Err(e) = self.nonce_manager.sync(&self.provider).await {
                        warn!("Nonce sync failed on chain {}: {}", chain_id, e);
                    }
                }
                Err(SubmitError::from_message(message))
            }
        }
    }

    /// Forget the nonce of a mined transaction
    pub async fn confirm(&self, tx_hash: H256) {
        if let Err(e) = self
            .nonce_manager
            .confirm(self.provider.chain_id(), tx_hash)
            .await
        {
            debug!("Nonce confirm skipped: {}", e);
        }
    }

    /// Release the nonce of a broadcast no node knows any more
    pub async fn forget(&self, tx_hash: H256) {
        if let Err(e) = self
            .nonce_manager
            .drop_pending(&self.provider, tx_hash)
            .await
        {
            warn!("Nonce rewind after dropped tx {:?} failed: {}", tx_hash, e);
        }
    }

    async fn next_nonce(&self) -> RelayerResult<u64> {
        let chain_id = self.provider.chain_id();
        if !self.nonce_manager.is_initialized(chain_id) {
            self.nonce_manager.init_chain(&self.provider).await?;
        }
        self.nonce_manager.get_nonce(chain_id).await
    }

    async fn ensure_balance(&self, gas_limit: U256, gas_price: &GasPrice) -> RelayerResult<()> {
        let need = GasEstimator::calculate_cost(gas_limit, gas_price);
        let have = self.provider.get_balance(self.wallet.address()).await?;
        if have < need {
            let err = RelayerError::InsufficientBalance {
                chain_id: self.provider.chain_id(),
                have: have.to_string(),
                need: need.to_string(),
            };
            error!(alert = err.should_alert(), "{}", err);
            return Err(err);
        }
        Ok(())
    }

    fn build_tx(
        &self,
        data: Bytes,
        nonce: Option<u64>,
        gas_limit: Option<U256>,
        gas_price: Option<&GasPrice>,
    ) -> TypedTransaction {
        match gas_price {
            Some(GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }) => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(self.bridge_address)
                    .data(data)
                    .chain_id(self.provider.chain_id())
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas);
                if let Some(nonce) = nonce {
                    tx = tx.nonce(nonce);
                }
                if let Some(gas) = gas_limit {
                    tx = tx.gas(gas);
                }
                TypedTransaction::Eip1559(tx)
            }
            other => {
                let mut tx = TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(self.bridge_address)
                    .data(data)
                    .chain_id(self.provider.chain_id());
                if let Some(GasPrice::Legacy(price)) = other {
                    tx = tx.gas_price(*price);
                }
                if let Some(nonce) = nonce {
                    tx = tx.nonce(nonce);
                }
                if let Some(gas) = gas_limit {
                    tx = tx.gas(gas);
                }
                TypedTransaction::Legacy(tx)
            }
        }
    }

    /// Returns the raw error text on failure so it can be classified
    async fn sign_and_send(&self, tx: TypedTransaction) -> Result<H256, String> {
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()).to_string())?;
        let raw = tx.rlp_signed(&signature);

        match timeout(SEND_TIMEOUT, self.provider.send_raw_transaction(raw)).await {
            Ok(Ok(tx_hash)) => Ok(tx_hash),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(RelayerError::Timeout {
                operation: "send transaction".to_string(),
            }
            .to_string()),
        }
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development key, never funded on a real network
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_load_wallet() {
        let wallet = TransactionSender::load_wallet(DEV_KEY).unwrap();
        assert_eq!(
            wallet.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse::<Address>()
                .unwrap()
        );
        assert!(matches!(
            TransactionSender::load_wallet("not-a-key"),
            Err(RelayerError::Wallet(_))
        ));
    }
}
