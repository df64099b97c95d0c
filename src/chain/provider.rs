//! JSON-RPC access to one chain over a rotating set of HTTP endpoints

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Tip added on top of twice the base fee
const PRIORITY_FEE_WEI: u64 = 2_000_000_000;

/// RPC handle for one chain. Reads rotate to the next endpoint when the
/// active one fails; writes go to the active endpoint only.
pub struct ChainProvider {
    config: ChainConfig,
    endpoints: Vec<Provider<Http>>,
    active: AtomicUsize,
    /// Highest head any call has returned, 0 before the first success
    last_block: AtomicU64,
}

impl ChainProvider {
    /// Build the endpoint set. Nothing is contacted here; an unreachable
    /// node only shows up on the first call.
    pub fn new(config: ChainConfig) -> RelayerResult<Self> {
        let endpoints: Vec<Provider<Http>> = config
            .rpc_urls
            .iter()
            .filter_map(|url| match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    debug!("Chain {} endpoint {}", config.chain_id, url);
                    Some(provider.interval(Duration::from_millis(100)))
                }
                Err(e) => {
                    warn!("Skipping RPC URL {} for {}: {}", url, config.name, e);
                    None
                }
            })
            .collect();

        if endpoints.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "no usable RPC URL".to_string(),
            });
        }

        Ok(Self {
            config,
            endpoints,
            active: AtomicUsize::new(0),
            last_block: AtomicU64::new(0),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn endpoint(&self) -> &Provider<Http> {
        &self.endpoints[self.active.load(Ordering::Relaxed) % self.endpoints.len()]
    }

    fn rotate(&self) {
        if self.endpoints.len() > 1 {
            let next = (self.active.fetch_add(1, Ordering::Relaxed) + 1) % self.endpoints.len();
            warn!("{} switching to RPC endpoint #{}", self.config.name, next);
        }
    }

    /// Run a read against each endpoint in turn until one answers
    async fn read<T, F, Fut>(&self, what: &str, call: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();
        for _ in 0..self.endpoints.len() {
            match call(self.endpoint().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} on {} failed: {}", what, self.config.name, e);
                    last_error = e.to_string();
                    self.rotate();
                }
            }
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: format!("{}: {}", what, last_error),
        })
    }

    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        let head = self
            .read("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await?
            .as_u64();
        self.last_block.fetch_max(head, Ordering::Relaxed);
        Ok(head)
    }

    /// Highest head observed so far, without a round trip
    pub fn last_seen_block(&self) -> u64 {
        self.last_block.load(Ordering::Relaxed)
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.read("eth_getTransactionReceipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// `None` once no node in the set knows the transaction, mined or pending
    pub async fn get_transaction(&self, tx_hash: H256) -> RelayerResult<Option<Transaction>> {
        self.read("eth_getTransactionByHash", |p| async move {
            p.get_transaction(tx_hash).await
        })
        .await
    }

    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        self.read("eth_getLogs", |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    /// Pending-inclusive transaction count, i.e. the next usable nonce
    pub async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        self.read("eth_getTransactionCount", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
        .map_err(|e| RelayerError::Nonce {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        })
    }

    pub async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        self.read("eth_getBalance", |p| async move { p.get_balance(address, None).await })
            .await
    }

    /// Estimate gas without failover: a revert here is an answer about the
    /// call, and its text must reach the error classifier intact.
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.endpoint()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))
    }

    /// Broadcast a signed transaction, returning its hash
    pub async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        self.endpoint()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| RelayerError::Transaction(e.to_string()))
    }

    /// Current gas price under the chain's pricing strategy, capped at the
    /// configured ceiling
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        let ceiling = self.max_gas_price();
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .read("eth_gasPrice", |p| async move { p.get_gas_price().await })
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price.min(ceiling)))
            }
            GasPriceStrategy::Eip1559 => {
                let block = self
                    .read("eth_getBlockByNumber", |p| async move {
                        p.get_block(BlockNumber::Latest).await
                    })
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
                let base_fee = block.and_then(|b| b.base_fee_per_gas).ok_or_else(|| {
                    RelayerError::GasEstimation(format!(
                        "{} latest block has no base fee",
                        self.config.name
                    ))
                })?;
                let (max_fee_per_gas, max_priority_fee_per_gas) = eip1559_fees(base_fee, ceiling);
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                })
            }
        }
    }

    /// Configured gas price ceiling in wei
    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::exp10(9)
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("{} (chain {}) unreachable: {}", self.config.name, self.config.chain_id, e);
                false
            }
        }
    }
}

/// Max fee is twice the base fee plus the tip, capped at `ceiling`
fn eip1559_fees(base_fee: U256, ceiling: U256) -> (U256, U256) {
    let tip = U256::from(PRIORITY_FEE_WEI);
    let max_fee = (base_fee * 2u64 + tip).min(ceiling);
    (max_fee, tip.min(max_fee))
}

/// Fee fields for a distribution transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(urls: &[&str]) -> ChainConfig {
        ChainConfig {
            chain_id: 17000,
            name: "holesky".to_string(),
            rpc_urls: urls.iter().map(|u| u.to_string()).collect(),
            bridge_address: "0x57c30655BC162a0B1fB1964057d0Efea3D5E763e".to_string(),
            target_chain_id: 84532,
            required_confirmations: None,
            genesis_block: None,
            gas_price_strategy: GasPriceStrategy::Eip1559,
            max_gas_price_gwei: 50,
            enabled: true,
        }
    }

    #[test]
    fn test_eip1559_fees_capped() {
        let gwei = U256::exp10(9);

        let (max_fee, tip) = eip1559_fees(gwei * 10, gwei * 100);
        assert_eq!(max_fee, gwei * 22);
        assert_eq!(tip, gwei * 2);

        let (max_fee, tip) = eip1559_fees(gwei * 10, gwei);
        assert_eq!(max_fee, gwei);
        assert_eq!(tip, gwei);
    }

    #[test]
    fn test_invalid_urls_skipped() {
        let provider = ChainProvider::new(chain(&["not a url", "http://127.0.0.1:8545"])).unwrap();
        assert_eq!(provider.endpoints.len(), 1);
        assert_eq!(provider.max_gas_price(), U256::from(50) * U256::exp10(9));
        assert_eq!(provider.last_seen_block(), 0);

        assert!(ChainProvider::new(chain(&["not a url"])).is_err());
    }

    #[test]
    fn test_rotate_wraps() {
        let provider =
            ChainProvider::new(chain(&["http://127.0.0.1:1", "http://127.0.0.1:2"])).unwrap();
        provider.rotate();
        provider.rotate();
        provider.rotate();
        assert_eq!(provider.active.load(Ordering::Relaxed) % 2, 1);
    }
}
