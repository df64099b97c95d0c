//! Gas estimation for distribution transactions

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Estimate the gas limit of `tx`. Also serves as the revert preflight:
    /// a call the bridge would reject fails here with the revert reason.
    pub async fn estimate_gas_limit(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> RelayerResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(with_buffer(estimate, self.gas_limit_buffer_percent))
    }

    /// Get buffered gas price for a chain, never above the configured ceiling
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> RelayerResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.buffer_price(gas_price, provider.max_gas_price());

        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, price: GasPrice, ceiling: U256) -> GasPrice {
        let pct = self.gas_price_buffer_percent;
        match price {
            GasPrice::Legacy(price) => GasPrice::Legacy(with_buffer(price, pct).min(ceiling)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = with_buffer(max_fee_per_gas, pct).min(ceiling);
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: with_buffer(max_priority_fee_per_gas, pct)
                        .min(max_fee),
                }
            }
        }
    }

    /// Worst-case cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn with_buffer(value: U256, percent: u64) -> U256 {
    value + value * percent / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_buffer_respects_ceiling() {
        let estimator = GasEstimator::new();
        let gwei = U256::exp10(9);

        let price = estimator.buffer_price(GasPrice::Legacy(gwei * 10), gwei * 100);
        assert_eq!(price, GasPrice::Legacy(gwei * 11));

        let price = estimator.buffer_price(GasPrice::Legacy(gwei * 95), gwei * 100);
        assert_eq!(price, GasPrice::Legacy(gwei * 100));

        let price = estimator.buffer_price(
            GasPrice::Eip1559 {
                max_fee_per_gas: gwei * 20,
                max_priority_fee_per_gas: gwei * 2,
            },
            gwei * 100,
        );
        assert_eq!(
            price,
            GasPrice::Eip1559 {
                max_fee_per_gas: gwei * 22,
                max_priority_fee_per_gas: U256::from(2_200_000_000u64),
            }
        );
    }

    #[test]
    fn test_cost() {
        let cost = GasEstimator::calculate_cost(U256::from(100_000), &GasPrice::Legacy(U256::from(5)));
        assert_eq!(cost, U256::from(500_000));
    }
}
