//! Gas estimation with safety margins and a per-chain price cap

use crate::chain::adapter::{ChainAdapter, GasPrice, ReleaseCall};
use crate::config::GasConfig;
use crate::error::RelayerResult;

use ethers::types::U256;
use tracing::{debug, warn};

const GWEI: u64 = 1_000_000_000;

/// Gas estimator for release transactions
pub struct GasEstimator {
    /// Fixed gas limit, skipping estimation
    fixed_limit: Option<u64>,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    max_gas_price: U256,
}

impl GasEstimator {
    pub fn new(config: &GasConfig) -> Self {
        let max_gas_price = U256::from(config.max_gas_price_gwei) * U256::from(GWEI);
        Self {
            fixed_limit: config.gas_limit,
            gas_limit_buffer_percent: config.limit_buffer_percent,
            gas_price_buffer_percent: config.price_buffer_percent,
            max_gas_price,
        }
    }

    /// Estimated gas limit for a release call plus the configured margin.
    ///
    /// Estimation simulates the call, so a destination-side "already
    /// processed" revert surfaces here as `AlreadyProcessed`.
    pub async fn estimate_limit(
        &self,
        adapter: &dyn ChainAdapter,
        call: &ReleaseCall,
    ) -> RelayerResult<U256> {
        let estimated = adapter.estimate_release_gas(call).await?;
        if let Some(fixed) = self.fixed_limit {
            return Ok(U256::from(fixed));
        }
        let limit = estimated + estimated * self.gas_limit_buffer_percent / 100;
        debug!(
            "Gas limit for {} on chain {}: {} (estimated {})",
            call.transfer_id,
            adapter.chain_id(),
            limit,
            estimated
        );
        Ok(limit)
    }

    /// Current gas price plus margin, capped at the chain's maximum
    pub async fn price(&self, adapter: &dyn ChainAdapter) -> RelayerResult<GasPrice> {
        let quoted = adapter.gas_price().await?;
        let buffered = self.apply(&quoted);
        debug!("Gas price for chain {}: {:?}", adapter.chain_id(), buffered);
        Ok(buffered)
    }

    fn apply(&self, quoted: &GasPrice) -> GasPrice {
        let bump = |value: U256| value + value * self.gas_price_buffer_percent / 100;
        let cap = |value: U256| {
            if value > self.max_gas_price {
                warn!(
                    "Gas price {} above cap {}, clamping",
                    value, self.max_gas_price
                );
                self.max_gas_price
            } else {
                value
            }
        };

        match quoted {
            GasPrice::Legacy(price) => GasPrice::Legacy(cap(bump(*price))),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = cap(bump(*max_fee_per_gas));
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: bump(*max_priority_fee_per_gas).min(max_fee),
                }
            }
        }
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}
