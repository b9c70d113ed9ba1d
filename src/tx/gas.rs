//! Gas limits and fee selection

use crate::chain::{ChainProvider, GasPrice};
use crate::error::ExecutorResult;
use crate::quote::StepItem;

use alloy_primitives::U256 as Quantity;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for transactions
#[derive(Debug, Clone)]
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

    /// Apply the limit buffer to a node estimate
    pub fn buffered_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered fees for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> ExecutorResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.buffer_price(gas_price);
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    pub fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }

    /// Summed per-call gas hints plus the batch contract's own overhead.
    /// Calls without a hint count as zero.
    pub fn batch_gas_limit(items: &[StepItem], overhead: u64) -> ExecutorResult<Quantity> {
        let mut total = Quantity::from(overhead);
        for item in items {
            if let Some(gas) = item.transaction().map(|tx| tx.gas_limit()).transpose()?.flatten() {
                total = total.saturating_add(gas);
            }
        }
        Ok(total)
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}
