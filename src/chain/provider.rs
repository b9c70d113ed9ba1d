//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{ExecutorError, ExecutorResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    pub fn new(config: ChainConfig) -> ExecutorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(ExecutorError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run `op` against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, what: &str, op: F) -> ExecutorResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::from("no providers");
        for _ in 0..self.http_providers.len() {
            match op(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} failed on chain {}: {}", what, self.config.chain_id, e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(ExecutorError::ChainConnection {
            chain_id: self.config.chain_id,
            message: format!("{}: all providers failed ({})", what, last_error),
        })
    }

    pub async fn get_block_number(&self) -> ExecutorResult<u64> {
        self.with_failover("get_block_number", |p| async move { p.get_block_number().await })
            .await
            .map(|b| b.as_u64())
    }

    /// Block with full transaction bodies, used for replacement scans
    pub async fn get_block_with_txs(&self, number: u64) -> ExecutorResult<Option<Block<Transaction>>> {
        self.with_failover("get_block_with_txs", |p| async move {
            p.get_block_with_txs(number).await
        })
        .await
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> ExecutorResult<Option<TransactionReceipt>> {
        self.with_failover("get_transaction_receipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Transaction body as the node sees it, mined or pending
    pub async fn get_transaction(&self, tx_hash: H256) -> ExecutorResult<Option<Transaction>> {
        self.with_failover("get_transaction", |p| async move { p.get_transaction(tx_hash).await })
            .await
    }

    /// Nonce including pending transactions
    pub async fn get_transaction_count(&self, address: Address) -> ExecutorResult<u64> {
        self.with_failover("get_transaction_count", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
    }

    /// Nonce as of the latest mined block
    pub async fn get_mined_transaction_count(&self, address: Address) -> ExecutorResult<u64> {
        self.with_failover("get_transaction_count", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Latest.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
    }

    pub async fn get_balance(&self, address: Address) -> ExecutorResult<U256> {
        self.with_failover("get_balance", |p| async move { p.get_balance(address, None).await })
            .await
    }

    pub async fn get_code(&self, address: Address) -> ExecutorResult<Bytes> {
        self.with_failover("get_code", |p| async move { p.get_code(address, None).await })
            .await
    }

    pub async fn call(&self, tx: &TypedTransaction) -> ExecutorResult<Bytes> {
        self.with_failover("eth_call", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }

    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> ExecutorResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| ExecutorError::ChainConnection {
                chain_id: self.config.chain_id,
                message: format!("gas estimation failed: {}", e),
            })
    }

    /// Broadcast a signed transaction. Not retried across providers: a
    /// timeout does not prove the node dropped it.
    pub async fn send_raw_transaction(&self, raw: Bytes) -> ExecutorResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ExecutorError::ChainConnection {
                chain_id: self.config.chain_id,
                message: format!("broadcast failed: {}", e),
            })?;
        Ok(pending.tx_hash())
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> ExecutorResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                let price = self
                    .with_failover("get_gas_price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn estimate_eip1559_fees(&self) -> ExecutorResult<(U256, U256)> {
        let block = self
            .with_failover("get_block", |p| async move { p.get_block(BlockNumber::Latest).await })
            .await?
            .ok_or_else(|| self.connection_error("No latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| self.connection_error("No base fee in block"))?;

        let priority_fee = U256::from(self.config.priority_fee_gwei) * U256::exp10(9);

        // Max fee = 2 * base_fee + priority_fee
        let max_fee = base_fee * 2 + priority_fee;

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::exp10(9);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    fn connection_error(&self, message: &str) -> ExecutorError {
        ExecutorError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config
            .confirmation_blocks
            .unwrap_or_else(|| super::recommended_confirmations(self.config.chain_id))
    }

    pub fn trace_url(&self) -> Option<&str> {
        self.config.trace_url.as_deref()
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
