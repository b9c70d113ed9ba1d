//! Chain module - EVM connectivity for the reference wallet
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Receipt watching with replacement and cancellation detection
//! - Chain-specific finality depths

pub mod finality;
pub mod provider;

pub use finality::{recommended_confirmations, ReceiptWatcher, TxOrigin, WatchOutcome};
pub use provider::{ChainProvider, GasPrice};

use crate::batch::SequenceReader;
use crate::config::{ChainConfig, Settings};
use crate::error::{ExecutorError, ExecutorResult};

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{TransactionRequest, H160};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Providers for every configured chain, keyed by chain id
#[derive(Default)]
pub struct ChainRegistry {
    providers: DashMap<u64, Arc<ChainProvider>>,
}

impl ChainRegistry {
    pub fn new(settings: &Settings) -> ExecutorResult<Self> {
        Self::from_configs(settings.enabled_chains().into_iter().map(|(_, c)| c.clone()))
    }

    pub fn from_configs(configs: impl IntoIterator<Item = ChainConfig>) -> ExecutorResult<Self> {
        let registry = Self::default();
        for config in configs {
            info!("Initializing chain {} (ID: {})", config.name, config.chain_id);
            let provider = ChainProvider::new(config)?;
            registry
                .providers
                .insert(provider.chain_id(), Arc::new(provider));
        }
        Ok(registry)
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u64) -> ExecutorResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(ExecutorError::ChainNotFound { chain_id })
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.providers.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.providers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Trace endpoints of every chain that configures one
    pub fn trace_endpoints(&self) -> HashMap<u64, String> {
        self.providers
            .iter()
            .filter_map(|e| e.value().trace_url().map(|url| (*e.key(), url.to_string())))
            .collect()
    }
}

#[async_trait]
impl SequenceReader for ChainRegistry {
    async fn call(&self, chain_id: u64, to: Address, data: Bytes) -> ExecutorResult<Bytes> {
        let provider = self.get_provider(chain_id)?;
        let request = TransactionRequest::new()
            .to(H160::from_slice(to.as_slice()))
            .data(data.to_vec());
        let result = provider.call(&TypedTransaction::Legacy(request)).await?;
        Ok(Bytes::from(result.to_vec()))
    }
}
