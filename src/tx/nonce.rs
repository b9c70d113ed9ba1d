//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so back-to-back sends never collide
//! - The (nonce, hash) record needed to spot replacements later

use crate::chain::ChainProvider;
use crate::error::ExecutorResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Per-chain nonce state
#[derive(Debug, Default)]
struct ChainNonceState {
    /// Next nonce to hand out
    next: u64,
    /// Submitted transactions: tx_hash -> nonce
    pending: HashMap<String, u64>,
}

/// Manages nonces for one account across chains
pub struct NonceManager {
    address: Address,
    chain_state: DashMap<u64, Arc<Mutex<ChainNonceState>>>,
}

impl NonceManager {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            chain_state: DashMap::new(),
        }
    }

    fn state(&self, chain_id: u64) -> Arc<Mutex<ChainNonceState>> {
        self.chain_state
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Mutex::new(ChainNonceState::default())))
            .clone()
    }

    /// Allocate the next nonce, never below the node's pending count
    pub async fn next_nonce(&self, provider: &ChainProvider) -> ExecutorResult<u64> {
        let chain_id = provider.chain_id();
        let on_chain = provider.get_transaction_count(self.address).await?;

        let state = self.state(chain_id);
        let mut state = state.lock().await;
        let nonce = state.next.max(on_chain);
        state.next = nonce + 1;

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Record the hash a nonce was submitted under
    pub async fn mark_pending(&self, chain_id: u64, nonce: u64, tx_hash: &str) {
        let state = self.state(chain_id);
        let mut state = state.lock().await;
        state.pending.insert(tx_hash.to_lowercase(), nonce);
    }

    /// Nonce a tracked hash was sent with
    pub async fn nonce_of(&self, chain_id: u64, tx_hash: &str) -> Option<u64> {
        let state = self.state(chain_id);
        let state = state.lock().await;
        state.pending.get(&tx_hash.to_lowercase()).copied()
    }

    /// Transaction mined (or replaced); stop tracking it
    pub async fn confirm(&self, chain_id: u64, tx_hash: &str) {
        let state = self.state(chain_id);
        let mut state = state.lock().await;
        state.pending.remove(&tx_hash.to_lowercase());
    }

    /// Send failed before reaching the node; hand the nonce out again
    pub async fn release(&self, chain_id: u64, nonce: u64) {
        let state = self.state(chain_id);
        let mut state = state.lock().await;
        if state.next == nonce + 1 {
            state.next = nonce;
        }
    }
}
