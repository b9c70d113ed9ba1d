//! Receipt watching and finality depth for EVM chains
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: L1 finality, soft finality used here
//! - Avalanche: Instant finality (1 block)
//!
//! While waiting, a transaction whose nonce gets consumed by a different hash
//! is either replaced (confirmation continues on the new hash) or cancelled
//! (a zero-value self-send took its slot).

use crate::chain::ChainProvider;
use crate::error::{ExecutorError, ExecutorResult};

use ethers::types::{Address, Transaction, TransactionReceipt, H256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Blocks re-scanned behind the head when the watch starts
const REPLACEMENT_LOOKBACK: u64 = 20;

/// The submitted transaction's ordering slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOrigin {
    pub from: Address,
    pub nonce: u64,
}

#[derive(Debug, Clone)]
pub enum WatchOutcome {
    Mined {
        receipt: TransactionReceipt,
        /// Set when the receipt belongs to a replacement
        replaced_by: Option<H256>,
    },
    Cancelled {
        by: H256,
    },
}

/// Polls one chain for a transaction's receipt at the configured depth
pub struct ReceiptWatcher {
    provider: Arc<ChainProvider>,
    confirmation_blocks: u64,
    poll_interval: Duration,
    timeout: Duration,
}

impl ReceiptWatcher {
    pub fn new(provider: Arc<ChainProvider>, poll_interval: Duration, timeout: Duration) -> Self {
        let confirmation_blocks = provider.confirmation_blocks().max(1);
        Self {
            provider,
            confirmation_blocks,
            poll_interval,
            timeout,
        }
    }

    /// Wait for `tx_hash` (or whatever replaced it) to reach the required depth
    ///
    /// The timeout bounds inclusion. Once mined, every new block restarts it,
    /// so a deep confirmation requirement is not cut short while the chain
    /// keeps advancing.
    pub async fn wait(&self, tx_hash: H256, origin: Option<TxOrigin>) -> ExecutorResult<WatchOutcome> {
        let chain_id = self.provider.chain_id();
        let mut deadline = Instant::now() + self.timeout;
        let mut depth_head = None;
        let mut current = tx_hash;
        let mut scan_from = self
            .provider
            .get_block_number()
            .await?
            .saturating_sub(REPLACEMENT_LOOKBACK);

        loop {
            let head = self.provider.get_block_number().await?;

            if let Some(receipt) = self.provider.get_transaction_receipt(current).await? {
                if let Some(mined_in) = receipt.block_number {
                    let confirmations = head.saturating_sub(mined_in.as_u64()) + 1;
                    if confirmations >= self.confirmation_blocks {
                        info!(
                            "Transaction {:?} confirmed on chain {} ({} confirmations)",
                            current, chain_id, confirmations
                        );
                        let replaced_by = (current != tx_hash).then_some(current);
                        return Ok(WatchOutcome::Mined { receipt, replaced_by });
                    }
                    debug!(
                        "Transaction {:?} has {} / {} confirmations on chain {}",
                        current, confirmations, self.confirmation_blocks, chain_id
                    );
                    if depth_head.map_or(true, |seen| head > seen) {
                        depth_head = Some(head);
                        deadline = Instant::now() + self.timeout;
                    }
                }
            } else if let Some(origin) = origin {
                let mined_nonce = self.provider.get_mined_transaction_count(origin.from).await?;
                if mined_nonce > origin.nonce {
                    if let Some(replacement) = self.find_replacement(origin, scan_from, head).await? {
                        if is_cancellation(&replacement, origin.from) {
                            warn!(
                                "Transaction {:?} cancelled by {:?} on chain {}",
                                current, replacement.hash, chain_id
                            );
                            return Ok(WatchOutcome::Cancelled { by: replacement.hash });
                        }
                        if replacement.hash != current {
                            info!(
                                "Transaction {:?} replaced by {:?} on chain {}",
                                current, replacement.hash, chain_id
                            );
                            current = replacement.hash;
                            continue;
                        }
                    }
                    scan_from = head + 1;
                }
            }

            if Instant::now() >= deadline {
                return Err(ExecutorError::Timeout {
                    operation: format!("receipt for {:?} on chain {}", current, chain_id),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// The mined transaction that used `origin`'s nonce, if it lies in range
    async fn find_replacement(
        &self,
        origin: TxOrigin,
        from_block: u64,
        to_block: u64,
    ) -> ExecutorResult<Option<Transaction>> {
        for number in (from_block..=to_block).rev() {
            let Some(block) = self.provider.get_block_with_txs(number).await? else {
                continue;
            };
            let found = block
                .transactions
                .into_iter()
                .find(|tx| tx.from == origin.from && tx.nonce.as_u64() == origin.nonce);
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

/// A zero-value, empty-calldata send to oneself
fn is_cancellation(tx: &Transaction, from: Address) -> bool {
    tx.to == Some(from) && tx.value.is_zero() && tx.input.is_empty()
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}
