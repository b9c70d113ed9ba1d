//! Wallet capability interface
//!
//! Every wallet/VM pairing implements [`AdaptedWallet`] once. The executor only
//! talks to wallets through this trait and never branches on [`VmType`]: optional
//! features are advertised through [`WalletCapabilities`], which the executor reads
//! once per execution call.

pub mod evm;

pub use evm::EthersWallet;

use crate::error::{ExecutorError, ExecutorResult};
use crate::quote::{Receipt, Step, StepItem, VmType};

use alloy_primitives::U256;
use async_trait::async_trait;
use std::sync::Mutex;

/// Optional features a wallet opts into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletCapabilities {
    /// `get_balance` is implemented
    pub balance: bool,
    /// `supports_atomic_batch` is implemented
    pub atomic_batch: bool,
    /// `handle_batch_transaction_step` is implemented
    pub batch_transactions: bool,
    /// `is_eoa` is implemented
    pub eoa_detection: bool,
}

/// Account code classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EoaStatus {
    pub is_eoa: bool,
    pub is_eip7702_delegated: bool,
}

#[derive(Debug, Default)]
struct ConfirmationSignal {
    replaced_by: Option<String>,
    cancelled: bool,
}

/// Replacement and cancellation signals raised by a wallet while it waits for a
/// transaction. The executor owns one instance per confirmation attempt.
#[derive(Debug, Default)]
pub struct ConfirmationEvents {
    signal: Mutex<ConfirmationSignal>,
}

impl ConfirmationEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction was superseded by `new_hash`; confirmation continues on it
    pub fn replaced(&self, new_hash: impl Into<String>) {
        let mut signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        signal.replaced_by = Some(new_hash.into());
    }

    /// The transaction was dropped in favour of a cancellation
    pub fn cancelled(&self) {
        let mut signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        signal.cancelled = true;
    }

    /// Most recent replacement hash, if any
    pub fn replacement(&self) -> Option<String> {
        let signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        signal.replaced_by.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        let signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        signal.cancelled
    }
}

/// The contract every wallet integration satisfies
#[async_trait]
pub trait AdaptedWallet: Send + Sync {
    fn vm_type(&self) -> VmType;

    async fn get_chain_id(&self) -> ExecutorResult<u64>;

    async fn address(&self) -> ExecutorResult<String>;

    /// Sign a signature item. Wallets without a signing concept must return an
    /// error rather than `Ok(None)`.
    async fn handle_sign_message_step(
        &self,
        item: &StepItem,
        step: &Step,
    ) -> ExecutorResult<Option<String>>;

    /// Submit one transaction item and return its hash
    async fn handle_send_transaction_step(
        &self,
        chain_id: u64,
        item: &StepItem,
        step: &Step,
    ) -> ExecutorResult<Option<String>>;

    /// Wait for a transaction to finalize. Replacement and cancellation are
    /// reported through `events`; retry policy is the wallet's own.
    async fn handle_confirm_transaction_step(
        &self,
        tx_hash: &str,
        chain_id: u64,
        events: &ConfirmationEvents,
    ) -> ExecutorResult<Receipt>;

    async fn switch_chain(&self, chain_id: u64) -> ExecutorResult<()>;

    fn capabilities(&self) -> WalletCapabilities {
        WalletCapabilities::default()
    }

    async fn get_balance(
        &self,
        _chain_id: u64,
        _address: &str,
        _currency: Option<&str>,
    ) -> ExecutorResult<U256> {
        Err(ExecutorError::UnsupportedCapability {
            capability: "get_balance",
        })
    }

    async fn supports_atomic_batch(&self, _chain_id: u64) -> ExecutorResult<bool> {
        Ok(false)
    }

    /// Submit several items as one atomic call
    async fn handle_batch_transaction_step(
        &self,
        _chain_id: u64,
        _items: &[StepItem],
    ) -> ExecutorResult<Option<String>> {
        Err(ExecutorError::UnsupportedCapability {
            capability: "handle_batch_transaction_step",
        })
    }

    async fn is_eoa(&self, _chain_id: u64) -> ExecutorResult<EoaStatus> {
        Err(ExecutorError::UnsupportedCapability { capability: "is_eoa" })
    }
}
