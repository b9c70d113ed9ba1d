//! Scripted wallet for executor tests

use crate::error::{ExecutorError, ExecutorResult};
use crate::quote::{Receipt, Step, StepItem, VmType};
use crate::wallet::{AdaptedWallet, ConfirmationEvents, EoaStatus, WalletCapabilities};

use alloy_primitives::U256;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub const ADDRESS: &str = "0x00000000000000000000000000000000000000aa";

pub fn evm_receipt(tx_hash: &str) -> Receipt {
    Receipt::Evm {
        transaction_hash: tx_hash.to_string(),
        block_number: 100,
        status: 1,
        gas_used: Some("21000".to_string()),
    }
}

/// How the wallet answers a confirmation request for one hash
#[derive(Debug, Clone)]
pub enum ConfirmBehavior {
    Receipt(Receipt),
    ReplacedWith(String),
    Cancelled,
    Error(String),
    /// Times out on the first wait, then confirms
    TimeoutFirst,
    /// Never resolves
    Hang,
}

#[derive(Debug, Default)]
struct Calls {
    signs: Vec<StepItem>,
    sends: Vec<(u64, StepItem)>,
    batches: Vec<(u64, usize)>,
    confirms: Vec<String>,
    switches: Vec<u64>,
    balance_reads: usize,
}

pub struct ScriptedWallet {
    chain_id: Mutex<u64>,
    capabilities: WalletCapabilities,
    atomic_batch: bool,
    eoa: Option<EoaStatus>,
    balance: Option<U256>,
    confirm: HashMap<String, ConfirmBehavior>,
    failing_sends: HashSet<usize>,
    calls: Mutex<Calls>,
}

impl ScriptedWallet {
    pub fn new() -> Self {
        Self {
            chain_id: Mutex::new(1),
            capabilities: WalletCapabilities::default(),
            atomic_batch: false,
            eoa: None,
            balance: None,
            confirm: HashMap::new(),
            failing_sends: HashSet::new(),
            calls: Mutex::new(Calls::default()),
        }
    }

    pub fn on_chain(self, chain_id: u64) -> Self {
        *self.chain_id.lock().unwrap() = chain_id;
        self
    }

    pub fn confirm(mut self, tx_hash: &str, behavior: ConfirmBehavior) -> Self {
        self.confirm.insert(tx_hash.to_string(), behavior);
        self
    }

    /// The n-th send call (zero based) fails before producing a hash
    pub fn fail_send(mut self, call: usize) -> Self {
        self.failing_sends.insert(call);
        self
    }

    pub fn atomic_batch(mut self) -> Self {
        self.atomic_batch = true;
        self.capabilities.atomic_batch = true;
        self
    }

    pub fn wallet_batching(mut self) -> Self {
        self.capabilities.batch_transactions = true;
        self
    }

    pub fn eoa(mut self, status: EoaStatus) -> Self {
        self.eoa = Some(status);
        self.capabilities.eoa_detection = true;
        self
    }

    pub fn balance(mut self, balance: U256) -> Self {
        self.balance = Some(balance);
        self.capabilities.balance = true;
        self
    }

    pub fn sign_count(&self) -> usize {
        self.calls.lock().unwrap().signs.len()
    }

    pub fn signed_items(&self) -> Vec<StepItem> {
        self.calls.lock().unwrap().signs.clone()
    }

    pub fn send_count(&self) -> usize {
        self.calls.lock().unwrap().sends.len()
    }

    pub fn sent_items(&self) -> Vec<(u64, StepItem)> {
        self.calls.lock().unwrap().sends.clone()
    }

    pub fn batch_calls(&self) -> Vec<(u64, usize)> {
        self.calls.lock().unwrap().batches.clone()
    }

    pub fn confirm_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().confirms.clone()
    }

    pub fn switch_calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().switches.clone()
    }

    pub fn balance_reads(&self) -> usize {
        self.calls.lock().unwrap().balance_reads
    }
}

#[async_trait]
impl AdaptedWallet for ScriptedWallet {
    fn vm_type(&self) -> VmType {
        VmType::Evm
    }

    async fn get_chain_id(&self) -> ExecutorResult<u64> {
        Ok(*self.chain_id.lock().unwrap())
    }

    async fn address(&self) -> ExecutorResult<String> {
        Ok(ADDRESS.to_string())
    }

    async fn handle_sign_message_step(
        &self,
        item: &StepItem,
        _step: &Step,
    ) -> ExecutorResult<Option<String>> {
        let mut calls = self.calls.lock().unwrap();
        calls.signs.push(item.clone());
        Ok(Some(format!("0x{}", "11".repeat(65))))
    }

    async fn handle_send_transaction_step(
        &self,
        chain_id: u64,
        item: &StepItem,
        _step: &Step,
    ) -> ExecutorResult<Option<String>> {
        let mut calls = self.calls.lock().unwrap();
        let index = calls.sends.len();
        calls.sends.push((chain_id, item.clone()));
        if self.failing_sends.contains(&index) {
            return Err(ExecutorError::Wallet("user rejected the request".to_string()));
        }
        Ok(Some(format!("0xtx{}", index + 1)))
    }

    async fn handle_confirm_transaction_step(
        &self,
        tx_hash: &str,
        _chain_id: u64,
        events: &ConfirmationEvents,
    ) -> ExecutorResult<Receipt> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.confirms.push(tx_hash.to_string());
            calls.confirms.iter().filter(|h| h.as_str() == tx_hash).count()
        };

        match self.confirm.get(tx_hash).cloned() {
            None => Ok(evm_receipt(tx_hash)),
            Some(ConfirmBehavior::Receipt(receipt)) => Ok(receipt),
            Some(ConfirmBehavior::ReplacedWith(new_hash)) => {
                events.replaced(new_hash.clone());
                Ok(evm_receipt(&new_hash))
            }
            Some(ConfirmBehavior::Cancelled) => {
                events.cancelled();
                Err(ExecutorError::Wallet("transaction dropped".to_string()))
            }
            Some(ConfirmBehavior::Error(message)) => Err(ExecutorError::Wallet(message)),
            Some(ConfirmBehavior::TimeoutFirst) if attempt == 1 => Err(ExecutorError::Timeout {
                operation: format!("receipt of {}", tx_hash),
            }),
            Some(ConfirmBehavior::TimeoutFirst) => Ok(evm_receipt(tx_hash)),
            Some(ConfirmBehavior::Hang) => std::future::pending().await,
        }
    }

    async fn switch_chain(&self, chain_id: u64) -> ExecutorResult<()> {
        self.calls.lock().unwrap().switches.push(chain_id);
        *self.chain_id.lock().unwrap() = chain_id;
        Ok(())
    }

    fn capabilities(&self) -> WalletCapabilities {
        self.capabilities
    }

    async fn get_balance(
        &self,
        _chain_id: u64,
        _address: &str,
        _currency: Option<&str>,
    ) -> ExecutorResult<U256> {
        self.calls.lock().unwrap().balance_reads += 1;
        self.balance.ok_or(ExecutorError::UnsupportedCapability {
            capability: "get_balance",
        })
    }

    async fn supports_atomic_batch(&self, _chain_id: u64) -> ExecutorResult<bool> {
        Ok(self.atomic_batch)
    }

    async fn handle_batch_transaction_step(
        &self,
        chain_id: u64,
        items: &[StepItem],
    ) -> ExecutorResult<Option<String>> {
        if !self.capabilities.batch_transactions {
            return Err(ExecutorError::UnsupportedCapability {
                capability: "handle_batch_transaction_step",
            });
        }
        let mut calls = self.calls.lock().unwrap();
        calls.batches.push((chain_id, items.len()));
        Ok(Some(format!("0xbatch{}", calls.batches.len())))
    }

    async fn is_eoa(&self, _chain_id: u64) -> ExecutorResult<EoaStatus> {
        self.eoa
            .ok_or(ExecutorError::UnsupportedCapability { capability: "is_eoa" })
    }
}
