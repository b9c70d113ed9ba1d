//! Reference EVM wallet backed by an ethers `LocalWallet`
//!
//! Signs locally and talks to the configured RPC providers. Nonces are tracked
//! per chain so replacements of our own transactions can be detected while a
//! receipt is awaited.

use super::{AdaptedWallet, ConfirmationEvents, EoaStatus, WalletCapabilities};
use crate::chain::{ChainRegistry, GasPrice, ReceiptWatcher, TxOrigin, WatchOutcome};
use crate::error::{ExecutorError, ExecutorResult};
use crate::quote::{parse_quantity, Receipt, SignData, Step, StepItem, TransactionData, VmType};
use crate::tx::{GasEstimator, NonceManager};

use alloy_primitives::U256 as Quantity;
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip712::TypedData;
use ethers::types::{
    Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, TransactionRequest, H256, U256,
};
use ethers::utils::to_checksum;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Code prefix of an EIP-7702 delegation designator
const DELEGATION_PREFIX: [u8; 3] = [0xef, 0x01, 0x00];

sol! {
    function balanceOf(address owner) external view returns (uint256 balance);
}

pub struct EthersWallet {
    signer: LocalWallet,
    chains: Arc<ChainRegistry>,
    nonces: NonceManager,
    gas: GasEstimator,
    active_chain: AtomicU64,
    poll_interval: Duration,
    confirmation_timeout: Duration,
}

impl EthersWallet {
    /// Wallet starting on the lowest configured chain id
    pub fn new(signer: LocalWallet, chains: Arc<ChainRegistry>) -> ExecutorResult<Self> {
        let active = chains
            .chain_ids()
            .first()
            .copied()
            .ok_or_else(|| ExecutorError::Config("no chains configured".to_string()))?;

        info!(
            "Wallet {} initialized on chain {}",
            to_checksum(&signer.address(), None),
            active
        );

        Ok(Self {
            nonces: NonceManager::new(signer.address()),
            signer,
            chains,
            gas: GasEstimator::new(),
            active_chain: AtomicU64::new(active),
            poll_interval: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(300),
        })
    }

    pub fn from_private_key(key: &str, chains: Arc<ChainRegistry>) -> ExecutorResult<Self> {
        let signer = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| ExecutorError::Wallet(format!("Invalid private key: {}", e)))?;
        Self::new(signer, chains)
    }

    pub fn with_confirmation(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.confirmation_timeout = timeout;
        self
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_message(&self, sign: &SignData) -> ExecutorResult<String> {
        let signature = match sign {
            SignData::Eip191 { message } => self
                .signer
                .sign_message(message_bytes(message))
                .await
                .map_err(|e| ExecutorError::Wallet(e.to_string()))?,
            SignData::Eip712 {
                domain,
                types,
                primary_type,
                value,
            } => {
                let typed = typed_data(domain, types, primary_type, value)?;
                self.signer
                    .sign_typed_data(&typed)
                    .await
                    .map_err(|e| ExecutorError::Wallet(e.to_string()))?
            }
        };

        Ok(format!("0x{}", hex::encode(signature.to_vec())))
    }

    async fn send(&self, chain_id: u64, tx: &TransactionData) -> ExecutorResult<String> {
        let provider = self.chains.get_provider(chain_id)?;
        let nonce = self.nonces.next_nonce(&provider).await?;

        match self.sign_and_send(chain_id, tx, nonce).await {
            Ok(tx_hash) => {
                self.nonces.mark_pending(chain_id, nonce, &tx_hash).await;
                info!("Transaction sent on chain {}: {} (nonce {})", chain_id, tx_hash, nonce);
                Ok(tx_hash)
            }
            Err(e) => {
                warn!("Send on chain {} failed, releasing nonce {}: {}", chain_id, nonce, e);
                self.nonces.release(chain_id, nonce).await;
                Err(e)
            }
        }
    }

    async fn sign_and_send(
        &self,
        chain_id: u64,
        tx: &TransactionData,
        nonce: u64,
    ) -> ExecutorResult<String> {
        let provider = self.chains.get_provider(chain_id)?;
        let from = self.signer.address();
        let to = tx.to.as_deref().map(parse_address).transpose()?;
        let data = Bytes::from(decode_hex(tx.data.as_deref().unwrap_or("0x"))?);
        let value = to_ethers(tx.value_wei()?);

        let mut request = TransactionRequest::new()
            .from(from)
            .data(data.clone())
            .value(value)
            .nonce(nonce)
            .chain_id(chain_id);
        if let Some(to) = to {
            request = request.to(to);
        }

        let gas_limit = match tx.gas_limit()? {
            Some(limit) => to_ethers(limit),
            None => {
                let estimate = provider
                    .estimate_gas(&TypedTransaction::Legacy(request.clone()))
                    .await?;
                self.gas.buffered_limit(estimate)
            }
        };

        let fees = match (&tx.max_fee_per_gas, &tx.max_priority_fee_per_gas) {
            (Some(max_fee), Some(tip)) => GasPrice::Eip1559 {
                max_fee_per_gas: to_ethers(parse_quantity(max_fee)?),
                max_priority_fee_per_gas: to_ethers(parse_quantity(tip)?),
            },
            _ => self.gas.get_gas_price(&provider).await?,
        };

        let typed: TypedTransaction = match fees {
            GasPrice::Legacy(price) => request.gas(gas_limit).gas_price(price).into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut eip1559 = Eip1559TransactionRequest::new()
                    .from(from)
                    .data(data)
                    .value(value)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .chain_id(chain_id);
                if let Some(to) = to {
                    eip1559 = eip1559.to(to);
                }
                eip1559.into()
            }
        };

        let signer = self.signer.clone().with_chain_id(chain_id);
        let signature = signer
            .sign_transaction(&typed)
            .await
            .map_err(|e| ExecutorError::Wallet(e.to_string()))?;

        let tx_hash = provider
            .send_raw_transaction(typed.rlp_signed(&signature))
            .await?;
        Ok(format!("{:?}", tx_hash))
    }
}

#[async_trait]
impl AdaptedWallet for EthersWallet {
    fn vm_type(&self) -> VmType {
        VmType::Evm
    }

    async fn get_chain_id(&self) -> ExecutorResult<u64> {
        Ok(self.active_chain.load(Ordering::Relaxed))
    }

    async fn address(&self) -> ExecutorResult<String> {
        Ok(to_checksum(&self.signer.address(), None))
    }

    async fn handle_sign_message_step(
        &self,
        item: &StepItem,
        step: &Step,
    ) -> ExecutorResult<Option<String>> {
        let data = item.signature().ok_or_else(|| {
            ExecutorError::InvalidQuote(format!("step {} item carries no message", step.id))
        })?;

        debug!("Signing message for step {}", step.id);
        self.sign_message(&data.sign).await.map(Some)
    }

    async fn handle_send_transaction_step(
        &self,
        chain_id: u64,
        item: &StepItem,
        step: &Step,
    ) -> ExecutorResult<Option<String>> {
        let tx = item.transaction().ok_or_else(|| {
            ExecutorError::InvalidQuote(format!("step {} item carries no transaction", step.id))
        })?;

        if tx.chain_id != chain_id {
            return Err(ExecutorError::InvalidQuote(format!(
                "item targets chain {} but send requested on {}",
                tx.chain_id, chain_id
            )));
        }

        self.send(chain_id, tx).await.map(Some)
    }

    async fn handle_confirm_transaction_step(
        &self,
        tx_hash: &str,
        chain_id: u64,
        events: &ConfirmationEvents,
    ) -> ExecutorResult<Receipt> {
        let provider = self.chains.get_provider(chain_id)?;
        let hash = parse_hash(tx_hash)?;
        let origin = match self.nonces.nonce_of(chain_id, tx_hash).await {
            Some(nonce) => Some(TxOrigin {
                from: self.signer.address(),
                nonce,
            }),
            // Not sent by this process (or already released); ask the node
            None => match provider.get_transaction(hash).await {
                Ok(found) => found.map(|tx| TxOrigin {
                    from: tx.from,
                    nonce: tx.nonce.as_u64(),
                }),
                Err(e) => {
                    debug!("No origin for {} on chain {}: {}", tx_hash, chain_id, e);
                    None
                }
            },
        };

        let watcher = ReceiptWatcher::new(provider, self.poll_interval, self.confirmation_timeout);
        let outcome = watcher.wait(hash, origin).await;
        self.nonces.confirm(chain_id, tx_hash).await;

        match outcome? {
            WatchOutcome::Mined {
                receipt,
                replaced_by,
            } => {
                if let Some(new_hash) = replaced_by {
                    events.replaced(format!("{:?}", new_hash));
                }
                Ok(to_receipt(&receipt))
            }
            WatchOutcome::Cancelled { by } => {
                events.cancelled();
                Err(ExecutorError::Wallet(format!(
                    "transaction {} cancelled by {:?}",
                    tx_hash, by
                )))
            }
        }
    }

    async fn switch_chain(&self, chain_id: u64) -> ExecutorResult<()> {
        if !self.chains.contains(chain_id) {
            return Err(ExecutorError::ChainNotFound { chain_id });
        }
        self.active_chain.store(chain_id, Ordering::Relaxed);
        info!("Switched to chain {}", chain_id);
        Ok(())
    }

    fn capabilities(&self) -> WalletCapabilities {
        WalletCapabilities {
            balance: true,
            atomic_batch: true,
            batch_transactions: false,
            eoa_detection: true,
        }
    }

    async fn get_balance(
        &self,
        chain_id: u64,
        address: &str,
        currency: Option<&str>,
    ) -> ExecutorResult<Quantity> {
        let provider = self.chains.get_provider(chain_id)?;
        let owner = parse_address(address)?;
        let token = currency
            .map(parse_address)
            .transpose()?
            .filter(|token| !token.is_zero());

        let Some(token) = token else {
            return Ok(to_alloy(provider.get_balance(owner).await?));
        };

        let calldata = balanceOfCall {
            owner: alloy_primitives::Address::from_slice(owner.as_bytes()),
        }
        .abi_encode();
        let request = TransactionRequest::new().to(token).data(calldata);
        let result = provider.call(&request.into()).await?;
        let decoded = balanceOfCall::abi_decode_returns(&result, true)
            .map_err(|e| ExecutorError::Encoding(format!("balanceOf result: {}", e)))?;
        Ok(decoded.balance)
    }

    async fn supports_atomic_batch(&self, chain_id: u64) -> ExecutorResult<bool> {
        Ok(self.is_eoa(chain_id).await?.is_eip7702_delegated)
    }

    async fn is_eoa(&self, chain_id: u64) -> ExecutorResult<EoaStatus> {
        let provider = self.chains.get_provider(chain_id)?;
        let code = provider.get_code(self.signer.address()).await?;
        Ok(classify_code(&code))
    }
}

fn classify_code(code: &[u8]) -> EoaStatus {
    if code.is_empty() {
        return EoaStatus {
            is_eoa: true,
            is_eip7702_delegated: false,
        };
    }

    let delegated = code.len() == 23 && code.starts_with(&DELEGATION_PREFIX);
    EoaStatus {
        is_eoa: delegated,
        is_eip7702_delegated: delegated,
    }
}

/// `0x`-prefixed messages are raw bytes, anything else is UTF-8 text
fn message_bytes(message: &str) -> Vec<u8> {
    message
        .strip_prefix("0x")
        .and_then(|hex| hex::decode(hex).ok())
        .unwrap_or_else(|| message.as_bytes().to_vec())
}

fn typed_data(domain: &Value, types: &Value, primary_type: &str, value: &Value) -> ExecutorResult<TypedData> {
    let payload = json!({
        "domain": normalize_domain(domain)?,
        "types": types,
        "primaryType": primary_type,
        "message": value,
    });

    serde_json::from_value(payload)
        .map_err(|e| ExecutorError::Encoding(format!("invalid typed data: {}", e)))
}

/// Salts arrive as hex strings but the signer's domain type holds raw bytes.
/// Null fields are dropped so they are left out of the domain type.
fn normalize_domain(domain: &Value) -> ExecutorResult<Value> {
    let mut domain = domain.clone();

    let salt = domain.get("salt").and_then(Value::as_str).map(str::to_string);
    if let Some(salt) = salt {
        let bytes = decode_hex(&salt)?;
        if bytes.len() != 32 {
            return Err(ExecutorError::Encoding(format!(
                "domain salt must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        domain["salt"] = json!(bytes);
    }

    if let Value::Object(fields) = &mut domain {
        fields.retain(|_, v| !v.is_null());
    }
    Ok(domain)
}

fn to_receipt(receipt: &TransactionReceipt) -> Receipt {
    Receipt::Evm {
        transaction_hash: format!("{:?}", receipt.transaction_hash),
        block_number: receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        status: receipt.status.map(|s| s.as_u64()).unwrap_or(1),
        gas_used: receipt.gas_used.map(|g| g.to_string()),
    }
}

fn to_ethers(value: Quantity) -> U256 {
    U256::from_big_endian(&value.to_be_bytes::<32>())
}

fn to_alloy(value: U256) -> Quantity {
    Quantity::from_limbs(value.0)
}

fn decode_hex(input: &str) -> ExecutorResult<Vec<u8>> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(stripped).map_err(|e| ExecutorError::Encoding(format!("invalid hex {}: {}", input, e)))
}

fn parse_address(input: &str) -> ExecutorResult<Address> {
    let bytes = decode_hex(input)?;
    if bytes.len() != 20 {
        return Err(ExecutorError::Encoding(format!("invalid address {}", input)));
    }
    Ok(Address::from_slice(&bytes))
}

fn parse_hash(input: &str) -> ExecutorResult<H256> {
    let bytes = decode_hex(input)?;
    if bytes.len() != 32 {
        return Err(ExecutorError::Encoding(format!("invalid transaction hash {}", input)));
    }
    Ok(H256::from_slice(&bytes))
}
