//! Gasless batch execution
//!
//! Several calls on one chain are folded into a single `SignedBatchedCall`,
//! authorized with one EIP-712 signature, and executed by the user's delegated
//! account. Submission is either a direct self-call from the wallet or a relay
//! through the backend, which pays origin gas.

pub mod calibur;

use crate::api::{BatchRelayRequest, SolverApi};
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::CancelSignal;
use crate::quote::{
    ItemData, QuoteItemStatus, SignData, SignatureData, Step, StepItem, StepKind,
    TransactionData,
};
use crate::tx::GasEstimator;
use crate::wallet::AdaptedWallet;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolStruct;
use async_trait::async_trait;
use calibur::{BatchedCall, Call, SignedBatchedCall};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Dispatch overhead of the batch executor contract on top of the calls themselves
pub const BATCH_GAS_OVERHEAD: u64 = 80_000;

/// Read-only contract access used for the sequence lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SequenceReader: Send + Sync {
    /// `eth_call` with `data` against `to` on `chain_id`
    async fn call(&self, chain_id: u64, to: Address, data: Bytes) -> ExecutorResult<Bytes>;
}

/// One supported batching scheme
#[derive(Clone)]
pub struct BatchExecutorConfig {
    /// Delegation target; also the EIP-712 salt
    pub implementation: Address,
    pub domain_name: String,
    pub domain_version: String,
    pub gas_overhead: u64,
    pub revert_on_failure: bool,
    pub reader: Option<Arc<dyn SequenceReader>>,
}

impl BatchExecutorConfig {
    pub fn calibur(implementation: Address) -> Self {
        Self {
            implementation,
            domain_name: calibur::DOMAIN_NAME.to_string(),
            domain_version: calibur::DOMAIN_VERSION.to_string(),
            gas_overhead: BATCH_GAS_OVERHEAD,
            revert_on_failure: true,
            reader: None,
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn SequenceReader>) -> Self {
        self.reader = Some(reader);
        self
    }
}

impl fmt::Debug for BatchExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchExecutorConfig")
            .field("implementation", &self.implementation)
            .field("domain_name", &self.domain_name)
            .field("domain_version", &self.domain_version)
            .field("gas_overhead", &self.gas_overhead)
            .field("revert_on_failure", &self.revert_on_failure)
            .field("reader", &self.reader.is_some())
            .finish()
    }
}

/// A batch ready for signing
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub chain_id: u64,
    pub account: Address,
    pub message: SignedBatchedCall,
    pub signing_hash: B256,
    pub gas_limit: U256,
}

#[derive(Debug, Clone)]
pub struct BatchSubmission {
    pub tx_hash: String,
    pub gas_limit: U256,
    pub nonce: U256,
    pub relayed: bool,
}

pub struct BatchExecutor<'a> {
    config: &'a BatchExecutorConfig,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(config: &'a BatchExecutorConfig) -> Self {
        Self { config }
    }

    /// Current sequence of `account`; zero when the read fails
    pub async fn read_sequence(&self, chain_id: u64, account: Address) -> U256 {
        let Some(reader) = &self.config.reader else {
            return U256::ZERO;
        };

        let calldata = calibur::get_seq_calldata(U256::ZERO);
        match reader.call(chain_id, account, calldata).await {
            Ok(data) => calibur::decode_seq(&data).unwrap_or_else(|| {
                debug!("Unreadable sequence for {} on chain {}, using 0", account, chain_id);
                U256::ZERO
            }),
            Err(e) => {
                debug!(
                    "Sequence read for {} on chain {} failed ({}), using 0",
                    account, chain_id, e
                );
                U256::ZERO
            }
        }
    }

    /// Build the signed-call message for `items`
    pub fn prepare(
        &self,
        chain_id: u64,
        account: Address,
        items: &[StepItem],
        nonce: U256,
    ) -> ExecutorResult<PreparedBatch> {
        let calls = items
            .iter()
            .map(|item| to_call(chain_id, item))
            .collect::<ExecutorResult<Vec<_>>>()?;

        let message = SignedBatchedCall {
            batchedCall: BatchedCall {
                calls,
                revertOnFailure: self.config.revert_on_failure,
            },
            nonce,
            keyHash: calibur::ROOT_KEY_HASH,
            executor: Address::ZERO,
            deadline: U256::ZERO,
        };

        let domain = self.domain(chain_id, account);
        let signing_hash = message.eip712_signing_hash(&domain);
        let gas_limit = GasEstimator::batch_gas_limit(items, self.config.gas_overhead)?;

        Ok(PreparedBatch {
            chain_id,
            account,
            message,
            signing_hash,
            gas_limit,
        })
    }

    fn domain(&self, chain_id: u64, account: Address) -> alloy_sol_types::Eip712Domain {
        calibur::domain(
            &self.config.domain_name,
            &self.config.domain_version,
            chain_id,
            account,
            self.config.implementation,
        )
    }

    /// Typed-data signature item the wallet signs
    pub fn signature_item(&self, prepared: &PreparedBatch) -> StepItem {
        let domain = self.domain(prepared.chain_id, prepared.account);
        let (domain, types, value) = calibur::typed_data(&domain, &prepared.message);

        StepItem {
            status: QuoteItemStatus::Incomplete,
            data: ItemData::Signature(SignatureData {
                sign: SignData::Eip712 {
                    domain,
                    types,
                    primary_type: calibur::PRIMARY_TYPE.to_string(),
                    value,
                },
                post: None,
            }),
            check: None,
            request_id: None,
            batchable: false,
        }
    }

    /// `execute` calldata carrying the wallet's signature
    pub fn execute_calldata(&self, prepared: &PreparedBatch, signature: &str) -> ExecutorResult<Bytes> {
        let signature = decode_hex(signature)?;
        Ok(calibur::execute_calldata(
            prepared.message.clone(),
            Bytes::from(signature),
        ))
    }

    /// Sign once and submit, returning the single hash shared by every item
    pub async fn execute(
        &self,
        wallet: &dyn AdaptedWallet,
        step: &Step,
        items: &[StepItem],
        chain_id: u64,
        relay: Option<&dyn SolverApi>,
        cancel: &CancelSignal,
    ) -> ExecutorResult<BatchSubmission> {
        let account = cancel.guard(wallet.address()).await?;
        let account = parse_address(&account)?;

        let nonce = cancel.guard(async { Ok(self.read_sequence(chain_id, account).await) }).await?;
        let prepared = self.prepare(chain_id, account, items, nonce)?;
        debug!(
            "Prepared batch of {} calls for {} on chain {} (seq {}, gas {})",
            items.len(),
            account,
            chain_id,
            nonce,
            prepared.gas_limit
        );

        let sig_item = self.signature_item(&prepared);
        let sig_step = Step {
            id: format!("{}-authorize", step.id),
            action: step.action.clone(),
            description: step.description.clone(),
            kind: StepKind::Signature,
            request_id: step.request_id.clone(),
            deposit_like: false,
            fast_fill: false,
            items: vec![sig_item.clone()],
        };
        let signature = cancel
            .guard(wallet.handle_sign_message_step(&sig_item, &sig_step))
            .await?
            .ok_or_else(|| ExecutorError::Wallet("wallet returned no batch signature".to_string()))?;

        let calldata = self.execute_calldata(&prepared, &signature)?;
        let calldata_hex = format!("0x{}", hex::encode(&calldata));

        let (tx_hash, relayed) = match relay {
            Some(api) => {
                let request = BatchRelayRequest {
                    chain_id,
                    to: account.to_checksum(None),
                    data: calldata_hex,
                    value: "0".to_string(),
                    request_id: items
                        .iter()
                        .find_map(|i| i.effective_request_id(step))
                        .map(str::to_string),
                };
                let response = cancel.guard(api.relay_batch(&request)).await?;
                (response.tx_hash, true)
            }
            None => {
                let tx_item = StepItem {
                    status: QuoteItemStatus::Incomplete,
                    data: ItemData::Transaction(TransactionData {
                        chain_id,
                        from: Some(account.to_checksum(None)),
                        to: Some(account.to_checksum(None)),
                        value: Some("0".to_string()),
                        data: Some(calldata_hex),
                        gas: Some(prepared.gas_limit.to_string()),
                        ..TransactionData::default()
                    }),
                    check: None,
                    request_id: None,
                    batchable: false,
                };
                let tx_step = Step {
                    items: vec![tx_item.clone()],
                    ..step.clone()
                };
                let hash = cancel
                    .guard(wallet.handle_send_transaction_step(chain_id, &tx_item, &tx_step))
                    .await?
                    .ok_or_else(|| {
                        ExecutorError::Wallet("wallet returned no batch transaction hash".to_string())
                    })?;
                (hash, false)
            }
        };

        info!(
            "Submitted batch of {} calls on chain {}: {} (relayed: {})",
            items.len(),
            chain_id,
            tx_hash,
            relayed
        );

        Ok(BatchSubmission {
            tx_hash,
            gas_limit: prepared.gas_limit,
            nonce,
            relayed,
        })
    }
}

fn to_call(chain_id: u64, item: &StepItem) -> ExecutorResult<Call> {
    let tx = item
        .transaction()
        .ok_or_else(|| ExecutorError::InvalidQuote("batch item is not a transaction".to_string()))?;

    if tx.chain_id != chain_id {
        return Err(ExecutorError::InvalidQuote(format!(
            "batch mixes chains {} and {}",
            chain_id, tx.chain_id
        )));
    }

    let to = tx
        .to
        .as_deref()
        .ok_or_else(|| ExecutorError::InvalidQuote("batch call has no target".to_string()))?;

    Ok(Call {
        to: parse_address(to)?,
        value: tx.value_wei()?,
        data: Bytes::from(decode_hex(tx.data.as_deref().unwrap_or("0x"))?),
    })
}

fn parse_address(input: &str) -> ExecutorResult<Address> {
    Address::from_str(input)
        .map_err(|e| ExecutorError::Encoding(format!("invalid address {}: {}", input, e)))
}

fn decode_hex(input: &str) -> ExecutorResult<Vec<u8>> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(stripped).map_err(|e| ExecutorError::Encoding(format!("invalid hex: {}", e)))
}
