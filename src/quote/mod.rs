//! Quote data model
//!
//! The execution plan returned by the quote endpoint. A quote is an ordered list
//! of steps; each step groups the items that make up one logical action
//! (approve, deposit, relay, receive). The executor never mutates these types:
//! runtime status lives in the execution-state table (`crate::execution::state`).

use crate::error::{ExecutorError, ExecutorResult};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Blockchain execution environment family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Evm,
    Svm,
    Bvm,
    Tvm,
    Suivm,
    Hypevm,
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmType::Evm => "evm",
            VmType::Svm => "svm",
            VmType::Bvm => "bvm",
            VmType::Tvm => "tvm",
            VmType::Suivm => "suivm",
            VmType::Hypevm => "hypevm",
        };
        f.write_str(name)
    }
}

/// A complete execution plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execute {
    pub steps: Vec<Step>,
    /// Fee breakdown, opaque to the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fees: Option<Value>,
    /// Time estimates and amounts, opaque to the executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Terminal error reported by the quote source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub refunded: bool,
}

impl Execute {
    /// Parse a quote from its JSON wire form
    pub fn from_json(input: &str) -> ExecutorResult<Self> {
        let quote: Execute = serde_json::from_str(input)
            .map_err(|e| ExecutorError::InvalidQuote(e.to_string()))?;
        quote.validate()?;
        Ok(quote)
    }

    /// Check that every item carries data matching its step kind
    pub fn validate(&self) -> ExecutorResult<()> {
        if let Some(error) = &self.error {
            return Err(ExecutorError::InvalidQuote(format!(
                "quote carries terminal error: {}",
                error
            )));
        }

        for (step_index, step) in self.steps.iter().enumerate() {
            if step.items.is_empty() {
                return Err(ExecutorError::InvalidQuote(format!(
                    "step {} ({}) has no items",
                    step_index, step.id
                )));
            }

            for (item_index, item) in step.items.iter().enumerate() {
                let matches = matches!(
                    (&step.kind, &item.data),
                    (StepKind::Signature, ItemData::Signature(_))
                        | (StepKind::Transaction, ItemData::Transaction(_))
                );
                if !matches {
                    return Err(ExecutorError::InvalidQuote(format!(
                        "step {} item {} data does not match step kind {}",
                        step_index, item_index, step.kind
                    )));
                }
            }
        }

        Ok(())
    }

    /// Total number of items across all steps
    pub fn item_count(&self) -> usize {
        self.steps.iter().map(|s| s.items.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Signature,
    Transaction,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Signature => f.write_str("signature"),
            StepKind::Transaction => f.write_str("transaction"),
        }
    }
}

/// One logical action in the plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub kind: StepKind,
    /// Off-chain solver job this step feeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Completion depends on a solver fill after local confirmation
    #[serde(default)]
    pub deposit_like: bool,
    /// Request expedited settlement once the deposit confirms
    #[serde(default)]
    pub fast_fill: bool,
    pub items: Vec<StepItem>,
}

/// Completion marker carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteItemStatus {
    #[default]
    Incomplete,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepItem {
    #[serde(default)]
    pub status: QuoteItemStatus,
    pub data: ItemData,
    /// Item-specific status endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckEndpoint>,
    /// Overrides the step request id when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// May be combined with the step's other items into one atomic call
    #[serde(default)]
    pub batchable: bool,
}

impl StepItem {
    /// Request id for this item, falling back to the step's
    pub fn effective_request_id<'a>(&'a self, step: &'a Step) -> Option<&'a str> {
        self.request_id
            .as_deref()
            .or(step.request_id.as_deref())
    }

    pub fn transaction(&self) -> Option<&TransactionData> {
        match &self.data {
            ItemData::Transaction(tx) => Some(tx),
            ItemData::Signature(_) => None,
        }
    }

    pub fn signature(&self) -> Option<&SignatureData> {
        match &self.data {
            ItemData::Signature(sig) => Some(sig),
            ItemData::Transaction(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemData {
    Signature(SignatureData),
    Transaction(TransactionData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureData {
    pub sign: SignData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<PostData>,
}

/// Message to sign, by signature scheme
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signatureKind", rename_all = "lowercase")]
pub enum SignData {
    /// Raw personal message (hex `0x..` or UTF-8 text)
    Eip191 { message: String },
    /// Structured typed data
    Eip712 {
        domain: Value,
        types: Value,
        #[serde(rename = "primaryType")]
        primary_type: String,
        value: Value,
    },
}

/// Where to deliver a signature once obtained
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostData {
    pub endpoint: String,
    #[serde(default = "default_post_method")]
    pub method: String,
    #[serde(default)]
    pub body: Value,
}

fn default_post_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckEndpoint {
    pub endpoint: String,
    #[serde(default = "default_check_method")]
    pub method: String,
}

fn default_check_method() -> String {
    "GET".to_string()
}

/// VM-native call parameters. Non-EVM payloads (instructions, PSBTs) ride in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionData {
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TransactionData {
    /// Native value attached to the call, zero when absent
    pub fn value_wei(&self) -> ExecutorResult<U256> {
        match &self.value {
            Some(v) => parse_quantity(v),
            None => Ok(U256::ZERO),
        }
    }

    /// Gas hint, if the quote supplied one
    pub fn gas_limit(&self) -> ExecutorResult<Option<U256>> {
        self.gas.as_deref().map(parse_quantity).transpose()
    }
}

/// Parse a `0x`-prefixed hex or decimal quantity
pub fn parse_quantity(input: &str) -> ExecutorResult<U256> {
    let trimmed = input.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some("") => Ok(U256::ZERO),
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(trimmed, 10),
    };
    parsed.map_err(|e| ExecutorError::InvalidQuote(format!("invalid quantity {:?}: {}", input, e)))
}

/// VM-specific success record returned by a wallet confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "vm", rename_all = "lowercase")]
pub enum Receipt {
    Evm {
        transaction_hash: String,
        block_number: u64,
        /// 1 = success, 0 = reverted
        status: u64,
        gas_used: Option<String>,
    },
    Svm {
        signature: String,
        slot: u64,
        err: Option<String>,
    },
    Bvm {
        txid: String,
        block_height: Option<u64>,
        confirmations: u64,
    },
    Tvm {
        txid: String,
        block_number: u64,
        /// Contract execution result, `SUCCESS` on success
        result: String,
    },
}

impl Receipt {
    pub fn tx_hash(&self) -> &str {
        match self {
            Receipt::Evm { transaction_hash, .. } => transaction_hash,
            Receipt::Svm { signature, .. } => signature,
            Receipt::Bvm { txid, .. } => txid,
            Receipt::Tvm { txid, .. } => txid,
        }
    }

    /// VM-specific failure code, `None` when the receipt records success
    pub fn failure_code(&self) -> Option<String> {
        match self {
            Receipt::Evm { status, .. } if *status == 0 => Some("reverted".to_string()),
            Receipt::Evm { .. } => None,
            Receipt::Svm { err, .. } => err.clone(),
            Receipt::Bvm { .. } => None,
            Receipt::Tvm { result, .. } if result != "SUCCESS" => Some(result.clone()),
            Receipt::Tvm { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure_code().is_none()
    }
}
