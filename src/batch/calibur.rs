//! Calibur-style batch executor ABI
//!
//! The delegated account exposes `execute(SignedBatchedCall, bytes)` and
//! `getSeq(uint256)`. Signatures are EIP-712 over `SignedBatchedCall` in a
//! domain whose verifying contract is the user's own account and whose salt is
//! the implementation address.

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, Eip712Domain, SolCall, SolValue};
use serde_json::{json, Value};
use std::borrow::Cow;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct Call {
        address to;
        uint256 value;
        bytes data;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct BatchedCall {
        Call[] calls;
        bool revertOnFailure;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct SignedBatchedCall {
        BatchedCall batchedCall;
        uint256 nonce;
        bytes32 keyHash;
        address executor;
        uint256 deadline;
    }

    function execute(SignedBatchedCall signedBatchedCall, bytes wrappedSignature) external payable;

    function getSeq(uint256 key) external view returns (uint256 seq);
}

pub const DOMAIN_NAME: &str = "Calibur";
pub const DOMAIN_VERSION: &str = "1.0.0";
pub const PRIMARY_TYPE: &str = "SignedBatchedCall";

/// Key hash meaning "the account owner's own key"
pub const ROOT_KEY_HASH: B256 = B256::ZERO;

pub fn domain(
    name: &str,
    version: &str,
    chain_id: u64,
    account: Address,
    implementation: Address,
) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Owned(name.to_string())),
        Some(Cow::Owned(version.to_string())),
        Some(U256::from(chain_id)),
        Some(account),
        Some(implementation.into_word()),
    )
}

/// Calldata for `getSeq(key)`
pub fn get_seq_calldata(key: U256) -> Bytes {
    getSeqCall { key }.abi_encode().into()
}

pub fn decode_seq(data: &[u8]) -> Option<U256> {
    getSeqCall::abi_decode_returns(data, true)
        .ok()
        .map(|r| r.seq)
}

/// Calldata for `execute(signedBatchedCall, abi.encode(signature, hookData))`
pub fn execute_calldata(message: SignedBatchedCall, signature: Bytes) -> Bytes {
    let wrapped = (signature, Bytes::new()).abi_encode_params();
    executeCall {
        signedBatchedCall: message,
        wrappedSignature: wrapped.into(),
    }
    .abi_encode()
    .into()
}

fn hex_bytes(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}

/// JSON typed-data form of `message`, as handed to wallets for signing
pub fn typed_data(domain: &Eip712Domain, message: &SignedBatchedCall) -> (Value, Value, Value) {
    let domain_json = json!({
        "name": domain.name.as_deref(),
        "version": domain.version.as_deref(),
        "chainId": domain.chain_id.map(|c| c.to::<u64>()),
        "verifyingContract": domain.verifying_contract.map(|a| a.to_checksum(None)),
        "salt": domain.salt.map(|s| hex_bytes(s.as_slice())),
    });

    let types = json!({
        "SignedBatchedCall": [
            { "name": "batchedCall", "type": "BatchedCall" },
            { "name": "nonce", "type": "uint256" },
            { "name": "keyHash", "type": "bytes32" },
            { "name": "executor", "type": "address" },
            { "name": "deadline", "type": "uint256" }
        ],
        "BatchedCall": [
            { "name": "calls", "type": "Call[]" },
            { "name": "revertOnFailure", "type": "bool" }
        ],
        "Call": [
            { "name": "to", "type": "address" },
            { "name": "value", "type": "uint256" },
            { "name": "data", "type": "bytes" }
        ]
    });

    let calls: Vec<Value> = message
        .batchedCall
        .calls
        .iter()
        .map(|call| {
            json!({
                "to": call.to.to_checksum(None),
                "value": call.value.to_string(),
                "data": hex_bytes(&call.data),
            })
        })
        .collect();

    let value = json!({
        "batchedCall": {
            "calls": calls,
            "revertOnFailure": message.batchedCall.revertOnFailure,
        },
        "nonce": message.nonce.to_string(),
        "keyHash": hex_bytes(message.keyHash.as_slice()),
        "executor": message.executor.to_checksum(None),
        "deadline": message.deadline.to_string(),
    });

    (domain_json, types, value)
}
