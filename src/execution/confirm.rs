//! Confirmation poller
//!
//! Wraps a wallet's own confirmation wait. The wallet decides how to poll its
//! node; this layer tracks replacement hashes and honours caller cancellation.
//! Reverts, on-chain cancellations and non-retryable wallet errors become
//! `TransactionConfirmation`, enriched with a revert reason when a trace
//! endpoint is available. Retryable wallet errors (timeouts, connection loss)
//! pass through unchanged so the item can be resumed.

use super::cancel::CancelSignal;
use crate::error::{ExecutorError, ExecutorResult};
use crate::quote::Receipt;
use crate::wallet::{AdaptedWallet, ConfirmationEvents};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on how long error reporting waits for a trace
const TRACE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Optional call-trace source used to explain reverts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TraceLookup: Send + Sync {
    /// Human-readable revert reason, `None` when unavailable
    async fn revert_reason(&self, chain_id: u64, tx_hash: &str) -> Option<String>;
}

/// Successful confirmation
#[derive(Debug, Clone)]
pub struct Confirmed {
    /// Final hash after any replacement
    pub tx_hash: String,
    pub receipt: Receipt,
    pub replaced: bool,
}

#[derive(Clone, Default)]
pub struct ConfirmationPoller {
    trace: Option<Arc<dyn TraceLookup>>,
}

impl ConfirmationPoller {
    pub fn new(trace: Option<Arc<dyn TraceLookup>>) -> Self {
        Self { trace }
    }

    /// Wait for `tx_hash` to finalize through the wallet
    ///
    /// `events` is owned by the caller so a replacement reported before a
    /// failure is still visible afterwards.
    pub async fn confirm(
        &self,
        wallet: &dyn AdaptedWallet,
        chain_id: u64,
        tx_hash: &str,
        events: &ConfirmationEvents,
        cancel: &CancelSignal,
    ) -> ExecutorResult<Confirmed> {
        debug!("Waiting for {} on chain {}", tx_hash, chain_id);

        let outcome = cancel
            .guard(wallet.handle_confirm_transaction_step(tx_hash, chain_id, events))
            .await;

        let replacement = events.replacement();
        let final_hash = replacement.clone().unwrap_or_else(|| tx_hash.to_string());
        if let Some(new_hash) = &replacement {
            info!("Transaction {} replaced by {} on chain {}", tx_hash, new_hash, chain_id);
        }

        if let Err(ExecutorError::Cancelled) = outcome {
            return Err(ExecutorError::Cancelled);
        }

        if events.is_cancelled() {
            warn!("Transaction {} cancelled on chain {}", final_hash, chain_id);
            return Err(ExecutorError::TransactionConfirmation {
                chain_id,
                tx_hash: final_hash,
                message: "transaction was cancelled".to_string(),
                receipt: outcome.ok().map(Box::new),
                revert_reason: None,
            });
        }

        match outcome {
            Ok(receipt) => match receipt.failure_code() {
                None => Ok(Confirmed {
                    tx_hash: final_hash,
                    receipt,
                    replaced: replacement.is_some(),
                }),
                Some(code) => Err(self
                    .failure(chain_id, final_hash, code, Some(receipt))
                    .await),
            },
            Err(e) if e.is_retryable() => {
                warn!("Confirmation of {} on chain {} interrupted: {}", final_hash, chain_id, e);
                Err(e)
            }
            Err(e) => Err(self.failure(chain_id, final_hash, e.to_string(), None).await),
        }
    }

    async fn failure(
        &self,
        chain_id: u64,
        tx_hash: String,
        message: String,
        receipt: Option<Receipt>,
    ) -> ExecutorError {
        let revert_reason = match &self.trace {
            Some(trace) => {
                tokio::time::timeout(TRACE_LOOKUP_TIMEOUT, trace.revert_reason(chain_id, &tx_hash))
                    .await
                    .unwrap_or(None)
            }
            None => None,
        };

        warn!(
            "Transaction {} failed on chain {}: {} ({:?})",
            tx_hash, chain_id, message, revert_reason
        );

        ExecutorError::TransactionConfirmation {
            chain_id,
            tx_hash,
            message,
            receipt: receipt.map(Box::new),
            revert_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
}

/// `callTracer` frame; only the failure fields are read
#[derive(Debug, Deserialize)]
struct CallFrame {
    #[serde(default, rename = "revertReason")]
    revert_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    calls: Vec<CallFrame>,
}

impl CallFrame {
    /// Innermost explicit revert reason, else the top-level error
    fn reason(&self) -> Option<String> {
        self.calls
            .iter()
            .find_map(|c| c.revert_reason.clone().or_else(|| c.reason()))
            .or_else(|| self.revert_reason.clone())
            .or_else(|| self.error.clone())
    }
}

/// [`TraceLookup`] over `debug_traceTransaction` on per-chain trace nodes
pub struct RpcTraceLookup {
    client: Client,
    endpoints: HashMap<u64, String>,
}

impl RpcTraceLookup {
    pub fn new(endpoints: HashMap<u64, String>, timeout: Duration) -> ExecutorResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl TraceLookup for RpcTraceLookup {
    async fn revert_reason(&self, chain_id: u64, tx_hash: &str) -> Option<String> {
        let url = self.endpoints.get(&chain_id)?;
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "debug_traceTransaction",
            "params": [tx_hash, { "tracer": "callTracer" }],
        });

        let response = match self.client.post(url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Trace lookup for {} failed: {}", tx_hash, e);
                return None;
            }
        };

        let parsed: JsonRpcResponse<CallFrame> = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Trace response for {} unreadable: {}", tx_hash, e);
                return None;
            }
        };

        parsed.result.and_then(|frame| frame.reason())
    }
}
