//! Error types for the quote executor

use crate::quote::Receipt;
use thiserror::Error;

/// Main error type for quote execution
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// A submitted transaction did not reach a successful terminal receipt
    #[error("Transaction {tx_hash} on chain {chain_id} failed to confirm: {message}")]
    TransactionConfirmation {
        chain_id: u64,
        tx_hash: String,
        message: String,
        /// Last receipt observed, if the chain produced one
        receipt: Option<Box<Receipt>>,
        /// Revert reason from the diagnostic trace lookup
        revert_reason: Option<String>,
    },

    #[error("Deposit transaction {tx_hash:?} for request {request_id} not indexed after {attempts} attempts")]
    DepositTransactionTimeout {
        tx_hash: Option<String>,
        request_id: String,
        attempts: u32,
    },

    #[error("Solver did not complete request {request_id} (tx {tx_hash:?}) after {attempts} attempts")]
    SolverStatusTimeout {
        tx_hash: Option<String>,
        request_id: String,
        attempts: u32,
    },

    #[error("Solver reported {status} for request {request_id}: {details}")]
    SolverFailed {
        request_id: String,
        status: String,
        details: String,
    },

    #[error("API error from {endpoint}: HTTP {status}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Wallet does not support {capability}")]
    UnsupportedCapability { capability: &'static str },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid quote: {0}")]
    InvalidQuote(String),

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u64,
        have: String,
        need: String,
    },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Step {step} item {item} already failed: {reason}")]
    ItemFailed {
        step: usize,
        item: usize,
        reason: String,
    },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Stable short tag for progress reporting
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::TransactionConfirmation { .. } => "transaction_confirmation",
            ExecutorError::DepositTransactionTimeout { .. } => "deposit_transaction_timeout",
            ExecutorError::SolverStatusTimeout { .. } => "solver_status_timeout",
            ExecutorError::SolverFailed { .. } => "solver_failed",
            ExecutorError::Api { .. } => "api",
            ExecutorError::Http(_) => "http",
            ExecutorError::Wallet(_) => "wallet",
            ExecutorError::UnsupportedCapability { .. } => "unsupported_capability",
            ExecutorError::InvalidStateTransition { .. } => "invalid_state_transition",
            ExecutorError::InvalidQuote(_) => "invalid_quote",
            ExecutorError::InsufficientBalance { .. } => "insufficient_balance",
            ExecutorError::ChainNotFound { .. } => "chain_not_found",
            ExecutorError::ChainConnection { .. } => "chain_connection",
            ExecutorError::Encoding(_) => "encoding",
            ExecutorError::Config(_) => "config",
            ExecutorError::Timeout { .. } => "timeout",
            ExecutorError::ItemFailed { .. } => "item_failed",
            ExecutorError::Cancelled => "cancelled",
            ExecutorError::Internal(_) => "internal",
        }
    }

    /// Check if resuming the same execution may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutorError::DepositTransactionTimeout { .. }
                | ExecutorError::SolverStatusTimeout { .. }
                | ExecutorError::ChainConnection { .. }
                | ExecutorError::Timeout { .. }
                | ExecutorError::Http(_)
                | ExecutorError::Cancelled
        )
    }
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;
