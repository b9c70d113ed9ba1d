//! Quote Executor - client-side step execution for multi-chain swap and bridge quotes
//!
//! Interprets a quote's ordered steps, asks a wallet to sign or send each item,
//! waits for on-chain confirmation and for the solver to fill, and optionally
//! folds batchable calls into one gasless EIP-712 signed batch.

pub mod api;
pub mod batch;
pub mod chain;
pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod quote;
pub mod tx;
pub mod wallet;

pub use api::{HttpSolverApi, SolverApi};
pub use error::{ExecutorError, ExecutorResult};
pub use execution::{
    cancel_pair, CancelHandle, CancelSignal, ExecuteOptions, Execution, ItemStatus, Progress,
    StepExecutor,
};
pub use quote::Execute;
pub use wallet::{AdaptedWallet, EthersWallet, WalletCapabilities};
