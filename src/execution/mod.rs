//! Execution module - runs a quote's steps against a wallet
//!
//! This module provides:
//! - The step executor and its per-item state machine
//! - The execution-state table and progress snapshots
//! - Confirmation and solver status polling
//! - Caller cancellation

pub mod cancel;
pub mod confirm;
pub mod engine;
pub mod solver;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use confirm::{ConfirmationPoller, Confirmed, RpcTraceLookup, TraceLookup};
pub use engine::{ExecuteOptions, ProgressObserver, StepExecutor};
pub use solver::{SolverOutcome, SolverStatusPoller, StatusPollConfig};
pub use state::{
    Execution, ExecutionState, ItemState, ItemStatus, Progress, ProgressError, StepProgress,
    TxRecord,
};
