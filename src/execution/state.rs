//! Execution-state table
//!
//! Runtime status for every (step, item) of one quote. The quote itself stays
//! immutable; callers observe this table only through [`Progress`] snapshots.

use crate::error::{ExecutorError, ExecutorResult};
use crate::quote::{Execute, QuoteItemStatus, Receipt, StepKind};

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Signing,
    Sending,
    Submitted,
    Confirming,
    Confirmed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Confirmed | ItemStatus::Failed)
    }

    /// A hash or signature exists and the outcome is still open
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ItemStatus::Submitted | ItemStatus::Confirming)
    }

    fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Signing)
                | (Pending, Sending)
                | (Signing, Submitted)
                | (Signing, Confirmed)
                | (Signing, Failed)
                | (Sending, Submitted)
                | (Sending, Failed)
                | (Submitted, Confirming)
                | (Submitted, Failed)
                | (Confirming, Confirmed)
                | (Confirming, Failed)
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Signing => "signing",
            ItemStatus::Sending => "sending",
            ItemStatus::Submitted => "submitted",
            ItemStatus::Confirming => "confirming",
            ItemStatus::Confirmed => "confirmed",
            ItemStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A submitted transaction hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub tx_hash: String,
    pub chain_id: u64,
    /// Shared by every item of an atomic batch
    pub is_batch: bool,
}

/// Runtime annotations for one step item
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemState {
    pub status: ItemStatus,
    pub tx_hashes: Vec<TxRecord>,
    pub signature: Option<String>,
    pub receipt: Option<Receipt>,
    pub error: Option<String>,
    /// Last status string reported by the solver
    pub solver_status: Option<String>,
}

impl ItemState {
    fn new(status: ItemStatus) -> Self {
        Self {
            status,
            tx_hashes: Vec::new(),
            signature: None,
            receipt: None,
            error: None,
            solver_status: None,
        }
    }

    /// Latest hash recorded for this item
    pub fn current_tx(&self) -> Option<&TxRecord> {
        self.tx_hashes.last()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&ExecutorError> for ProgressError {
    fn from(err: &ExecutorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepProgress {
    pub id: String,
    pub kind: StepKind,
    pub items: Vec<ItemState>,
}

/// Read-only snapshot pushed to the progress observer after every transition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub execution_id: Uuid,
    pub steps: Vec<StepProgress>,
    pub current_step: Option<usize>,
    pub current_step_item: Option<usize>,
    pub tx_hashes: Vec<TxRecord>,
    pub error: Option<ProgressError>,
}

impl Progress {
    pub fn item_status(&self, step: usize, item: usize) -> Option<ItemStatus> {
        self.steps
            .get(step)
            .and_then(|s| s.items.get(item))
            .map(|i| i.status)
    }

    pub fn current_item_status(&self) -> Option<ItemStatus> {
        self.item_status(self.current_step?, self.current_step_item?)
    }
}

/// Status table keyed by (step index, item index)
#[derive(Debug, Clone)]
pub struct ExecutionState {
    items: Vec<Vec<ItemState>>,
    active_confirmations: HashSet<String>,
}

impl ExecutionState {
    /// Seed from the quote; items the quote already marks complete start confirmed
    pub fn new(quote: &Execute) -> Self {
        let items = quote
            .steps
            .iter()
            .map(|step| {
                step.items
                    .iter()
                    .map(|item| match item.status {
                        QuoteItemStatus::Complete => ItemState::new(ItemStatus::Confirmed),
                        QuoteItemStatus::Incomplete => ItemState::new(ItemStatus::Pending),
                    })
                    .collect()
            })
            .collect();

        Self {
            items,
            active_confirmations: HashSet::new(),
        }
    }

    pub fn item(&self, step: usize, item: usize) -> Option<&ItemState> {
        self.items.get(step).and_then(|s| s.get(item))
    }

    fn item_mut(&mut self, step: usize, item: usize) -> ExecutorResult<&mut ItemState> {
        self.items
            .get_mut(step)
            .and_then(|s| s.get_mut(item))
            .ok_or_else(|| ExecutorError::Internal(format!("no item at {}/{}", step, item)))
    }

    pub fn status(&self, step: usize, item: usize) -> Option<ItemStatus> {
        self.item(step, item).map(|i| i.status)
    }

    /// Move an item forward; rejects any transition that is not monotonic
    pub fn transition(&mut self, step: usize, item: usize, next: ItemStatus) -> ExecutorResult<()> {
        let state = self.item_mut(step, item)?;
        if !state.status.can_transition_to(next) {
            return Err(ExecutorError::InvalidStateTransition {
                from: state.status.to_string(),
                to: next.to_string(),
            });
        }

        debug!("Item {}/{}: {} -> {}", step, item, state.status, next);
        state.status = next;
        Ok(())
    }

    /// Return an item that failed before anything was submitted to `pending`
    pub fn reset_unsubmitted_failure(&mut self, step: usize, item: usize) -> ExecutorResult<bool> {
        let state = self.item_mut(step, item)?;
        let unsubmitted = state.tx_hashes.is_empty() && state.signature.is_none();
        if state.status == ItemStatus::Failed && unsubmitted {
            state.status = ItemStatus::Pending;
            state.error = None;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn record_tx(&mut self, step: usize, item: usize, record: TxRecord) -> ExecutorResult<()> {
        self.item_mut(step, item)?.tx_hashes.push(record);
        Ok(())
    }

    /// Rewrite a replaced hash in place so later reporting uses the final hash
    pub fn replace_tx(
        &mut self,
        step: usize,
        item: usize,
        old_hash: &str,
        new_hash: &str,
    ) -> ExecutorResult<()> {
        let state = self.item_mut(step, item)?;
        for record in state.tx_hashes.iter_mut() {
            if record.tx_hash == old_hash {
                record.tx_hash = new_hash.to_string();
            }
        }
        Ok(())
    }

    pub fn set_signature(&mut self, step: usize, item: usize, signature: String) -> ExecutorResult<()> {
        self.item_mut(step, item)?.signature = Some(signature);
        Ok(())
    }

    pub fn set_receipt(&mut self, step: usize, item: usize, receipt: Receipt) -> ExecutorResult<()> {
        self.item_mut(step, item)?.receipt = Some(receipt);
        Ok(())
    }

    pub fn set_solver_status(&mut self, step: usize, item: usize, status: &str) -> ExecutorResult<()> {
        self.item_mut(step, item)?.solver_status = Some(status.to_string());
        Ok(())
    }

    pub fn set_error(&mut self, step: usize, item: usize, error: &ExecutorError) -> ExecutorResult<()> {
        self.item_mut(step, item)?.error = Some(error.to_string());
        Ok(())
    }

    /// Claim the single confirmation slot for a hash
    pub fn begin_confirmation(&mut self, tx_hash: &str) -> ExecutorResult<()> {
        if !self.active_confirmations.insert(tx_hash.to_string()) {
            return Err(ExecutorError::Internal(format!(
                "confirmation already in progress for {}",
                tx_hash
            )));
        }
        Ok(())
    }

    pub fn end_confirmation(&mut self, tx_hash: &str) {
        self.active_confirmations.remove(tx_hash);
    }

    pub fn is_step_complete(&self, step: usize) -> bool {
        self.items
            .get(step)
            .map(|items| items.iter().all(|i| i.status == ItemStatus::Confirmed))
            .unwrap_or(false)
    }

    /// First item that still needs work, in plan order
    pub fn first_unconfirmed(&self) -> Option<(usize, usize)> {
        self.items.iter().enumerate().find_map(|(step, items)| {
            items
                .iter()
                .position(|i| i.status != ItemStatus::Confirmed)
                .map(|item| (step, item))
        })
    }

    pub fn is_complete(&self) -> bool {
        self.first_unconfirmed().is_none()
    }

    /// Every hash recorded so far, deduplicated, in submission order
    pub fn all_tx_hashes(&self) -> Vec<TxRecord> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .flatten()
            .flat_map(|i| i.tx_hashes.iter())
            .filter(|r| seen.insert(r.tx_hash.clone()))
            .cloned()
            .collect()
    }

    pub fn snapshot(
        &self,
        execution_id: Uuid,
        quote: &Execute,
        current: Option<(usize, usize)>,
        error: Option<&ExecutorError>,
    ) -> Progress {
        let steps = quote
            .steps
            .iter()
            .zip(self.items.iter())
            .map(|(step, items)| StepProgress {
                id: step.id.clone(),
                kind: step.kind,
                items: items.clone(),
            })
            .collect();

        Progress {
            execution_id,
            steps,
            current_step: current.map(|(s, _)| s),
            current_step_item: current.map(|(_, i)| i),
            tx_hashes: self.all_tx_hashes(),
            error: error.map(ProgressError::from),
        }
    }
}

/// One quote plus the runtime state the executor accumulates for it. Holding it
/// by `&mut` during `execute` gives the executor single-writer access; passing
/// the same value back in resumes from the first unconfirmed item.
#[derive(Debug, Clone)]
pub struct Execution {
    id: Uuid,
    quote: Execute,
    state: ExecutionState,
}

impl Execution {
    pub fn new(quote: Execute) -> ExecutorResult<Self> {
        quote.validate()?;
        let state = ExecutionState::new(&quote);
        Ok(Self {
            id: Uuid::new_v4(),
            quote,
            state,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn quote(&self) -> &Execute {
        &self.quote
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub(crate) fn parts_mut(&mut self) -> (&Execute, &mut ExecutionState) {
        (&self.quote, &mut self.state)
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn snapshot(&self) -> Progress {
        self.state
            .snapshot(self.id, &self.quote, self.state.first_unconfirmed(), None)
    }
}
