//! Step executor
//!
//! Drives one [`Execution`] through its steps strictly in order. Each item moves
//! `pending -> signing|sending -> submitted -> confirming -> confirmed`, or ends
//! in `failed`. A progress snapshot is pushed to the observer after every
//! transition, including the failing one. Calling `execute` again on the same
//! execution resumes at the first unconfirmed item: in-flight items are
//! re-confirmed from their recorded hash, never resent.

use super::cancel::CancelSignal;
use super::confirm::{ConfirmationPoller, TraceLookup};
use super::solver::{SolverStatusPoller, StatusPollConfig};
use super::state::{Execution, ExecutionState, ItemStatus, Progress, TxRecord};
use crate::api::{FastFillRequest, SolverApi, StatusQuery};
use crate::batch::{BatchExecutor, BatchExecutorConfig};
use crate::error::{ExecutorError, ExecutorResult};
use crate::metrics;
use crate::quote::{Execute, Step, StepKind};
use crate::wallet::{AdaptedWallet, ConfirmationEvents, WalletCapabilities};

use alloy_primitives::U256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Receives a snapshot after every state transition
pub type ProgressObserver = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Caller choices for one execution
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Combine batchable items of a step into one atomic submission
    pub atomic_batch: bool,
    /// Gasless scheme to use for atomic batches
    pub batch_executor: Option<Arc<BatchExecutorConfig>>,
    /// Submit gasless batches through the backend instead of the wallet
    pub relay_batches: bool,
    /// Allow fast-fill requests on steps that ask for them
    pub fast_fill: bool,
    /// Input amount forwarded with fast-fill requests
    pub solver_input_currency_amount: Option<String>,
    /// Intervals and attempt budgets for solver status polling
    pub status_poll: StatusPollConfig,
    /// Aborts the run at the next wait point when fired
    pub cancel: CancelSignal,
    /// Called with a progress snapshot after every state change
    pub on_progress: Option<ProgressObserver>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            atomic_batch: false,
            batch_executor: None,
            relay_batches: true,
            fast_fill: true,
            solver_input_currency_amount: None,
            status_poll: StatusPollConfig::default(),
            cancel: CancelSignal::never(),
            on_progress: None,
        }
    }
}

impl ExecuteOptions {
    pub fn with_progress(mut self, observer: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(observer));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct StepExecutor {
    api: Arc<dyn SolverApi>,
    confirmations: ConfirmationPoller,
}

impl StepExecutor {
    pub fn new(api: Arc<dyn SolverApi>) -> Self {
        Self {
            api,
            confirmations: ConfirmationPoller::default(),
        }
    }

    /// Enrich confirmation failures with revert reasons
    pub fn with_trace(mut self, trace: Arc<dyn TraceLookup>) -> Self {
        self.confirmations = ConfirmationPoller::new(Some(trace));
        self
    }

    /// Run (or resume) `execution` to completion
    pub async fn execute(
        &self,
        execution: &mut Execution,
        wallet: &dyn AdaptedWallet,
        options: &ExecuteOptions,
    ) -> ExecutorResult<Progress> {
        let execution_id = execution.id();
        let span = info_span!("execute", execution_id = %execution_id);

        async move {
            let (quote, state) = execution.parts_mut();
            info!(
                "Executing {} steps ({} items) with {} wallet",
                quote.steps.len(),
                quote.item_count(),
                wallet.vm_type()
            );

            let mut run = Run {
                api: self.api.as_ref(),
                confirmations: &self.confirmations,
                solver: SolverStatusPoller::new(self.api.clone(), options.status_poll.clone()),
                wallet,
                options,
                capabilities: wallet.capabilities(),
                atomic_support: HashMap::new(),
                execution_id,
                quote,
                state,
            };

            run.run().await?;

            info!("Execution complete");
            let progress = run.snapshot(None, None);
            run.publish(&progress);
            Ok(progress)
        }
        .instrument(span)
        .await
    }
}

/// Where a resumed item picks up
enum ItemStart {
    Done,
    Fresh,
    InFlight(Option<TxRecord>),
}

enum BatchRoute {
    Gasless(Arc<BatchExecutorConfig>),
    Wallet,
}

/// Single-call execution context
struct Run<'a> {
    api: &'a dyn SolverApi,
    confirmations: &'a ConfirmationPoller,
    solver: SolverStatusPoller,
    wallet: &'a dyn AdaptedWallet,
    options: &'a ExecuteOptions,
    /// Resolved once per call
    capabilities: WalletCapabilities,
    atomic_support: HashMap<u64, bool>,
    execution_id: Uuid,
    quote: &'a Execute,
    state: &'a mut ExecutionState,
}

impl<'a> Run<'a> {
    async fn run(&mut self) -> ExecutorResult<()> {
        let quote = self.quote;

        for (s, step) in quote.steps.iter().enumerate() {
            if self.state.is_step_complete(s) {
                debug!("Step {} ({}) already complete", s, step.id);
                continue;
            }

            info!("Starting step {} ({})", s, step.id);
            match step.kind {
                StepKind::Signature => {
                    for i in 0..step.items.len() {
                        self.check_cancelled(s, i)?;
                        let result = self.signature_item(s, i).await;
                        self.finish(s, &[i], result)?;
                    }
                }
                StepKind::Transaction => self.transaction_step(s).await?,
            }
            info!("Step {} ({}) complete", s, step.id);
        }

        Ok(())
    }

    fn check_cancelled(&self, s: usize, i: usize) -> ExecutorResult<()> {
        if self.options.cancel.is_cancelled() {
            let err = ExecutorError::Cancelled;
            self.emit(Some((s, i)), Some(&err));
            return Err(err);
        }
        Ok(())
    }

    /// Record a failed unit of work on `items` before handing the error back
    fn finish(&mut self, s: usize, items: &[usize], result: ExecutorResult<()>) -> ExecutorResult<()> {
        if let Err(err) = &result {
            self.record_failure(s, items, err);
        }
        result
    }

    async fn transaction_step(&mut self, s: usize) -> ExecutorResult<()> {
        let quote = self.quote;
        let step = &quote.steps[s];
        let all: Vec<usize> = (0..step.items.len()).collect();

        if let Some((record, open)) = self.in_flight_batch(s) {
            info!("Resuming batch {} for step {}", record.tx_hash, step.id);
            self.check_cancelled(s, open[0])?;
            let result = self.settle(s, &open, record).await;
            return self.finish(s, &open, result);
        }

        if let Some(route) = self.batch_route(s).await? {
            self.check_cancelled(s, 0)?;
            let result = self.batch(s, route).await;
            return self.finish(s, &all, result);
        }

        for i in all {
            self.check_cancelled(s, i)?;
            let result = self.transaction_item(s, i).await;
            self.finish(s, &[i], result)?;
        }
        Ok(())
    }

    /// Classify an item before (re)starting it
    fn prepare_item(&mut self, s: usize, i: usize) -> ExecutorResult<ItemStart> {
        let (status, error, current) = {
            let item = self
                .state
                .item(s, i)
                .ok_or_else(|| ExecutorError::Internal(format!("no item at {}/{}", s, i)))?;
            (item.status, item.error.clone(), item.current_tx().cloned())
        };

        match status {
            ItemStatus::Confirmed => Ok(ItemStart::Done),
            ItemStatus::Pending => Ok(ItemStart::Fresh),
            ItemStatus::Submitted | ItemStatus::Confirming => Ok(ItemStart::InFlight(current)),
            ItemStatus::Signing | ItemStatus::Sending => {
                // Interrupted before a hash or signature was recorded
                warn!("Item {}/{} was interrupted while {}, retrying", s, i, status);
                self.state.transition(s, i, ItemStatus::Failed)?;
                self.retry_or_fail(s, i, error)
            }
            ItemStatus::Failed => self.retry_or_fail(s, i, error),
        }
    }

    fn retry_or_fail(&mut self, s: usize, i: usize, error: Option<String>) -> ExecutorResult<ItemStart> {
        if self.state.reset_unsubmitted_failure(s, i)? {
            info!("Retrying item {}/{} that failed before submission", s, i);
            self.emit(Some((s, i)), None);
            return Ok(ItemStart::Fresh);
        }

        Err(ExecutorError::ItemFailed {
            step: s,
            item: i,
            reason: error.unwrap_or_else(|| "failed after submission".to_string()),
        })
    }

    async fn signature_item(&mut self, s: usize, i: usize) -> ExecutorResult<()> {
        let quote = self.quote;
        let step = &quote.steps[s];
        let item = &step.items[i];
        let data = item.signature().ok_or_else(|| {
            ExecutorError::InvalidQuote(format!("item {}/{} has no signature data", s, i))
        })?;

        match self.prepare_item(s, i)? {
            ItemStart::Done => return Ok(()),
            ItemStart::InFlight(_) => {}
            ItemStart::Fresh => {
                self.transition(s, i, ItemStatus::Signing)?;

                let signature = self
                    .options
                    .cancel
                    .guard(self.wallet.handle_sign_message_step(item, step))
                    .await?
                    .ok_or_else(|| ExecutorError::Wallet("wallet returned no signature".to_string()))?;

                if let Some(post) = &data.post {
                    self.options
                        .cancel
                        .guard(self.api.post_signature(post, &signature))
                        .await?;
                    debug!("Posted signature for item {}/{} to {}", s, i, post.endpoint);
                }

                self.state.set_signature(s, i, signature)?;
                metrics::record_signature_collected();
                info!("Signed item {}/{} of step {}", s, i, step.id);

                if !self.awaits_solver(step, i) {
                    return self.transition(s, i, ItemStatus::Confirmed);
                }
                self.transition(s, i, ItemStatus::Submitted)?;
            }
        }

        if self.state.status(s, i) == Some(ItemStatus::Submitted) {
            self.transition(s, i, ItemStatus::Confirming)?;
        }
        self.await_solver(s, &[i], None, None).await?;
        self.transition(s, i, ItemStatus::Confirmed)
    }

    async fn transaction_item(&mut self, s: usize, i: usize) -> ExecutorResult<()> {
        let quote = self.quote;
        let step = &quote.steps[s];
        let item = &step.items[i];
        let tx = item.transaction().ok_or_else(|| {
            ExecutorError::InvalidQuote(format!("item {}/{} has no transaction data", s, i))
        })?;
        let chain_id = tx.chain_id;

        let record = match self.prepare_item(s, i)? {
            ItemStart::Done => return Ok(()),
            ItemStart::InFlight(Some(record)) => {
                info!("Resuming item {}/{} at {}", s, i, record.tx_hash);
                record
            }
            ItemStart::InFlight(None) => {
                return Err(ExecutorError::Internal(format!(
                    "item {}/{} is in flight without a hash",
                    s, i
                )))
            }
            ItemStart::Fresh => {
                self.transition(s, i, ItemStatus::Sending)?;
                self.ensure_chain(chain_id).await?;
                self.check_balance(chain_id, tx.value_wei()?).await?;

                let tx_hash = self
                    .options
                    .cancel
                    .guard(self.wallet.handle_send_transaction_step(chain_id, item, step))
                    .await?
                    .ok_or_else(|| {
                        ExecutorError::Wallet("wallet returned no transaction hash".to_string())
                    })?;

                metrics::record_item_submitted(chain_id, "transaction");
                info!("Submitted item {}/{} on chain {}: {}", s, i, chain_id, tx_hash);

                let record = TxRecord {
                    tx_hash,
                    chain_id,
                    is_batch: false,
                };
                self.state.record_tx(s, i, record.clone())?;
                self.transition(s, i, ItemStatus::Submitted)?;
                record
            }
        };

        self.settle(s, &[i], record).await
    }

    /// Batch route for a step, if every condition for atomic submission holds
    async fn batch_route(&mut self, s: usize) -> ExecutorResult<Option<BatchRoute>> {
        let quote = self.quote;
        let step = &quote.steps[s];
        if !self.options.atomic_batch || !self.capabilities.atomic_batch || step.items.len() < 2 {
            return Ok(None);
        }
        if !step.items.iter().all(|item| item.batchable) {
            return Ok(None);
        }

        let mut chain_ids = step.items.iter().filter_map(|i| i.transaction().map(|tx| tx.chain_id));
        let Some(chain_id) = chain_ids.next() else {
            return Ok(None);
        };
        if chain_ids.any(|c| c != chain_id) {
            return Ok(None);
        }

        // Only untouched steps start a new batch
        let untouched = (0..step.items.len()).all(|i| {
            self.state.item(s, i).map_or(false, |item| {
                item.status == ItemStatus::Pending
                    || (item.status == ItemStatus::Failed
                        && item.tx_hashes.is_empty()
                        && item.signature.is_none())
            })
        });
        if !untouched {
            return Ok(None);
        }

        if !self.supports_atomic_batch(chain_id).await? {
            return Ok(None);
        }

        if let Some(config) = &self.options.batch_executor {
            if self.gasless_eligible(chain_id).await? {
                return Ok(Some(BatchRoute::Gasless(config.clone())));
            }
        }

        if self.capabilities.batch_transactions {
            return Ok(Some(BatchRoute::Wallet));
        }

        Ok(None)
    }

    async fn supports_atomic_batch(&mut self, chain_id: u64) -> ExecutorResult<bool> {
        if let Some(&supported) = self.atomic_support.get(&chain_id) {
            return Ok(supported);
        }
        let supported = match self
            .options
            .cancel
            .guard(self.wallet.supports_atomic_batch(chain_id))
            .await
        {
            Ok(supported) => supported,
            Err(ExecutorError::Cancelled) => return Err(ExecutorError::Cancelled),
            Err(e) => {
                warn!("Atomic batch support check on chain {} failed: {}", chain_id, e);
                false
            }
        };
        self.atomic_support.insert(chain_id, supported);
        Ok(supported)
    }

    /// Plain EOAs and 7702-delegated accounts can run the batch contract
    async fn gasless_eligible(&self, chain_id: u64) -> ExecutorResult<bool> {
        if !self.capabilities.eoa_detection {
            return Ok(true);
        }
        match self.options.cancel.guard(self.wallet.is_eoa(chain_id)).await {
            Ok(status) => Ok(status.is_eoa || status.is_eip7702_delegated),
            Err(ExecutorError::Cancelled) => Err(ExecutorError::Cancelled),
            Err(e) => {
                warn!("Account check on chain {} failed, skipping gasless path: {}", chain_id, e);
                Ok(false)
            }
        }
    }

    async fn batch(&mut self, s: usize, route: BatchRoute) -> ExecutorResult<()> {
        let quote = self.quote;
        let step = &quote.steps[s];
        let indices: Vec<usize> = (0..step.items.len()).collect();

        for &i in &indices {
            if self.state.status(s, i) == Some(ItemStatus::Failed) {
                self.state.reset_unsubmitted_failure(s, i)?;
            }
            self.transition(s, i, ItemStatus::Sending)?;
        }

        let chain_id = step
            .items
            .iter()
            .find_map(|item| item.transaction().map(|tx| tx.chain_id))
            .ok_or_else(|| ExecutorError::InvalidQuote("batch step has no transactions".to_string()))?;

        self.ensure_chain(chain_id).await?;
        let mut total_value = U256::ZERO;
        for item in &step.items {
            if let Some(tx) = item.transaction() {
                total_value = total_value.saturating_add(tx.value_wei()?);
            }
        }
        self.check_balance(chain_id, total_value).await?;

        let tx_hash = match route {
            BatchRoute::Gasless(config) => {
                let relay = self.options.relay_batches.then_some(self.api);
                let submission = BatchExecutor::new(&config)
                    .execute(self.wallet, step, &step.items, chain_id, relay, &self.options.cancel)
                    .await?;
                debug!(
                    "Gasless batch for step {} uses gas limit {}",
                    step.id, submission.gas_limit
                );
                submission.tx_hash
            }
            BatchRoute::Wallet => self
                .options
                .cancel
                .guard(self.wallet.handle_batch_transaction_step(chain_id, &step.items))
                .await?
                .ok_or_else(|| ExecutorError::Wallet("wallet returned no batch hash".to_string()))?,
        };

        metrics::record_item_submitted(chain_id, "batch");
        info!(
            "Submitted {} items of step {} as one batch on chain {}: {}",
            indices.len(),
            step.id,
            chain_id,
            tx_hash
        );

        let record = TxRecord {
            tx_hash,
            chain_id,
            is_batch: true,
        };
        for &i in &indices {
            self.state.record_tx(s, i, record.clone())?;
            self.transition(s, i, ItemStatus::Submitted)?;
        }

        self.settle(s, &indices, record).await
    }

    /// A batch hash shared by every open item of the step
    fn in_flight_batch(&self, s: usize) -> Option<(TxRecord, Vec<usize>)> {
        let quote = self.quote;
        let step = &quote.steps[s];
        let open: Vec<usize> = (0..step.items.len())
            .filter(|&i| self.state.status(s, i) != Some(ItemStatus::Confirmed))
            .collect();

        let mut shared: Option<&TxRecord> = None;
        for &i in &open {
            let item = self.state.item(s, i)?;
            if !item.status.is_in_flight() {
                return None;
            }
            let record = item.current_tx().filter(|r| r.is_batch)?;
            match shared {
                Some(existing) if existing.tx_hash != record.tx_hash => return None,
                _ => shared = Some(record),
            }
        }

        shared.cloned().map(|record| (record, open))
    }

    /// Confirm a submitted hash, then wait for the solver where the step asks for it
    async fn settle(&mut self, s: usize, items: &[usize], record: TxRecord) -> ExecutorResult<()> {
        let quote = self.quote;
        let step = &quote.steps[s];

        for &i in items {
            if self.state.status(s, i) == Some(ItemStatus::Submitted) {
                self.transition(s, i, ItemStatus::Confirming)?;
            }
        }

        let locally_confirmed = items
            .iter()
            .all(|&i| self.state.item(s, i).map_or(false, |item| item.receipt.is_some()));

        let mut tx_hash = record.tx_hash.clone();
        if !locally_confirmed {
            self.state.begin_confirmation(&tx_hash)?;
            let started = Instant::now();
            let events = ConfirmationEvents::new();
            let result = self
                .confirmations
                .confirm(self.wallet, record.chain_id, &tx_hash, &events, &self.options.cancel)
                .await;
            self.state.end_confirmation(&tx_hash);

            // A replacement seen before a failure still moves the item to the new hash
            if let Some(final_hash) = events.replacement().filter(|h| *h != tx_hash) {
                for &i in items {
                    self.state.replace_tx(s, i, &tx_hash, &final_hash)?;
                }
                tx_hash = final_hash;
            }

            let confirmed = result?;
            metrics::record_confirmation_latency(record.chain_id, started.elapsed().as_secs_f64());
            for &i in items {
                self.state.set_receipt(s, i, confirmed.receipt.clone())?;
            }
            info!("Transaction {} confirmed on chain {}", tx_hash, record.chain_id);
            self.emit(Some((s, items[0])), None);

            self.request_fast_fill(step, items).await;
        }

        self.await_solver(s, items, Some(&tx_hash), Some(record.chain_id))
            .await?;

        for &i in items {
            self.transition(s, i, ItemStatus::Confirmed)?;
            metrics::record_item_confirmed(record.chain_id);
        }
        Ok(())
    }

    fn awaits_solver(&self, step: &Step, i: usize) -> bool {
        step.deposit_like && step.items[i].effective_request_id(step).is_some()
    }

    async fn await_solver(
        &mut self,
        s: usize,
        items: &[usize],
        tx_hash: Option<&str>,
        chain_id: Option<u64>,
    ) -> ExecutorResult<()> {
        let quote = self.quote;
        let step = &quote.steps[s];
        let mut finished: HashMap<String, &'static str> = HashMap::new();

        for &i in items {
            if !self.awaits_solver(step, i) {
                continue;
            }
            let item = &step.items[i];
            let Some(request_id) = item.effective_request_id(step) else {
                continue;
            };

            let status = match finished.get(request_id) {
                Some(status) => *status,
                None => {
                    let query = StatusQuery {
                        request_id: request_id.to_string(),
                        tx_hash: tx_hash.map(str::to_string),
                        chain_id,
                        check: item.check.clone(),
                    };
                    info!("Waiting for solver on request {}", request_id);
                    let outcome = self
                        .solver
                        .wait_for_completion(&query, &self.options.cancel)
                        .await?;
                    let status = outcome.response.status.as_str();
                    finished.insert(request_id.to_string(), status);
                    status
                }
            };

            self.state.set_solver_status(s, i, status)?;
            self.emit(Some((s, i)), None);
        }
        Ok(())
    }

    /// Best-effort settlement acceleration; failures never abort the step
    async fn request_fast_fill(&self, step: &Step, items: &[usize]) {
        if !step.fast_fill || !self.options.fast_fill {
            return;
        }
        let Some(request_id) = items
            .iter()
            .find_map(|&i| step.items[i].effective_request_id(step))
        else {
            return;
        };

        let request = FastFillRequest {
            request_id: request_id.to_string(),
            solver_input_currency_amount: self.options.solver_input_currency_amount.clone(),
        };
        match self.options.cancel.guard(self.api.fast_fill(&request)).await {
            Ok(()) => info!("Requested fast fill for {}", request_id),
            Err(e) => {
                metrics::record_fast_fill_failure();
                warn!("Fast fill for {} failed: {}", request_id, e);
            }
        }
    }

    async fn ensure_chain(&self, chain_id: u64) -> ExecutorResult<()> {
        let current = self.options.cancel.guard(self.wallet.get_chain_id()).await?;
        if current != chain_id {
            info!("Switching wallet from chain {} to {}", current, chain_id);
            self.options
                .cancel
                .guard(self.wallet.switch_chain(chain_id))
                .await?;
        }
        Ok(())
    }

    async fn check_balance(&self, chain_id: u64, need: U256) -> ExecutorResult<()> {
        if !self.capabilities.balance || need.is_zero() {
            return Ok(());
        }

        let address = self.options.cancel.guard(self.wallet.address()).await?;
        match self
            .options
            .cancel
            .guard(self.wallet.get_balance(chain_id, &address, None))
            .await
        {
            Ok(have) if have < need => Err(ExecutorError::InsufficientBalance {
                chain_id,
                have: have.to_string(),
                need: need.to_string(),
            }),
            Ok(_) => Ok(()),
            Err(ExecutorError::Cancelled) => Err(ExecutorError::Cancelled),
            Err(e) => {
                warn!("Balance check on chain {} failed, continuing: {}", chain_id, e);
                Ok(())
            }
        }
    }

    fn transition(&mut self, s: usize, i: usize, next: ItemStatus) -> ExecutorResult<()> {
        self.state.transition(s, i, next)?;
        self.emit(Some((s, i)), None);
        Ok(())
    }

    /// Failed items stay failed; in-flight items survive retryable errors so a
    /// later call can resume them from their hash
    fn record_failure(&mut self, s: usize, items: &[usize], err: &ExecutorError) {
        let chain_id = self.quote.steps[s]
            .items
            .iter()
            .find_map(|item| item.transaction().map(|tx| tx.chain_id))
            .unwrap_or_default();

        for &i in items {
            let Some(status) = self.state.status(s, i) else {
                continue;
            };
            if status.is_terminal() {
                continue;
            }
            // Errors may be raised before an item left pending
            if status == ItemStatus::Pending {
                continue;
            }
            let _ = self.state.set_error(s, i, err);
            if status.is_in_flight() && err.is_retryable() {
                warn!("Item {}/{} left {} after: {}", s, i, status, err);
                continue;
            }
            if self.state.transition(s, i, ItemStatus::Failed).is_ok() {
                warn!("Item {}/{} failed: {}", s, i, err);
            }
        }

        metrics::record_item_failed(chain_id, err.kind());
        self.emit(Some((s, items[0])), Some(err));
    }

    fn snapshot(&self, current: Option<(usize, usize)>, error: Option<&ExecutorError>) -> Progress {
        self.state
            .snapshot(self.execution_id, self.quote, current, error)
    }

    fn publish(&self, progress: &Progress) {
        if let Some(observer) = &self.options.on_progress {
            observer(progress);
        }
    }

    fn emit(&self, current: Option<(usize, usize)>, error: Option<&ExecutorError>) {
        if self.options.on_progress.is_some() {
            let progress = self.snapshot(current, error);
            self.publish(&progress);
        }
    }
}
