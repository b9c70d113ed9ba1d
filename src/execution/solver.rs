//! Solver status poller
//!
//! Polls the status endpoint at a fixed cadence until the solver reports a
//! terminal state or a budget runs out. Two budgets apply: `waiting` responses
//! (deposit not yet indexed) count against the deposit budget, every attempt
//! counts against the overall one.

use super::cancel::CancelSignal;
use crate::api::{SolverApi, SolverStatus, StatusQuery, StatusResponse};
use crate::error::{ExecutorError, ExecutorResult};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StatusPollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub deposit_max_attempts: u32,
}

impl Default for StatusPollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            max_attempts: 40,
            deposit_max_attempts: 40,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub response: StatusResponse,
    pub attempts: u32,
}

pub struct SolverStatusPoller {
    api: Arc<dyn SolverApi>,
    config: StatusPollConfig,
}

impl SolverStatusPoller {
    pub fn new(api: Arc<dyn SolverApi>, config: StatusPollConfig) -> Self {
        Self { api, config }
    }

    /// Poll until success, definitive failure, budget exhaustion, or cancellation
    pub async fn wait_for_completion(
        &self,
        query: &StatusQuery,
        cancel: &CancelSignal,
    ) -> ExecutorResult<SolverOutcome> {
        let mut attempts = 0u32;
        let mut waiting = 0u32;

        loop {
            attempts += 1;

            match cancel.guard(self.api.get_status(query)).await {
                Ok(response) => {
                    crate::metrics::record_status_poll(response.status.as_str());
                    debug!(
                        "Request {} status {} (attempt {}/{})",
                        query.request_id,
                        response.status.as_str(),
                        attempts,
                        self.config.max_attempts
                    );

                    match response.status {
                        SolverStatus::Success => {
                            info!(
                                "Request {} filled after {} status checks",
                                query.request_id, attempts
                            );
                            return Ok(SolverOutcome { response, attempts });
                        }
                        status if status.is_definitive_failure() => {
                            return Err(ExecutorError::SolverFailed {
                                request_id: query.request_id.clone(),
                                status: status.as_str().to_string(),
                                details: response.details.unwrap_or_default(),
                            });
                        }
                        SolverStatus::Waiting => waiting += 1,
                        _ => {}
                    }
                }
                Err(ExecutorError::Cancelled) => return Err(ExecutorError::Cancelled),
                Err(e) => {
                    crate::metrics::record_status_poll("error");
                    warn!(
                        "Status check for {} failed (attempt {}): {}",
                        query.request_id, attempts, e
                    );
                }
            }

            if waiting >= self.config.deposit_max_attempts {
                return Err(ExecutorError::DepositTransactionTimeout {
                    tx_hash: query.tx_hash.clone(),
                    request_id: query.request_id.clone(),
                    attempts,
                });
            }

            if attempts >= self.config.max_attempts {
                return Err(ExecutorError::SolverStatusTimeout {
                    tx_hash: query.tx_hash.clone(),
                    request_id: query.request_id.clone(),
                    attempts,
                });
            }

            cancel.sleep(self.config.interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockSolverApi;
    use crate::execution::cancel::cancel_pair;
    use tokio::time::Instant;

    fn status(status: SolverStatus) -> StatusResponse {
        StatusResponse {
            status,
            details: None,
            in_tx_hashes: Vec::new(),
            tx_hashes: Vec::new(),
        }
    }

    fn query() -> StatusQuery {
        StatusQuery {
            request_id: "r1".to_string(),
            tx_hash: Some("0xdeposit".to_string()),
            chain_id: Some(8453),
            check: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_forever_times_out_after_budget() {
        let mut api = MockSolverApi::new();
        api.expect_get_status()
            .times(40)
            .returning(|_| Ok(status(SolverStatus::Pending)));
        let poller = SolverStatusPoller::new(Arc::new(api), StatusPollConfig::default());

        let started = Instant::now();
        let err = poller
            .wait_for_completion(&query(), &CancelSignal::never())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        match err {
            ExecutorError::SolverStatusTimeout {
                attempts,
                request_id,
                tx_hash,
            } => {
                assert_eq!(attempts, 40);
                assert_eq!(request_id, "r1");
                assert_eq!(tx_hash.as_deref(), Some("0xdeposit"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(58_500));
        assert!(elapsed <= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_forever_is_deposit_timeout() {
        let mut api = MockSolverApi::new();
        api.expect_get_status()
            .times(5)
            .returning(|_| Ok(status(SolverStatus::Waiting)));
        let config = StatusPollConfig {
            max_attempts: 10,
            deposit_max_attempts: 5,
            ..StatusPollConfig::default()
        };
        let poller = SolverStatusPoller::new(Arc::new(api), config);

        let err = poller
            .wait_for_completion(&query(), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::DepositTransactionTimeout { attempts: 5, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_stops_immediately() {
        let mut api = MockSolverApi::new();
        api.expect_get_status().times(1).returning(|_| {
            Ok(StatusResponse {
                details: Some("execution reverted on destination".to_string()),
                ..status(SolverStatus::Failure)
            })
        });
        let poller = SolverStatusPoller::new(Arc::new(api), StatusPollConfig::default());

        let err = poller
            .wait_for_completion(&query(), &CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            ExecutorError::SolverFailed { status, details, .. } => {
                assert_eq!(status, "failure");
                assert!(details.contains("reverted"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_second_poll() {
        let mut api = MockSolverApi::new();
        let mut calls = 0;
        api.expect_get_status().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(status(SolverStatus::Pending))
            } else {
                Ok(status(SolverStatus::Success))
            }
        });
        let poller = SolverStatusPoller::new(Arc::new(api), StatusPollConfig::default());

        let outcome = poller
            .wait_for_completion(&query(), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.response.status, SolverStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_api_errors_consume_attempts() {
        let mut api = MockSolverApi::new();
        let mut calls = 0;
        api.expect_get_status().times(3).returning(move |_| {
            calls += 1;
            match calls {
                1 | 2 => Err(ExecutorError::Api {
                    endpoint: "/intents/status/v2".to_string(),
                    status: 502,
                    body: "bad gateway".to_string(),
                }),
                _ => Ok(status(SolverStatus::Success)),
            }
        });
        let poller = SolverStatusPoller::new(Arc::new(api), StatusPollConfig::default());

        let outcome = poller
            .wait_for_completion(&query(), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let mut api = MockSolverApi::new();
        api.expect_get_status()
            .returning(|_| Ok(status(SolverStatus::Pending)));
        let poller = SolverStatusPoller::new(Arc::new(api), StatusPollConfig::default());
        let (handle, signal) = cancel_pair();

        let task = tokio::spawn(async move { poller.wait_for_completion(&query(), &signal).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }
}
