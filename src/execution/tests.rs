//! Executor scenarios against a scripted wallet

use super::testing::{ConfirmBehavior, ScriptedWallet};
use super::*;
use crate::api::{MockSolverApi, SolverStatus, StatusResponse};
use crate::batch::{BatchExecutorConfig, BATCH_GAS_OVERHEAD};
use crate::error::ExecutorError;
use crate::quote::{Execute, Receipt};
use crate::wallet::EoaStatus;

use alloy_primitives::{address, U256};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn execution(json: &str) -> Execution {
    Execution::new(Execute::from_json(json).unwrap()).unwrap()
}

fn tx(chain_id: u64, to: &str, value: &str) -> String {
    format!(
        r#"{{ "data": {{ "chainId": {}, "to": "{}", "value": "{}", "data": "0x" }} }}"#,
        chain_id, to, value
    )
}

fn tx_step(id: &str, extra: &str, items: &[String]) -> String {
    format!(
        r#"{{ "id": "{}", "kind": "transaction", {} "items": [{}] }}"#,
        id,
        extra,
        items.join(",")
    )
}

fn quote(steps: &[String]) -> String {
    format!(r#"{{ "steps": [{}] }}"#, steps.join(","))
}

const TO_A: &str = "0x0000000000000000000000000000000000000001";
const TO_B: &str = "0x0000000000000000000000000000000000000002";

fn status(status: SolverStatus) -> StatusResponse {
    StatusResponse {
        status,
        details: None,
        in_tx_hashes: Vec::new(),
        tx_hashes: Vec::new(),
    }
}

fn executor(api: MockSolverApi) -> StepExecutor {
    StepExecutor::new(Arc::new(api))
}

/// Collects every snapshot pushed during a run
fn recorder() -> (ExecuteOptions, Arc<Mutex<Vec<Progress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = ExecuteOptions::default()
        .with_progress(move |progress: &Progress| sink.lock().unwrap().push(progress.clone()));
    (options, seen)
}

#[tokio::test]
async fn test_steps_run_in_order() {
    let sign = r#"{ "id": "authorize", "kind": "signature", "items": [
        { "data": { "sign": { "signatureKind": "eip191", "message": "hello" } } }
    ]}"#
    .to_string();
    let json = quote(&[
        sign,
        tx_step("deposit", "", &[tx(1, TO_A, "0"), tx(1, TO_B, "0")]),
    ]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new();

    let progress = executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();

    assert!(execution.is_complete());
    assert_eq!(wallet.sign_count(), 1);
    assert_eq!(wallet.confirm_calls(), vec!["0xtx1", "0xtx2"]);
    let hashes: Vec<_> = progress.tx_hashes.iter().map(|r| r.tx_hash.as_str()).collect();
    assert_eq!(hashes, vec!["0xtx1", "0xtx2"]);
    assert!(progress.steps[0].items[0].signature.is_some());
    assert_eq!(progress.current_step, None);
    assert!(progress.error.is_none());
}

#[tokio::test]
async fn test_resume_skips_confirmed_items() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0"), tx(1, TO_B, "0")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().fail_send(1);
    let executor = executor(MockSolverApi::new());

    let err = executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Wallet(_)));
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Confirmed));
    assert_eq!(execution.state().status(0, 1), Some(ItemStatus::Failed));

    executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();

    let sent: Vec<_> = wallet
        .sent_items()
        .into_iter()
        .map(|(_, item)| item.transaction().unwrap().to.clone().unwrap())
        .collect();
    assert_eq!(sent, vec![TO_A, TO_B, TO_B]);
    assert_eq!(wallet.confirm_calls(), vec!["0xtx1", "0xtx3"]);
    assert!(execution.is_complete());
}

#[tokio::test]
async fn test_failure_snapshot_carries_error() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().fail_send(0);
    let (options, seen) = recorder();

    executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap_err();

    let seen = seen.lock().unwrap();
    let last = seen.last().unwrap();
    assert_eq!(last.current_item_status(), Some(ItemStatus::Failed));
    assert_eq!(last.error.as_ref().unwrap().kind, "wallet");
    assert_eq!(
        last.steps[0].items[0].error.as_deref(),
        Some("Wallet error: user rejected the request")
    );
}

#[tokio::test]
async fn test_every_transition_is_published() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new();
    let (options, seen) = recorder();

    executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap();

    let mut statuses: Vec<ItemStatus> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|p| p.item_status(0, 0))
        .collect();
    statuses.dedup();
    assert_eq!(
        statuses,
        vec![
            ItemStatus::Sending,
            ItemStatus::Submitted,
            ItemStatus::Confirming,
            ItemStatus::Confirmed,
        ]
    );
}

#[tokio::test]
async fn test_replacement_records_final_hash() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0")])]);
    let mut execution = execution(&json);
    let wallet =
        ScriptedWallet::new().confirm("0xtx1", ConfirmBehavior::ReplacedWith("0xsped".to_string()));

    let progress = executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(progress.tx_hashes.len(), 1);
    assert_eq!(progress.tx_hashes[0].tx_hash, "0xsped");
    let receipt = progress.steps[0].items[0].receipt.as_ref().unwrap();
    assert_eq!(receipt.tx_hash(), "0xsped");
}

#[tokio::test]
async fn test_cancelled_transaction_fails_without_status_polls() {
    let json = quote(&[tx_step(
        "deposit",
        r#""requestId": "r1", "depositLike": true, "fastFill": true,"#,
        &[tx(1, TO_A, "0")],
    )]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().confirm("0xtx1", ConfirmBehavior::Cancelled);
    let mut api = MockSolverApi::new();
    api.expect_get_status().never();
    api.expect_fast_fill().never();
    let executor = executor(api);

    let err = executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::TransactionConfirmation { .. }));
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Failed));

    // Submitted failures are never resent
    let err = executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::ItemFailed { step: 0, item: 0, .. }));
    assert_eq!(wallet.send_count(), 1);
}

#[tokio::test]
async fn test_reverted_receipt_fails_item() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().confirm(
        "0xtx1",
        ConfirmBehavior::Receipt(Receipt::Evm {
            transaction_hash: "0xtx1".to_string(),
            block_number: 12,
            status: 0,
            gas_used: None,
        }),
    );

    let err = executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap_err();

    match err {
        ExecutorError::TransactionConfirmation { receipt, message, .. } => {
            assert_eq!(message, "reverted");
            assert!(receipt.is_some());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_deposit_waits_for_solver_fill() {
    let json = quote(&[tx_step(
        "deposit",
        r#""requestId": "r1", "depositLike": true,"#,
        &[tx(8453, TO_A, "0")],
    )]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().on_chain(8453);
    let mut api = MockSolverApi::new();
    let mut calls = 0;
    api.expect_get_status()
        .withf(|q| {
            q.request_id == "r1" && q.tx_hash.as_deref() == Some("0xtx1") && q.chain_id == Some(8453)
        })
        .times(2)
        .returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(status(SolverStatus::Pending))
            } else {
                Ok(status(SolverStatus::Success))
            }
        });

    let progress = executor(api)
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();

    let item = &progress.steps[0].items[0];
    assert_eq!(item.status, ItemStatus::Confirmed);
    assert_eq!(item.solver_status.as_deref(), Some("success"));
}

#[tokio::test(start_paused = true)]
async fn test_solver_timeout_leaves_deposit_resumable() {
    let json = quote(&[tx_step(
        "deposit",
        r#""requestId": "r1", "depositLike": true,"#,
        &[tx(1, TO_A, "0")],
    )]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new();
    let mut api = MockSolverApi::new();
    let mut calls = 0;
    api.expect_get_status().times(4).returning(move |_| {
        calls += 1;
        if calls <= 3 {
            Ok(status(SolverStatus::Pending))
        } else {
            Ok(status(SolverStatus::Success))
        }
    });
    let executor = executor(api);
    let options = ExecuteOptions {
        status_poll: StatusPollConfig {
            max_attempts: 3,
            ..StatusPollConfig::default()
        },
        ..ExecuteOptions::default()
    };

    let err = executor
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::SolverStatusTimeout { attempts: 3, .. }));
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Confirming));

    executor
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap();

    // The receipt was already recorded, so only the solver is asked again
    assert_eq!(wallet.send_count(), 1);
    assert_eq!(wallet.confirm_calls(), vec!["0xtx1"]);
    assert!(execution.is_complete());
}

#[tokio::test]
async fn test_confirmation_timeout_leaves_item_resumable() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().confirm("0xtx1", ConfirmBehavior::TimeoutFirst);
    let executor = executor(MockSolverApi::new());

    let err = executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Timeout { .. }));
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Confirming));

    executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();

    // Same hash is watched again, nothing is resent
    assert_eq!(wallet.send_count(), 1);
    assert_eq!(wallet.confirm_calls(), vec!["0xtx1", "0xtx1"]);
    assert!(execution.is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_fast_fill_failure_is_best_effort() {
    let json = quote(&[tx_step(
        "deposit",
        r#""requestId": "r1", "depositLike": true, "fastFill": true,"#,
        &[tx(1, TO_A, "0")],
    )]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new();
    let mut api = MockSolverApi::new();
    api.expect_fast_fill()
        .withf(|req| req.request_id == "r1" && req.solver_input_currency_amount.as_deref() == Some("1000"))
        .times(1)
        .returning(|_| {
            Err(ExecutorError::Api {
                endpoint: "/fast-fill".to_string(),
                status: 500,
                body: "internal error".to_string(),
            })
        });
    api.expect_get_status()
        .times(1)
        .returning(|_| Ok(status(SolverStatus::Success)));
    let options = ExecuteOptions {
        solver_input_currency_amount: Some("1000".to_string()),
        ..ExecuteOptions::default()
    };

    let progress = executor(api)
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap();

    assert_eq!(progress.item_status(0, 0), Some(ItemStatus::Confirmed));
    assert!(progress.steps[0].items[0].error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancel_keeps_hash_for_resume() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0")])]);
    let mut execution = execution(&json);
    let hanging = ScriptedWallet::new().confirm("0xtx1", ConfirmBehavior::Hang);
    let executor = executor(MockSolverApi::new());
    let (handle, signal) = cancel_pair();
    let options = ExecuteOptions::default().with_cancel(signal);

    let (result, _) = tokio::join!(
        executor.execute(&mut execution, &hanging, &options),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        }
    );

    assert!(matches!(result, Err(ExecutorError::Cancelled)));
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Confirming));
    assert_eq!(execution.state().all_tx_hashes()[0].tx_hash, "0xtx1");

    let wallet = ScriptedWallet::new();
    executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(wallet.send_count(), 0);
    assert_eq!(wallet.confirm_calls(), vec!["0xtx1"]);
    assert!(execution.is_complete());
}

#[tokio::test]
async fn test_already_cancelled_does_nothing() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "0")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new();
    let (handle, signal) = cancel_pair();
    handle.cancel();

    let result = executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &ExecuteOptions::default().with_cancel(signal))
        .await;

    assert!(matches!(result, Err(ExecutorError::Cancelled)));
    assert_eq!(wallet.send_count(), 0);
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Pending));
}

#[tokio::test]
async fn test_switches_chain_before_sending() {
    let json = quote(&[tx_step("deposit", "", &[tx(8453, TO_A, "0"), tx(8453, TO_B, "0")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().on_chain(10);

    executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(wallet.switch_calls(), vec![8453]);
    assert!(wallet.sent_items().iter().all(|(chain, _)| *chain == 8453));
}

#[tokio::test]
async fn test_insufficient_balance_fails_before_send() {
    let json = quote(&[tx_step("deposit", "", &[tx(1, TO_A, "1000")])]);
    let mut execution = execution(&json);
    let wallet = ScriptedWallet::new().balance(U256::from(100u64));

    let err = executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutorError::InsufficientBalance { chain_id: 1, .. }));
    assert_eq!(wallet.balance_reads(), 1);
    assert_eq!(wallet.send_count(), 0);
    // Nothing was submitted, so the item may be retried
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Failed));
    assert!(execution.state().item(0, 0).unwrap().tx_hashes.is_empty());
}

#[tokio::test]
async fn test_signature_posted_before_recorded() {
    let sign = r#"{ "id": "authorize", "kind": "signature", "items": [
        { "data": {
            "sign": { "signatureKind": "eip191", "message": "0x1234" },
            "post": { "endpoint": "/authorize", "body": { "nonce": 1 } }
        } }
    ]}"#
    .to_string();
    let mut execution = execution(&quote(&[sign]));
    let wallet = ScriptedWallet::new();
    let mut api = MockSolverApi::new();
    let mut calls = 0;
    api.expect_post_signature()
        .withf(|post, sig| post.endpoint == "/authorize" && sig.starts_with("0x11"))
        .times(2)
        .returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(ExecutorError::Api {
                    endpoint: "/authorize".to_string(),
                    status: 400,
                    body: "stale".to_string(),
                })
            } else {
                Ok(())
            }
        });
    let executor = executor(api);

    let err = executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Api { status: 400, .. }));
    let item = execution.state().item(0, 0).unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert!(item.signature.is_none());

    executor
        .execute(&mut execution, &wallet, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(wallet.sign_count(), 2);
    assert!(execution.state().item(0, 0).unwrap().signature.is_some());
}

fn batch_quote() -> String {
    batch_quote_with("")
}

fn batch_quote_with(extra: &str) -> String {
    let item = |to: &str, gas: &str| {
        format!(
            r#"{{ "batchable": true, "data": {{ "chainId": 1, "to": "{}", "value": "0", "data": "0x", "gas": "{}" }} }}"#,
            to, gas
        )
    };
    quote(&[tx_step("approve-and-deposit", extra, &[item(TO_A, "50000"), item(TO_B, "30000")])])
}

fn batch_options() -> ExecuteOptions {
    ExecuteOptions {
        atomic_batch: true,
        relay_batches: false,
        batch_executor: Some(Arc::new(BatchExecutorConfig::calibur(address!(
            "000000009b1d0af20d8c6d0a44e162d11f9b8f00"
        )))),
        ..ExecuteOptions::default()
    }
}

#[tokio::test]
async fn test_gasless_batch_signs_once() {
    let mut execution = execution(&batch_quote());
    let wallet = ScriptedWallet::new().atomic_batch().eoa(EoaStatus {
        is_eoa: false,
        is_eip7702_delegated: true,
    });

    let progress = executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &batch_options())
        .await
        .unwrap();

    assert_eq!(wallet.sign_count(), 1);
    assert_eq!(wallet.send_count(), 1);
    let (_, sent) = &wallet.sent_items()[0];
    let tx = sent.transaction().unwrap();
    let gas: u64 = tx.gas.as_deref().unwrap().parse().unwrap();
    assert!(gas >= 50_000 + 30_000 + BATCH_GAS_OVERHEAD);

    assert_eq!(progress.tx_hashes.len(), 1);
    assert!(progress.tx_hashes[0].is_batch);
    for item in &progress.steps[0].items {
        assert_eq!(item.status, ItemStatus::Confirmed);
        assert_eq!(item.tx_hashes[0].tx_hash, "0xtx1");
    }
    assert_eq!(wallet.confirm_calls(), vec!["0xtx1"]);
}

#[tokio::test]
async fn test_wallet_batch_without_gasless_scheme() {
    let mut execution = execution(&batch_quote());
    let wallet = ScriptedWallet::new().atomic_batch().wallet_batching();
    let options = ExecuteOptions {
        batch_executor: None,
        ..batch_options()
    };

    executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap();

    assert_eq!(wallet.batch_calls(), vec![(1, 2)]);
    assert_eq!(wallet.send_count(), 0);
    assert_eq!(wallet.confirm_calls(), vec!["0xbatch1"]);
}

#[tokio::test(start_paused = true)]
async fn test_batch_resume_after_solver_timeout() {
    let mut execution = execution(&batch_quote_with(r#""requestId": "r1", "depositLike": true,"#));
    let wallet = ScriptedWallet::new().atomic_batch().eoa(EoaStatus {
        is_eoa: false,
        is_eip7702_delegated: true,
    });
    let mut api = MockSolverApi::new();
    let mut calls = 0;
    api.expect_get_status()
        .withf(|q| q.request_id == "r1" && q.tx_hash.as_deref() == Some("0xtx1"))
        .times(3)
        .returning(move |_| {
            calls += 1;
            if calls <= 2 {
                Ok(status(SolverStatus::Pending))
            } else {
                Ok(status(SolverStatus::Success))
            }
        });
    let executor = executor(api);
    let options = ExecuteOptions {
        status_poll: StatusPollConfig {
            max_attempts: 2,
            ..StatusPollConfig::default()
        },
        ..batch_options()
    };

    let err = executor
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::SolverStatusTimeout { attempts: 2, .. }));
    assert_eq!(execution.state().status(0, 0), Some(ItemStatus::Confirming));
    assert_eq!(execution.state().status(0, 1), Some(ItemStatus::Confirming));

    let progress = executor
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap();

    // The batch is neither re-signed nor re-confirmed, only the solver is asked again
    assert_eq!(wallet.sign_count(), 1);
    assert_eq!(wallet.send_count(), 1);
    assert_eq!(wallet.confirm_calls(), vec!["0xtx1"]);
    assert_eq!(progress.tx_hashes.len(), 1);
    for item in &progress.steps[0].items {
        assert_eq!(item.status, ItemStatus::Confirmed);
    }
}

#[tokio::test]
async fn test_batch_confirmation_timeout_resumes_same_hash() {
    let mut execution = execution(&batch_quote());
    let wallet = ScriptedWallet::new()
        .atomic_batch()
        .wallet_batching()
        .confirm("0xbatch1", ConfirmBehavior::TimeoutFirst);
    let options = ExecuteOptions {
        batch_executor: None,
        ..batch_options()
    };
    let executor = executor(MockSolverApi::new());

    let err = executor
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    executor
        .execute(&mut execution, &wallet, &options)
        .await
        .unwrap();

    assert_eq!(wallet.batch_calls(), vec![(1, 2)]);
    assert_eq!(wallet.confirm_calls(), vec!["0xbatch1", "0xbatch1"]);
    assert!(execution.is_complete());
}

#[tokio::test]
async fn test_contract_account_falls_back_to_sequential() {
    let mut execution = execution(&batch_quote());
    let wallet = ScriptedWallet::new().atomic_batch().eoa(EoaStatus {
        is_eoa: false,
        is_eip7702_delegated: false,
    });

    executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &batch_options())
        .await
        .unwrap();

    assert_eq!(wallet.sign_count(), 0);
    assert_eq!(wallet.send_count(), 2);
}

#[tokio::test]
async fn test_batch_disabled_without_atomic_support() {
    let mut execution = execution(&batch_quote());
    let wallet = ScriptedWallet::new().wallet_batching();

    executor(MockSolverApi::new())
        .execute(&mut execution, &wallet, &batch_options())
        .await
        .unwrap();

    assert!(wallet.batch_calls().is_empty());
    assert_eq!(wallet.send_count(), 2);
}
