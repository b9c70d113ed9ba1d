//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Item submissions, confirmations and failures per chain
//! - Solver status polls by outcome
//! - Fast-fill failures
//! - Confirmation latency

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec,
    TextEncoder,
};

lazy_static! {
    pub static ref ITEMS_SUBMITTED: CounterVec = register_counter_vec!(
        "quote_executor_items_submitted_total",
        "Total step items submitted",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref ITEMS_CONFIRMED: CounterVec = register_counter_vec!(
        "quote_executor_items_confirmed_total",
        "Total step items confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref ITEMS_FAILED: CounterVec = register_counter_vec!(
        "quote_executor_items_failed_total",
        "Total step items failed by error kind",
        &["chain_id", "error"]
    ).unwrap();

    pub static ref SIGNATURES_COLLECTED: CounterVec = register_counter_vec!(
        "quote_executor_signatures_collected_total",
        "Signature items signed by the wallet",
        &[]
    ).unwrap();

    pub static ref STATUS_POLLS: CounterVec = register_counter_vec!(
        "quote_executor_status_polls_total",
        "Solver status checks by reported status",
        &["status"]
    ).unwrap();

    pub static ref FAST_FILL_FAILURES: CounterVec = register_counter_vec!(
        "quote_executor_fast_fill_failures_total",
        "Fast-fill requests that failed",
        &[]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "quote_executor_confirmation_latency_seconds",
        "Time from submission to confirmation",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();
}

/// Render every registered metric in the text exposition format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_item_submitted(chain_id: u64, kind: &str) {
    ITEMS_SUBMITTED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_item_confirmed(chain_id: u64) {
    ITEMS_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_item_failed(chain_id: u64, error: &str) {
    ITEMS_FAILED
        .with_label_values(&[&chain_id.to_string(), error])
        .inc();
}

pub fn record_signature_collected() {
    SIGNATURES_COLLECTED.with_label_values(&[]).inc();
}

pub fn record_status_poll(status: &str) {
    STATUS_POLLS.with_label_values(&[status]).inc();
}

pub fn record_fast_fill_failure() {
    FAST_FILL_FAILURES.with_label_values(&[]).inc();
}

pub fn record_confirmation_latency(chain_id: u64, latency_secs: f64) {
    CONFIRMATION_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}
