//! Prometheus metrics for the bridge relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, CounterVec, Gauge, Histogram,
};

use crate::types::Status;

lazy_static! {
    // Source scanning
    pub static ref NOTIFICATIONS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_notifications_observed_total",
        "Deposit notifications delivered by the watcher",
        &["result"]
    ).unwrap();

    pub static ref LAST_SCANNED_POSITION: Gauge = register_gauge!(
        "relayer_last_scanned_position",
        "Highest source position persisted as the watcher cursor"
    ).unwrap();

    pub static ref SOURCE_ERRORS: CounterVec = register_counter_vec!(
        "relayer_source_errors_total",
        "Source ledger read failures",
        &["phase"]
    ).unwrap();

    // Fulfillment
    pub static ref FULFILLMENT_OUTCOMES: CounterVec = register_counter_vec!(
        "relayer_fulfillment_outcomes_total",
        "Fulfillment attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref FULFILLMENT_LATENCY: Histogram = register_histogram!(
        "relayer_fulfillment_latency_seconds",
        "Time from submission start to confirmation",
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "relayer_state_transitions_total",
        "Deposit record transitions",
        &["from", "to"]
    ).unwrap();

    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "relayer_retries_total",
        "Transient failures that were scheduled for retry",
        &["kind"]
    ).unwrap();

    pub static ref FAILED_DEPOSITS: CounterVec = register_counter_vec!(
        "relayer_failed_deposits_total",
        "Deposits moved to failed and escalated to the operator",
        &["reason"]
    ).unwrap();

    // Health metrics
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

/// Record a notification and what the store made of it
pub fn record_notification(result: &str) {
    NOTIFICATIONS_OBSERVED.with_label_values(&[result]).inc();
}

pub fn record_cursor(position: u64) {
    LAST_SCANNED_POSITION.set(position as f64);
}

pub fn record_source_error(phase: &str) {
    SOURCE_ERRORS.with_label_values(&[phase]).inc();
}

pub fn record_transition(from: Status, to: Status) {
    STATE_TRANSITIONS
        .with_label_values(&[from.as_str(), to.as_str()])
        .inc();
}

pub fn record_retry(kind: &str) {
    RETRIES.with_label_values(&[kind]).inc();
}

/// `reason` is `permanent` or `retries_exhausted`
pub fn record_failed(reason: &str) {
    FAILED_DEPOSITS.with_label_values(&[reason]).inc();
}
