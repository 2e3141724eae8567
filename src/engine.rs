//! Fulfillment Engine
//!
//! Turns one deposit record into at most one destination mint. The engine is
//! idempotent from the caller's point of view: it checks the destination
//! ProcessedSet before submitting and treats an "already processed" rejection
//! as success, so calling it repeatedly for one identifier never mints twice.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::ledger::{DestinationLedger, FulfillRequest, SubmitOptions};
use crate::metrics;
use crate::types::DepositRecord;

/// Why a fulfillment attempt may succeed later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Ordering metadata clashed; resubmit with refreshed ordering
    OrderingConflict,
    /// Destination ledger unreachable or overloaded
    Unavailable,
    /// Submission was not confirmed within the submission timeout
    Timeout,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransientKind::OrderingConflict => "ordering_conflict",
            TransientKind::Unavailable => "unavailable",
            TransientKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientReason {
    pub kind: TransientKind,
    pub detail: String,
}

impl fmt::Display for TransientReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

impl TransientReason {
    fn from_ledger(error: &LedgerError) -> Self {
        let kind = match error {
            LedgerError::OrderingConflict(_) => TransientKind::OrderingConflict,
            _ => TransientKind::Unavailable,
        };
        Self {
            kind,
            detail: error.to_string(),
        }
    }
}

/// Result of one fulfillment attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// This attempt's mint was included
    Confirmed { tx_hash: String, position: u64 },
    /// The identifier is already in the ProcessedSet; nothing was minted
    AlreadyProcessed,
    TransientFailure(TransientReason),
    /// Can never succeed for this identifier/amount; needs an operator
    PermanentFailure(String),
}

impl Outcome {
    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Confirmed { .. } => "confirmed",
            Outcome::AlreadyProcessed => "already_processed",
            Outcome::TransientFailure(_) => "transient_failure",
            Outcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

pub struct FulfillmentEngine {
    destination: Arc<dyn DestinationLedger>,
    submission_timeout: Duration,
}

impl FulfillmentEngine {
    pub fn new(destination: Arc<dyn DestinationLedger>, submission_timeout: Duration) -> Self {
        Self {
            destination,
            submission_timeout,
        }
    }

    pub async fn fulfill(&self, record: &DepositRecord) -> Outcome {
        self.fulfill_with(record, SubmitOptions::default()).await
    }

    pub async fn fulfill_with(&self, record: &DepositRecord, options: SubmitOptions) -> Outcome {
        let started = Instant::now();
        let outcome = self.attempt(record, options).await;

        metrics::FULFILLMENT_OUTCOMES
            .with_label_values(&[outcome.label()])
            .inc();
        if let Outcome::Confirmed { .. } = outcome {
            metrics::FULFILLMENT_LATENCY.observe(started.elapsed().as_secs_f64());
        }
        outcome
    }

    async fn attempt(&self, record: &DepositRecord, options: SubmitOptions) -> Outcome {
        // Local short-circuit against the authoritative ProcessedSet
        match self.destination.is_processed(&record.id).await {
            Ok(true) => {
                debug!(deposit_id = %record.id, "Already processed on destination");
                return Outcome::AlreadyProcessed;
            }
            Ok(false) => {}
            Err(e) => return Outcome::TransientFailure(TransientReason::from_ledger(&e)),
        }

        let request = FulfillRequest {
            recipient: record.recipient,
            amount: record.amount,
            id: record.id,
        };

        let pending = match self.destination.submit_fulfill(&request, options).await {
            Ok(pending) => pending,
            Err(LedgerError::AlreadyProcessed) => {
                info!(deposit_id = %record.id, "Fulfillment raced another submission, already processed");
                return Outcome::AlreadyProcessed;
            }
            Err(e) if e.is_transient() => {
                warn!(deposit_id = %record.id, error = %e, "Transient submission failure");
                return Outcome::TransientFailure(TransientReason::from_ledger(&e));
            }
            Err(e) => return Outcome::PermanentFailure(e.to_string()),
        };

        debug!(
            deposit_id = %record.id,
            tx_hash = %pending.tx_hash,
            timeout_secs = self.submission_timeout.as_secs_f64(),
            "Awaiting confirmation"
        );

        match tokio::time::timeout(
            self.submission_timeout,
            self.destination.await_confirmation(&pending),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                info!(
                    deposit_id = %record.id,
                    recipient = %record.recipient,
                    amount = record.amount,
                    tx_hash = %receipt.tx_hash,
                    position = receipt.position,
                    "Fulfillment confirmed"
                );
                Outcome::Confirmed {
                    tx_hash: receipt.tx_hash,
                    position: receipt.position,
                }
            }
            Ok(Err(LedgerError::AlreadyProcessed)) => Outcome::AlreadyProcessed,
            Ok(Err(e)) if e.is_transient() => {
                Outcome::TransientFailure(TransientReason::from_ledger(&e))
            }
            Ok(Err(e)) => self.reverify_after_rejection(record, e).await,
            Err(_) => {
                warn!(
                    deposit_id = %record.id,
                    tx_hash = %pending.tx_hash,
                    "Confirmation timed out, will re-verify before retrying"
                );
                Outcome::TransientFailure(TransientReason {
                    kind: TransientKind::Timeout,
                    detail: format!(
                        "{} not confirmed within {:?}",
                        pending.tx_hash, self.submission_timeout
                    ),
                })
            }
        }
    }

    /// A failed receipt may still mean another submission landed first
    async fn reverify_after_rejection(&self, record: &DepositRecord, error: LedgerError) -> Outcome {
        match self.destination.is_processed(&record.id).await {
            Ok(true) => Outcome::AlreadyProcessed,
            Ok(false) => Outcome::PermanentFailure(error.to_string()),
            Err(e) => Outcome::TransientFailure(TransientReason::from_ledger(&e)),
        }
    }
}
