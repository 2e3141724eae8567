//! Error taxonomy for the relay pipeline
//!
//! Ledger adapters classify every failure into a [`LedgerError`] variant once,
//! at the boundary. Everything downstream (engine, orchestrator, retry policy)
//! branches on the variant and never on message text.

use thiserror::Error;

use crate::types::{DepositId, Status};

/// Failure reported by a ledger adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The identifier is already in the destination ProcessedSet
    #[error("deposit already processed")]
    AlreadyProcessed,

    /// Submission ordering metadata (e.g. account nonce) conflicted with a
    /// pending or landed submission; resubmitting with refreshed ordering may succeed
    #[error("submission ordering conflict: {0}")]
    OrderingConflict(String),

    /// Node or endpoint temporarily unreachable, rate limited or timing out
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The submitting account is not an authorized relayer
    #[error("submitter is not an authorized relayer")]
    NotRelayer,

    /// The recipient can never receive a mint (e.g. zero address)
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Burn or transfer exceeds the owner's balance
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u128, need: u128 },

    /// Any other rejection that cannot succeed on retry
    #[error("rejected: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::OrderingConflict(_) | LedgerError::Unavailable(_)
        )
    }
}

/// Failure of the deposit record store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend cannot be read or written right now
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Persisted data could not be decoded
    #[error("store data corrupt: {0}")]
    Corrupt(String),
}

/// Relay pipeline errors surfaced to the orchestrator and the binary
#[derive(Debug, Error)]
pub enum RelayError {
    /// Source ledger could not be read for a position range; the range must be retried
    #[error("source ledger unavailable for positions {from}..={to}: {reason}")]
    SourceUnavailable { from: u64, to: u64, reason: String },

    /// Idempotency state cannot be persisted; the relayer must stop submitting
    #[error("deposit store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A transition outside the state machine was requested
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: DepositId,
        from: Status,
        to: Status,
    },

    /// Internal task failure (panic or channel closure)
    #[error("relay task failed: {0}")]
    Task(String),
}
