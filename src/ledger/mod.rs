//! Ledger adapter boundary
//!
//! The relay core only ever talks to the two ledgers through these traits:
//! the source side exposes its append-only deposit log, the destination side
//! exposes the authoritative ProcessedSet and the guarded mint.

use async_trait::async_trait;

use crate::error::LedgerError;
use crate::types::{DepositId, DepositNotification, EvmAddress};

pub mod evm;
pub mod memory;

pub use evm::{EvmDestinationLedger, EvmSourceLedger};
pub use memory::InMemoryLedger;

/// Read side of the source ledger
#[async_trait]
pub trait SourceLedger: Send + Sync {
    /// Highest position that is final enough to scan
    async fn head(&self) -> Result<u64, LedgerError>;

    /// Deposit events in `[from, to]`, inclusive, in log order
    async fn deposits_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<DepositNotification>, LedgerError>;
}

/// Mint request for one deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillRequest {
    pub recipient: EvmAddress,
    pub amount: u128,
    pub id: DepositId,
}

/// Per-submission knobs chosen by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Re-read ordering metadata (account nonce) from the ledger before submitting
    pub refresh_ordering: bool,
}

/// A submission accepted by the destination ledger but not yet confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    pub id: DepositId,
    pub tx_hash: String,
}

/// Returned once a submission is included with enough confirmations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub tx_hash: String,
    pub position: u64,
}

/// Write side of the destination ledger
#[async_trait]
pub trait DestinationLedger: Send + Sync {
    /// Whether `id` is in the ProcessedSet
    async fn is_processed(&self, id: &DepositId) -> Result<bool, LedgerError>;

    /// Submit a guarded mint. Rejects with [`LedgerError::AlreadyProcessed`]
    /// when the identifier already succeeded.
    async fn submit_fulfill(
        &self,
        request: &FulfillRequest,
        options: SubmitOptions,
    ) -> Result<PendingSubmission, LedgerError>;

    /// Wait until a submission is included with enough confirmations
    async fn await_confirmation(
        &self,
        submission: &PendingSubmission,
    ) -> Result<SubmissionReceipt, LedgerError>;
}
