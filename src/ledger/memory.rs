//! In-process bridge ledger
//!
//! Reproduces the token + bridge contract pair the relayer is deployed against:
//! a trusted token with mint/burn, a bridge whose `deposit` burns and emits a
//! `Deposited` log entry, and a relayer-gated `fulfill` protected by a
//! ProcessedSet. Cloned handles share state, so two "relayer processes" can be
//! pointed at the same ledger.
//!
//! Fault injection hooks (unavailability, queued submission errors, slow
//! confirmations) exist for exercising the relay pipeline's failure paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{
    DestinationLedger, FulfillRequest, PendingSubmission, SourceLedger, SubmissionReceipt,
    SubmitOptions,
};
use crate::error::LedgerError;
use crate::types::{ChainTag, DepositId, DepositNotification, EvmAddress};

#[derive(Default)]
struct LedgerState {
    height: u64,
    balances: HashMap<EvmAddress, u128>,
    total_supply: u128,
    processed: HashSet<DepositId>,
    /// Successful fulfillments per identifier; never exceeds 1
    fulfillments: HashMap<DepositId, u32>,
    deposit_log: Vec<DepositNotification>,
    relayers: HashSet<EvmAddress>,
    receipts: HashMap<String, u64>,
    tx_counter: u64,
    unavailable: bool,
    submit_faults: VecDeque<LedgerError>,
    confirmation_delay: Duration,
}

/// Shared-state simulated ledger
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    /// Account this handle submits fulfillments as
    submitter: EvmAddress,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            submitter: EvmAddress::ZERO,
        }
    }

    /// New ledger whose handle submits as `relayer`, already on the allowlist
    pub fn with_relayer(relayer: EvmAddress) -> Self {
        let ledger = Self::new().as_submitter(relayer);
        ledger.set_relayer(relayer, true);
        ledger
    }

    /// Another handle on the same ledger submitting as `submitter`
    pub fn as_submitter(&self, submitter: EvmAddress) -> Self {
        Self {
            state: Arc::clone(&self.state),
            submitter,
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Token / bridge administration
    // ------------------------------------------------------------------

    /// Add or remove an account from the relayer allowlist
    pub fn set_relayer(&self, relayer: EvmAddress, allowed: bool) {
        let mut state = self.state();
        if allowed {
            state.relayers.insert(relayer);
        } else {
            state.relayers.remove(&relayer);
        }
    }

    pub fn trusted_mint(&self, to: EvmAddress, amount: u128) {
        let mut state = self.state();
        *state.balances.entry(to).or_default() += amount;
        state.total_supply += amount;
    }

    fn burn_locked(
        state: &mut LedgerState,
        from: EvmAddress,
        amount: u128,
    ) -> Result<(), LedgerError> {
        let have = state.balances.get(&from).copied().unwrap_or_default();
        if have < amount {
            return Err(LedgerError::InsufficientBalance { have, need: amount });
        }
        state.balances.insert(from, have - amount);
        state.total_supply -= amount;
        Ok(())
    }

    /// Burn `amount` from `sender` and append a deposit event at a new position
    pub fn deposit(
        &self,
        sender: EvmAddress,
        recipient: EvmAddress,
        amount: u128,
        dest_chain_tag: ChainTag,
        id: DepositId,
    ) -> Result<DepositNotification, LedgerError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Self::burn_locked(&mut state, sender, amount)?;
        state.height += 1;
        let notification = DepositNotification {
            id,
            sender,
            recipient,
            amount,
            dest_chain_tag,
            observed_at: state.height,
        };
        state.deposit_log.push(notification.clone());
        debug!(deposit_id = %id, amount, position = state.height, "Deposit recorded");
        Ok(notification)
    }

    /// Mine `blocks` empty positions
    pub fn advance(&self, blocks: u64) {
        self.state().height += blocks;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn height(&self) -> u64 {
        self.state().height
    }

    pub fn balance_of(&self, account: EvmAddress) -> u128 {
        self.state().balances.get(&account).copied().unwrap_or_default()
    }

    pub fn total_supply(&self) -> u128 {
        self.state().total_supply
    }

    /// Number of successful fulfillments recorded for `id`
    pub fn fulfillment_count(&self, id: &DepositId) -> u32 {
        self.state().fulfillments.get(id).copied().unwrap_or_default()
    }

    pub fn processed_count(&self) -> usize {
        self.state().processed.len()
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Fail the next submission with `error` (queued, FIFO)
    pub fn push_submit_fault(&self, error: LedgerError) {
        self.state().submit_faults.push_back(error);
    }

    /// Delay every confirmation wait by `delay`
    pub fn set_confirmation_delay(&self, delay: Duration) {
        self.state().confirmation_delay = delay;
    }
}

#[async_trait]
impl SourceLedger for InMemoryLedger {
    async fn head(&self) -> Result<u64, LedgerError> {
        let state = self.state();
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(state.height)
    }

    async fn deposits_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<DepositNotification>, LedgerError> {
        let state = self.state();
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(state
            .deposit_log
            .iter()
            .filter(|n| n.observed_at >= from && n.observed_at <= to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DestinationLedger for InMemoryLedger {
    async fn is_processed(&self, id: &DepositId) -> Result<bool, LedgerError> {
        let state = self.state();
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(state.processed.contains(id))
    }

    async fn submit_fulfill(
        &self,
        request: &FulfillRequest,
        options: SubmitOptions,
    ) -> Result<PendingSubmission, LedgerError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        if let Some(fault) = state.submit_faults.pop_front() {
            return Err(fault);
        }
        if !state.relayers.contains(&self.submitter) {
            return Err(LedgerError::NotRelayer);
        }
        if state.processed.contains(&request.id) {
            return Err(LedgerError::AlreadyProcessed);
        }
        if request.recipient.is_zero() {
            return Err(LedgerError::InvalidRecipient(request.recipient.to_hex()));
        }

        state.processed.insert(request.id);
        *state.fulfillments.entry(request.id).or_default() += 1;
        *state.balances.entry(request.recipient).or_default() += request.amount;
        state.total_supply += request.amount;
        state.height += 1;
        state.tx_counter += 1;
        let tx_hash = format!("0x{:064x}", state.tx_counter);
        let position = state.height;
        state.receipts.insert(tx_hash.clone(), position);

        debug!(
            deposit_id = %request.id,
            recipient = %request.recipient,
            amount = request.amount,
            refresh_ordering = options.refresh_ordering,
            %tx_hash,
            "Fulfillment applied"
        );

        Ok(PendingSubmission {
            id: request.id,
            tx_hash,
        })
    }

    async fn await_confirmation(
        &self,
        submission: &PendingSubmission,
    ) -> Result<SubmissionReceipt, LedgerError> {
        let delay = self.state().confirmation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state();
        match state.receipts.get(&submission.tx_hash) {
            Some(&position) => Ok(SubmissionReceipt {
                tx_hash: submission.tx_hash.clone(),
                position,
            }),
            None => Err(LedgerError::Rejected(format!(
                "unknown transaction {}",
                submission.tx_hash
            ))),
        }
    }
}
