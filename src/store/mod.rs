//! Deposit record store
//!
//! [`DepositStore`] is the persistence seam (memory, JSON file, Postgres).
//! [`RecordStore`] wraps a backend and is the only way the relay pipeline
//! touches records: it serializes work per identifier and enforces the status
//! state machine on every write.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::{RelayError, StoreError};
use crate::types::{DepositId, DepositNotification, DepositRecord, Status};

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Durable keyed storage of deposit records plus the watcher cursor
///
/// A successful write must survive a process crash before the call returns.
#[async_trait]
pub trait DepositStore: Send + Sync {
    async fn get(&self, id: &DepositId) -> Result<Option<DepositRecord>, StoreError>;

    /// Insert or replace the record keyed by `record.id`
    async fn upsert(&self, record: &DepositRecord) -> Result<(), StoreError>;

    /// Records in `Observed` or `Submitted`, ordered by source position
    async fn list_unconfirmed(&self) -> Result<Vec<DepositRecord>, StoreError>;

    /// Most recently updated records in `status`, at most `limit`
    async fn list_by_status(
        &self,
        status: Status,
        limit: usize,
    ) -> Result<Vec<DepositRecord>, StoreError>;

    /// Number of records per status (statuses with no records are omitted)
    async fn status_counts(&self) -> Result<HashMap<Status, u64>, StoreError>;

    /// Last source position whose deposits are all recorded
    async fn cursor(&self) -> Result<Option<u64>, StoreError>;

    async fn set_cursor(&self, position: u64) -> Result<(), StoreError>;
}

/// Outcome of recording a notification
#[derive(Debug, Clone, PartialEq)]
pub enum ObserveResult {
    /// First sighting; a fresh `Observed` record was persisted
    New(DepositRecord),
    /// Already known with identical fields
    Known(DepositRecord),
    /// Identifier already recorded with different recipient, amount or tag;
    /// the stored record wins
    Conflict(DepositRecord),
}

impl ObserveResult {
    pub fn record(&self) -> &DepositRecord {
        match self {
            ObserveResult::New(r) | ObserveResult::Known(r) | ObserveResult::Conflict(r) => r,
        }
    }
}

type LockMap = HashMap<DepositId, Arc<tokio::sync::Mutex<()>>>;

/// Per-identifier serialized access to a [`DepositStore`]
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn DepositStore>,
    locks: Arc<Mutex<LockMap>>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn DepositStore>) -> Self {
        Self {
            backend,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_id(&self, id: DepositId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(locks.entry(id).or_default())
        };
        mutex.lock_owned().await
    }

    /// Record a notification as `Observed` unless the identifier is already known
    pub async fn observe(
        &self,
        notification: &DepositNotification,
    ) -> Result<ObserveResult, StoreError> {
        let _lock = self.lock_id(notification.id).await;

        match self.backend.get(&notification.id).await? {
            Some(existing) if existing.matches(notification) => {
                debug!(deposit_id = %notification.id, status = %existing.status, "Deposit already recorded");
                Ok(ObserveResult::Known(existing))
            }
            Some(existing) => {
                warn!(
                    deposit_id = %notification.id,
                    stored_amount = existing.amount,
                    seen_amount = notification.amount,
                    stored_recipient = %existing.recipient,
                    seen_recipient = %notification.recipient,
                    "Deposit identifier reused with different fields, keeping stored record"
                );
                Ok(ObserveResult::Conflict(existing))
            }
            None => {
                let record = DepositRecord::observed(notification);
                self.backend.upsert(&record).await?;
                debug!(
                    deposit_id = %record.id,
                    amount = record.amount,
                    observed_at = record.observed_at,
                    "Deposit observed"
                );
                Ok(ObserveResult::New(record))
            }
        }
    }

    /// Take exclusive access to one record. `None` when the identifier is unknown.
    pub async fn acquire(&self, id: DepositId) -> Result<Option<RecordGuard>, StoreError> {
        let lock = self.lock_id(id).await;
        let Some(record) = self.backend.get(&id).await? else {
            return Ok(None);
        };
        Ok(Some(RecordGuard {
            record,
            backend: Arc::clone(&self.backend),
            _lock: lock,
        }))
    }

    pub async fn get(&self, id: &DepositId) -> Result<Option<DepositRecord>, StoreError> {
        self.backend.get(id).await
    }

    pub async fn list_unconfirmed(&self) -> Result<Vec<DepositRecord>, StoreError> {
        self.backend.list_unconfirmed().await
    }

    pub async fn list_by_status(
        &self,
        status: Status,
        limit: usize,
    ) -> Result<Vec<DepositRecord>, StoreError> {
        self.backend.list_by_status(status, limit).await
    }

    pub async fn status_counts(&self) -> Result<HashMap<Status, u64>, StoreError> {
        self.backend.status_counts().await
    }

    pub async fn cursor(&self) -> Result<Option<u64>, StoreError> {
        self.backend.cursor().await
    }

    pub async fn set_cursor(&self, position: u64) -> Result<(), StoreError> {
        self.backend.set_cursor(position).await
    }
}

/// Exclusive handle on one record; dropping it releases the identifier
pub struct RecordGuard {
    record: DepositRecord,
    backend: Arc<dyn DepositStore>,
    _lock: OwnedMutexGuard<()>,
}

impl RecordGuard {
    pub fn record(&self) -> &DepositRecord {
        &self.record
    }

    pub fn status(&self) -> Status {
        self.record.status
    }

    /// Move the record to `next`, applying `update` to the other fields, and
    /// persist it before returning.
    ///
    /// Returns `Ok(false)` without writing when the record is already terminal.
    pub async fn transition<F>(&mut self, next: Status, update: F) -> Result<bool, RelayError>
    where
        F: FnOnce(&mut DepositRecord),
    {
        let current = self.record.status;
        if current.is_terminal() {
            warn!(
                deposit_id = %self.record.id,
                from = %current,
                to = %next,
                "Ignoring transition out of terminal state"
            );
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            return Err(RelayError::InvalidTransition {
                id: self.record.id,
                from: current,
                to: next,
            });
        }

        let mut updated = self.record.clone();
        update(&mut updated);
        updated.status = next;
        updated.updated_at = Utc::now();

        self.backend.upsert(&updated).await?;
        debug!(deposit_id = %updated.id, from = %current, to = %next, "Deposit status updated");
        self.record = updated;
        Ok(true)
    }
}
