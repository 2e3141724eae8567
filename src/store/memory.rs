//! Volatile store backend, used by tests and dry runs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::DepositStore;
use crate::error::StoreError;
use crate::types::{DepositId, DepositRecord, Status};

#[derive(Default)]
struct Inner {
    records: HashMap<DepositId, DepositRecord>,
    cursor: Option<u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

/// Sort by source position, then identifier, for deterministic ordering
pub(super) fn sort_by_position(records: &mut [DepositRecord]) {
    records.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl DepositStore for MemoryStore {
    async fn get(&self, id: &DepositId) -> Result<Option<DepositRecord>, StoreError> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn upsert(&self, record: &DepositRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner
            .write()
            .await
            .records
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn list_unconfirmed(&self) -> Result<Vec<DepositRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        sort_by_position(&mut records);
        Ok(records)
    }

    async fn list_by_status(
        &self,
        status: Status,
        limit: usize,
    ) -> Result<Vec<DepositRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn status_counts(&self) -> Result<HashMap<Status, u64>, StoreError> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for record in inner.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn cursor(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.read().await.cursor)
    }

    async fn set_cursor(&self, position: u64) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.write().await.cursor = Some(position);
        Ok(())
    }
}
