//! JSON file store backend
//!
//! The whole state is rewritten on every change: serialized to a temp file,
//! fsynced, then renamed over the previous file, and the directory is synced.
//! A crash at any point leaves either the old or the new state on disk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::memory::sort_by_position;
use super::DepositStore;
use crate::error::StoreError;
use crate::types::{DepositId, DepositRecord, Status};

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    cursor: Option<u64>,
    #[serde(default)]
    records: Vec<DepositRecord>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<DepositId, DepositRecord>,
    cursor: Option<u64>,
}

pub struct FileStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Open the state file at `path`, starting empty if it does not exist
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: StateFile = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
                info!(
                    path = %path.display(),
                    records = state.records.len(),
                    cursor = ?state.cursor,
                    "Loaded relayer state"
                );
                Inner {
                    records: state.records.into_iter().map(|r| (r.id, r)).collect(),
                    cursor: state.cursor,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No relayer state found, starting fresh");
                Inner::default()
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, inner: &Inner) -> Result<(), StoreError> {
        let mut records: Vec<_> = inner.records.values().cloned().collect();
        sort_by_position(&mut records);
        let state = StateFile {
            cursor: inner.cursor,
            records,
        };
        let bytes = serde_json::to_vec_pretty(&state)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let tmp_path = self.path.with_extension("json.tmp");
        let unavailable =
            |e: std::io::Error| StoreError::Unavailable(format!("{}: {}", self.path.display(), e));

        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(unavailable)?;
        file.write_all(&bytes).await.map_err(unavailable)?;
        file.sync_all().await.map_err(unavailable)?;
        drop(file);
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(unavailable)?;
        sync_parent_dir(&self.path).await.map_err(unavailable)?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "Relayer state saved");
        Ok(())
    }
}

/// Make a completed rename durable by syncing the directory entry
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl DepositStore for FileStore {
    async fn get(&self, id: &DepositId) -> Result<Option<DepositRecord>, StoreError> {
        Ok(self.inner.lock().await.records.get(id).cloned())
    }

    async fn upsert(&self, record: &DepositRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let previous = inner.records.insert(record.id, record.clone());
        if let Err(e) = self.persist(&inner).await {
            match previous {
                Some(prev) => inner.records.insert(record.id, prev),
                None => inner.records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn list_unconfirmed(&self) -> Result<Vec<DepositRecord>, StoreError> {
        let inner = self.inner.lock().await;
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
        let inner = self.inner.lock().await;
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
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for record in inner.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn cursor(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.lock().await.cursor)
    }

    async fn set_cursor(&self, position: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let previous = inner.cursor.replace(position);
        if let Err(e) = self.persist(&inner).await {
            inner.cursor = previous;
            return Err(e);
        }
        Ok(())
    }
}
