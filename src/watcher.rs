//! Event Watcher
//!
//! Scans the source ledger's deposit log by position range and feeds a single
//! channel: first a catch-up pass over a bounded historical window, then a
//! follow loop polling the head. Both passes produce the same
//! [`WatchEvent`] stream, so the processing pipeline never needs to know which
//! one delivered a notification.
//!
//! The watcher never deduplicates and never skips a range: a failed chunk is
//! retried from the same position until it succeeds.

use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, RelayError};
use crate::ledger::SourceLedger;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::types::DepositNotification;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Catch-up window `W`, in source positions
    pub catch_up_window: u64,
    /// Maximum positions per source query
    pub max_block_range: u64,
    /// Follow-mode poll interval
    pub poll_interval: Duration,
    /// Backoff between retries of an unavailable range
    pub backoff: RetryConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            catch_up_window: 1000,
            max_block_range: 10_000,
            poll_interval: Duration::from_millis(1000),
            backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                backoff_multiplier: 2.0,
            },
        }
    }
}

/// What the watcher hands to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Deposit(DepositNotification),
    /// Every deposit at or below this position has been delivered
    Checkpoint(u64),
}

/// Deposits found in one scanned chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBatch {
    pub from: u64,
    pub to: u64,
    pub deposits: Vec<DepositNotification>,
}

/// Range scanned once at startup: the last `window` positions, extended back
/// to just after the persisted cursor when that is older
pub fn catch_up_range(head: u64, window: u64, cursor: Option<u64>) -> (u64, u64) {
    let mut from = head.saturating_sub(window);
    if let Some(cursor) = cursor {
        from = from.min(cursor.saturating_add(1));
    }
    (from, head)
}

fn source_unavailable(from: u64, to: u64, error: LedgerError) -> RelayError {
    RelayError::SourceUnavailable {
        from,
        to,
        reason: error.to_string(),
    }
}

pub struct EventWatcher {
    source: Arc<dyn SourceLedger>,
    config: WatcherConfig,
}

impl EventWatcher {
    pub fn new(source: Arc<dyn SourceLedger>, config: WatcherConfig) -> Self {
        Self { source, config }
    }

    /// Lazily scan `[from, to]` in chunks of at most `max_block_range`
    /// positions. Each batch is sorted by position. The stream ends after the
    /// first error; restarting from the failed batch's `from` is always safe.
    pub fn scan(
        &self,
        from: u64,
        to: u64,
    ) -> impl Stream<Item = Result<ScanBatch, RelayError>> + Send + 'static {
        let source = Arc::clone(&self.source);
        let chunk = self.config.max_block_range.max(1);

        stream::try_unfold(Some(from), move |next| {
            let source = Arc::clone(&source);
            async move {
                let Some(next) = next.filter(|n| *n <= to) else {
                    return Ok(None);
                };
                let chunk_to = next.saturating_add(chunk - 1).min(to);
                let mut deposits = source
                    .deposits_in_range(next, chunk_to)
                    .await
                    .map_err(|e| source_unavailable(next, chunk_to, e))?;
                deposits.sort_by_key(|d| d.observed_at);

                let batch = ScanBatch {
                    from: next,
                    to: chunk_to,
                    deposits,
                };
                Ok(Some((batch, chunk_to.checked_add(1))))
            }
        })
    }

    async fn head_with_retry(&self) -> u64 {
        let mut failures = 0u32;
        loop {
            match self.source.head().await {
                Ok(head) => return head,
                Err(e) => {
                    metrics::record_source_error("head");
                    let backoff = self.config.backoff.backoff_for_attempt(failures);
                    warn!(error = %e, ?backoff, "Failed to read source head, retrying");
                    failures = failures.saturating_add(1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Deliver every deposit in `[from, to]` followed by checkpoints.
    /// Returns `false` once the receiving side has gone away.
    async fn deliver_range(&self, from: u64, to: u64, tx: &mpsc::Sender<WatchEvent>) -> bool {
        let mut next = from;
        let mut failures = 0u32;

        while next <= to {
            let mut batches = Box::pin(self.scan(next, to));
            while let Some(result) = batches.next().await {
                match result {
                    Ok(batch) => {
                        debug!(
                            from_block = batch.from,
                            to_block = batch.to,
                            count = batch.deposits.len(),
                            "Scanned source range"
                        );
                        for deposit in batch.deposits {
                            if tx.send(WatchEvent::Deposit(deposit)).await.is_err() {
                                return false;
                            }
                        }
                        if tx.send(WatchEvent::Checkpoint(batch.to)).await.is_err() {
                            return false;
                        }
                        failures = 0;
                        if batch.to == u64::MAX {
                            return true;
                        }
                        next = batch.to + 1;
                    }
                    Err(e) => {
                        metrics::record_source_error("scan");
                        let backoff = self.config.backoff.backoff_for_attempt(failures);
                        warn!(error = %e, ?backoff, "Source range unavailable, retrying same range");
                        failures = failures.saturating_add(1);
                        tokio::time::sleep(backoff).await;
                        break;
                    }
                }
            }
        }
        true
    }

    /// Catch-up from `cursor`, then follow the head until the receiver is dropped
    pub async fn run(&self, cursor: Option<u64>, tx: mpsc::Sender<WatchEvent>) {
        let head = self.head_with_retry().await;
        let (from, to) = catch_up_range(head, self.config.catch_up_window, cursor);
        info!(from_block = from, to_block = to, ?cursor, "Starting catch-up scan");

        if !self.deliver_range(from, to, &tx).await {
            return;
        }
        info!(head = to, "Catch-up complete, following source head");

        let mut last = to;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let head = match self.source.head().await {
                Ok(head) => head,
                Err(e) => {
                    metrics::record_source_error("head");
                    warn!(error = %e, "Failed to poll source head");
                    continue;
                }
            };
            if head <= last {
                continue;
            }
            if !self.deliver_range(last + 1, head, &tx).await {
                return;
            }
            last = head;
        }
    }
}
