//! Relay Orchestrator
//!
//! Owns the relay lifecycle:
//! 1. Recovery: every `Observed`/`Submitted` record left by a previous run is
//!    re-driven; the engine re-verifies against the destination ProcessedSet
//!    before any resubmission.
//! 2. Catch-up then follow: watcher events arrive on one channel; each
//!    notification is recorded through the [`RecordStore`] and dispatched to a
//!    bounded worker pool, each checkpoint is persisted once every earlier
//!    notification has been recorded.
//! 3. Per-deposit state machine with bounded, backed-off retries.
//!
//! Store failures are fatal: the run stops rather than submit without durable
//! idempotency state.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::{FulfillmentEngine, Outcome};
use crate::error::RelayError;
use crate::ledger::{SourceLedger, SubmitOptions};
use crate::metrics;
use crate::retry::{RetryAction, RetryConfig};
use crate::store::{ObserveResult, RecordGuard, RecordStore};
use crate::types::{ChainTag, DepositId, DepositNotification, Status};
use crate::watcher::{EventWatcher, WatchEvent, WatcherConfig};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Only relay deposits routed to this destination; `None` relays all
    pub dest_chain_tag: Option<ChainTag>,
    /// Maximum deposits processed concurrently
    pub worker_concurrency: usize,
    pub retry: RetryConfig,
    pub watcher: WatcherConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dest_chain_tag: None,
            worker_concurrency: 8,
            retry: RetryConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Drives single deposits through the state machine
#[derive(Clone)]
pub struct RelayWorker {
    store: RecordStore,
    engine: Arc<FulfillmentEngine>,
    retry: RetryConfig,
    /// Bounds concurrent submissions; not held across backoff sleeps
    permits: Arc<Semaphore>,
}

async fn transition(
    guard: &mut RecordGuard,
    next: Status,
    update: impl FnOnce(&mut crate::types::DepositRecord),
) -> Result<(), RelayError> {
    let from = guard.status();
    if guard.transition(next, update).await? {
        metrics::record_transition(from, next);
    }
    Ok(())
}

impl RelayWorker {
    pub fn new(store: RecordStore, engine: Arc<FulfillmentEngine>, retry: RetryConfig) -> Self {
        Self {
            store,
            engine,
            retry,
            permits: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    /// Share one submission limit across every clone of this worker
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(concurrency.max(1)));
        self
    }

    /// Process one deposit until it reaches a terminal status.
    ///
    /// Returns the final status, or `None` if the identifier is unknown.
    pub async fn process(&self, id: DepositId) -> Result<Option<Status>, RelayError> {
        let Some(mut guard) = self.store.acquire(id).await? else {
            warn!(deposit_id = %id, "No record for deposit, nothing to process");
            return Ok(None);
        };

        let mut options = SubmitOptions::default();
        loop {
            match guard.status() {
                Status::Confirmed | Status::Failed => return Ok(Some(guard.status())),
                // In-flight before a restart: the engine re-checks the
                // ProcessedSet before resubmitting
                Status::Submitted => {
                    info!(deposit_id = %id, "Re-verifying submitted deposit");
                }
                Status::Observed => {
                    transition(&mut guard, Status::Submitted, |_| {}).await?;
                }
            }

            let record = guard.record().clone();
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| RelayError::Task("worker pool closed".into()))?;
                self.engine.fulfill_with(&record, options).await
            };
            debug!(deposit_id = %id, outcome = outcome.label(), "Fulfillment attempt finished");

            match outcome {
                Outcome::Confirmed { tx_hash, .. } => {
                    transition(&mut guard, Status::Confirmed, |r| {
                        r.fulfillment_tx = Some(tx_hash);
                        r.last_error = None;
                    })
                    .await?;
                }
                Outcome::AlreadyProcessed => {
                    transition(&mut guard, Status::Confirmed, |r| r.last_error = None).await?;
                }
                Outcome::PermanentFailure(reason) => {
                    error!(
                        deposit_id = %id,
                        sender = %record.sender,
                        recipient = %record.recipient,
                        amount = record.amount,
                        dest_chain_tag = %record.dest_chain_tag,
                        error = %reason,
                        "Permanent fulfillment failure, operator attention required"
                    );
                    metrics::record_failed("permanent");
                    transition(&mut guard, Status::Failed, |r| r.last_error = Some(reason)).await?;
                }
                Outcome::TransientFailure(reason) => {
                    let attempts = record.attempts.saturating_add(1);
                    let detail = reason.to_string();
                    match self.retry.decide(attempts, reason.kind) {
                        RetryAction::GiveUp => {
                            error!(
                                deposit_id = %id,
                                recipient = %record.recipient,
                                amount = record.amount,
                                attempt = attempts,
                                error = %detail,
                                "Retries exhausted, operator attention required"
                            );
                            metrics::record_failed("retries_exhausted");
                            transition(&mut guard, Status::Failed, |r| {
                                r.attempts = attempts;
                                r.last_error = Some(detail);
                            })
                            .await?;
                        }
                        RetryAction::RetryAfter {
                            backoff,
                            refresh_ordering,
                        } => {
                            warn!(
                                deposit_id = %id,
                                attempt = attempts,
                                ?backoff,
                                error = %detail,
                                "Transient fulfillment failure, retrying"
                            );
                            metrics::record_retry(reason.kind.as_str());
                            transition(&mut guard, Status::Observed, |r| {
                                r.attempts = attempts;
                                r.last_error = Some(detail);
                            })
                            .await?;
                            tokio::time::sleep(backoff).await;
                            options = SubmitOptions { refresh_ordering };
                        }
                    }
                }
            }
        }
    }
}

pub struct Orchestrator {
    store: RecordStore,
    worker: RelayWorker,
    watcher: Arc<EventWatcher>,
    config: OrchestratorConfig,
}

/// Per-deposit worker tasks; never runs two workers for one id
struct WorkerPool {
    tasks: JoinSet<(DepositId, Result<Option<Status>, RelayError>)>,
    in_flight: HashSet<DepositId>,
}

impl WorkerPool {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            in_flight: HashSet::new(),
        }
    }

    fn dispatch(&mut self, worker: &RelayWorker, id: DepositId) {
        if !self.in_flight.insert(id) {
            debug!(deposit_id = %id, "Deposit already in flight");
            return;
        }
        let worker = worker.clone();
        self.tasks.spawn(async move { (id, worker.process(id).await) });
    }
}

impl Orchestrator {
    pub fn new(
        store: RecordStore,
        source: Arc<dyn SourceLedger>,
        engine: FulfillmentEngine,
        config: OrchestratorConfig,
    ) -> Self {
        let worker = RelayWorker::new(store.clone(), Arc::new(engine), config.retry.clone())
            .with_concurrency(config.worker_concurrency);
        let watcher = Arc::new(EventWatcher::new(source, config.watcher.clone()));
        Self {
            store,
            worker,
            watcher,
            config,
        }
    }

    /// Run recovery, then catch-up and follow until `shutdown` resolves or a
    /// fatal error occurs
    pub async fn run<F>(&self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        metrics::UP.set(1.0);
        let result = self.run_inner(shutdown).await;
        metrics::UP.set(0.0);
        if let Err(e) = &result {
            error!(error = %e, "Relay stopped on fatal error");
        }
        result
    }

    async fn run_inner<F>(&self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        let mut pool = WorkerPool::new();

        let unconfirmed = self.store.list_unconfirmed().await?;
        info!(count = unconfirmed.len(), "Recovering unconfirmed deposits");
        for record in &unconfirmed {
            pool.dispatch(&self.worker, record.id);
        }

        let cursor = self.store.cursor().await?;
        let (tx, mut rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let watcher = Arc::clone(&self.watcher);
        let watch_task = tokio::spawn(async move { watcher.run(cursor, tx).await });

        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(in_flight = pool.in_flight.len(), "Shutdown requested");
                    break Ok(());
                }
                event = rx.recv() => match event {
                    Some(WatchEvent::Deposit(notification)) => {
                        if let Err(e) = self.handle_notification(&notification, &mut pool).await {
                            break Err(e);
                        }
                    }
                    Some(WatchEvent::Checkpoint(position)) => {
                        if let Err(e) = self.store.set_cursor(position).await {
                            break Err(e.into());
                        }
                        metrics::record_cursor(position);
                    }
                    None => break Err(RelayError::Task("watcher stopped".into())),
                },
                Some(joined) = pool.tasks.join_next(), if !pool.tasks.is_empty() => {
                    match joined {
                        Ok((id, Ok(status))) => {
                            pool.in_flight.remove(&id);
                            debug!(deposit_id = %id, ?status, "Deposit processing finished");
                        }
                        Ok((_, Err(e))) => break Err(e),
                        Err(e) => break Err(RelayError::Task(e.to_string())),
                    }
                }
            }
        };

        // Records are persisted before every submission, so aborting
        // in-flight work is recovered on the next start
        watch_task.abort();
        pool.tasks.shutdown().await;
        result
    }

    async fn handle_notification(
        &self,
        notification: &DepositNotification,
        pool: &mut WorkerPool,
    ) -> Result<(), RelayError> {
        if let Some(tag) = self.config.dest_chain_tag {
            if notification.dest_chain_tag != tag {
                debug!(
                    deposit_id = %notification.id,
                    dest_chain_tag = %notification.dest_chain_tag,
                    "Deposit routed to another destination, skipping"
                );
                metrics::record_notification("other_destination");
                return Ok(());
            }
        }

        // The worker owns this id's record lock until it finishes; the record
        // already exists, so observing again would only wait on that lock
        if pool.in_flight.contains(&notification.id) {
            debug!(deposit_id = %notification.id, "Deposit already in flight, skipping duplicate");
            metrics::record_notification("in_flight");
            return Ok(());
        }

        let result = self.store.observe(notification).await?;
        let label = match &result {
            ObserveResult::New(_) => "new",
            ObserveResult::Known(_) => "duplicate",
            ObserveResult::Conflict(_) => "conflict",
        };
        metrics::record_notification(label);

        let record = result.record();
        if record.status.is_terminal() {
            debug!(deposit_id = %record.id, status = %record.status, "Deposit already settled");
            return Ok(());
        }
        if let ObserveResult::New(_) = result {
            info!(
                deposit_id = %record.id,
                recipient = %record.recipient,
                amount = record.amount,
                from_block = record.observed_at,
                "New deposit observed"
            );
        }
        pool.dispatch(&self.worker, record.id);
        Ok(())
    }
}
