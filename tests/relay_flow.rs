//! End-to-end relay tests against in-process ledgers
//!
//! Each test drives a full `Orchestrator::run` (recovery, catch-up, follow,
//! workers) between a source and a destination `InMemoryLedger`.

use std::sync::Arc;
use std::time::Duration;

use bridge_relayer::engine::FulfillmentEngine;
use bridge_relayer::error::{LedgerError, RelayError};
use bridge_relayer::ledger::{
    DestinationLedger, FulfillRequest, InMemoryLedger, SourceLedger, SubmitOptions,
};
use bridge_relayer::orchestrator::{Orchestrator, OrchestratorConfig};
use bridge_relayer::retry::RetryConfig;
use bridge_relayer::store::{DepositStore, MemoryStore, RecordStore};
use bridge_relayer::types::{ChainTag, DepositId, DepositRecord, EvmAddress, Status};
use bridge_relayer::watcher::WatcherConfig;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const RELAYER: EvmAddress = EvmAddress([0xaa; 20]);
const SECOND_RELAYER: EvmAddress = EvmAddress([0xbb; 20]);
const ALICE: EvmAddress = EvmAddress([0x01; 20]);
const BOB: EvmAddress = EvmAddress([0x02; 20]);
const CAROL: EvmAddress = EvmAddress([0x03; 20]);
const DEST: ChainTag = ChainTag(1000);

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        dest_chain_tag: Some(DEST),
        worker_concurrency: 4,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        },
        watcher: WatcherConfig {
            catch_up_window: 1000,
            max_block_range: 4,
            poll_interval: Duration::from_millis(10),
            backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                backoff_multiplier: 2.0,
            },
        },
    }
}

struct Harness {
    source: InMemoryLedger,
    destination: InMemoryLedger,
    backend: Arc<MemoryStore>,
    store: RecordStore,
    config: OrchestratorConfig,
    submission_timeout: Duration,
}

impl Harness {
    fn new() -> Self {
        let source = InMemoryLedger::new();
        source.trusted_mint(ALICE, 1_000_000);
        let backend = Arc::new(MemoryStore::new());
        Self {
            source,
            destination: InMemoryLedger::with_relayer(RELAYER),
            store: RecordStore::new(backend.clone()),
            backend,
            config: fast_config(),
            submission_timeout: Duration::from_secs(5),
        }
    }

    /// Fresh local state against the same ledgers, as after losing the store
    fn with_fresh_store(&self) -> Self {
        let backend = Arc::new(MemoryStore::new());
        Self {
            source: self.source.clone(),
            destination: self.destination.clone(),
            store: RecordStore::new(backend.clone()),
            backend,
            config: self.config.clone(),
            submission_timeout: self.submission_timeout,
        }
    }

    fn deposit(&self, label: &str, recipient: EvmAddress, amount: u128) -> DepositId {
        self.deposit_to(label, recipient, amount, DEST)
    }

    fn deposit_to(
        &self,
        label: &str,
        recipient: EvmAddress,
        amount: u128,
        tag: ChainTag,
    ) -> DepositId {
        let id = DepositId::from_label(label);
        self.source.deposit(ALICE, recipient, amount, tag, id).unwrap();
        id
    }

    fn start(&self) -> Running {
        self.start_against(self.destination.clone())
    }

    fn start_against(&self, destination: InMemoryLedger) -> Running {
        let engine = FulfillmentEngine::new(Arc::new(destination), self.submission_timeout);
        let orchestrator = Orchestrator::new(
            self.store.clone(),
            Arc::new(self.source.clone()),
            engine,
            self.config.clone(),
        );
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            orchestrator
                .run(async {
                    let _ = stopped.await;
                })
                .await
        });
        Running { stop, handle }
    }

    async fn record(&self, id: DepositId) -> Option<DepositRecord> {
        self.store.get(&id).await.unwrap()
    }

    async fn wait_for_status(&self, id: DepositId, status: Status) -> DepositRecord {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(record) = self.record(id).await {
                    if record.status == status {
                        return record;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("deposit {} never reached {}", id, status))
    }

    async fn wait_for_cursor(&self, at_least: u64) {
        tokio::time::timeout(WAIT, async {
            loop {
                if self.store.cursor().await.unwrap().unwrap_or(0) >= at_least {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("cursor never reached {}", at_least));
    }
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), RelayError>>,
}

impl Running {
    async fn shutdown(self) -> Result<(), RelayError> {
        let _ = self.stop.send(());
        self.handle.await.unwrap()
    }
}

#[tokio::test]
async fn test_each_deposit_is_fulfilled_exactly_once() {
    let h = Harness::new();
    let a = h.deposit("a", BOB, 100);
    let b = h.deposit("b", CAROL, 250);
    let running = h.start();

    // Live deposit picked up by the follow loop
    let c = h.deposit("c", BOB, 7);

    for id in [a, b, c] {
        let record = h.wait_for_status(id, Status::Confirmed).await;
        assert!(record.fulfillment_tx.is_some());
        assert_eq!(h.destination.fulfillment_count(&id), 1);
    }
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.balance_of(BOB), 107);
    assert_eq!(h.destination.balance_of(CAROL), 250);
    // Burned on one side, minted on the other
    assert_eq!(h.source.total_supply(), 1_000_000 - 357);
    assert_eq!(h.destination.total_supply(), 357);
}

#[tokio::test]
async fn test_restart_does_not_refulfill() {
    let h = Harness::new();
    let a = h.deposit("a", BOB, 40);
    let b = h.deposit("b", CAROL, 60);

    let running = h.start();
    h.wait_for_status(a, Status::Confirmed).await;
    h.wait_for_status(b, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    // Same store: nothing left to do, everything stays settled
    let running = h.start();
    h.wait_for_cursor(h.source.height()).await;
    running.shutdown().await.unwrap();

    // Lost store: every deposit is replayed, the ProcessedSet absorbs it
    let replay = h.with_fresh_store();
    let running = replay.start();
    replay.wait_for_status(a, Status::Confirmed).await;
    replay.wait_for_status(b, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.fulfillment_count(&a), 1);
    assert_eq!(h.destination.fulfillment_count(&b), 1);
    assert_eq!(h.destination.balance_of(BOB), 40);
    assert_eq!(h.destination.balance_of(CAROL), 60);
}

#[tokio::test]
async fn test_recovers_submitted_record_without_mint() {
    let h = Harness::new();
    let id = h.deposit("crashed", BOB, 500);
    let notification = h.source.deposits_in_range(0, 10).await.unwrap().remove(0);

    // Crash after persisting Submitted but before the transaction was sent
    let mut record = DepositRecord::observed(&notification);
    record.status = Status::Submitted;
    h.backend.upsert(&record).await.unwrap();

    let running = h.start();
    h.wait_for_status(id, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.fulfillment_count(&id), 1);
    assert_eq!(h.destination.balance_of(BOB), 500);
}

#[tokio::test]
async fn test_recovers_submitted_record_after_mint_landed() {
    let h = Harness::new();
    let id = h.deposit("landed", BOB, 500);
    let notification = h.source.deposits_in_range(0, 10).await.unwrap().remove(0);

    // Crash after the mint landed but before Confirmed was recorded
    h.destination
        .submit_fulfill(
            &FulfillRequest {
                recipient: BOB,
                amount: 500,
                id,
            },
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let mut record = DepositRecord::observed(&notification);
    record.status = Status::Submitted;
    h.backend.upsert(&record).await.unwrap();

    let running = h.start();
    h.wait_for_status(id, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.fulfillment_count(&id), 1);
    assert_eq!(h.destination.balance_of(BOB), 500);
}

#[tokio::test]
async fn test_deposit_already_processed_elsewhere() {
    let h = Harness::new();
    let id = h.deposit("elsewhere", CAROL, 9);
    h.destination
        .submit_fulfill(
            &FulfillRequest {
                recipient: CAROL,
                amount: 9,
                id,
            },
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    let running = h.start();
    let record = h.wait_for_status(id, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(record.attempts, 0);
    assert_eq!(h.destination.fulfillment_count(&id), 1);
    assert_eq!(h.destination.balance_of(CAROL), 9);
}

#[tokio::test]
async fn test_catch_up_resumes_from_cursor_across_restart() {
    let mut h = Harness::new();
    h.config.watcher.catch_up_window = 5;

    let first = h.deposit("first", BOB, 1);
    let running = h.start();
    h.wait_for_status(first, Status::Confirmed).await;
    h.wait_for_cursor(h.source.height()).await;
    running.shutdown().await.unwrap();

    // While down: one deposit far outside the window, then many positions
    let missed = h.deposit("while-down", BOB, 2);
    h.source.advance(50);
    let recent = h.deposit("recent", BOB, 3);

    let running = h.start();
    h.wait_for_status(missed, Status::Confirmed).await;
    h.wait_for_status(recent, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.balance_of(BOB), 6);
}

#[tokio::test]
async fn test_fresh_start_only_scans_the_window() {
    let mut h = Harness::new();
    h.config.watcher.catch_up_window = 5;

    let old = h.deposit("old", BOB, 2);
    h.source.advance(50);
    let recent = h.deposit("recent", BOB, 3);

    let running = h.start();
    h.wait_for_status(recent, Status::Confirmed).await;
    h.wait_for_cursor(h.source.height()).await;
    running.shutdown().await.unwrap();

    assert!(h.record(old).await.is_none());
    assert_eq!(h.destination.fulfillment_count(&old), 0);
}

#[tokio::test]
async fn test_zero_amount_deposit_is_relayed() {
    let h = Harness::new();
    let id = h.deposit("zero", BOB, 0);

    let running = h.start();
    h.wait_for_status(id, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.fulfillment_count(&id), 1);
    assert_eq!(h.destination.balance_of(BOB), 0);
    assert_eq!(h.destination.processed_count(), 1);
}

#[tokio::test]
async fn test_two_relayers_race_without_double_mint() {
    let h = Harness::new();
    h.destination.set_relayer(SECOND_RELAYER, true);
    let other = h.with_fresh_store();

    let ids: Vec<DepositId> = (0..6)
        .map(|i| h.deposit(&format!("race-{}", i), BOB, 10))
        .collect();

    let first = h.start();
    let second = other.start_against(h.destination.as_submitter(SECOND_RELAYER));

    for id in &ids {
        h.wait_for_status(*id, Status::Confirmed).await;
        other.wait_for_status(*id, Status::Confirmed).await;
    }
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();

    for id in &ids {
        assert_eq!(h.destination.fulfillment_count(id), 1);
    }
    assert_eq!(h.destination.balance_of(BOB), 60);
}

#[tokio::test]
async fn test_transient_failures_retry_then_confirm() {
    let h = Harness::new();
    h.destination
        .push_submit_fault(LedgerError::OrderingConflict("nonce too low".into()));
    h.destination
        .push_submit_fault(LedgerError::Unavailable("connection reset".into()));
    let id = h.deposit("flaky", BOB, 11);

    let running = h.start();
    let record = h.wait_for_status(id, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(record.attempts, 2);
    assert_eq!(h.destination.fulfillment_count(&id), 1);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let h = Harness::new();
    for _ in 0..3 {
        h.destination
            .push_submit_fault(LedgerError::Unavailable("503".into()));
    }
    let id = h.deposit("doomed", BOB, 11);

    let running = h.start();
    let record = h.wait_for_status(id, Status::Failed).await;
    running.shutdown().await.unwrap();

    assert_eq!(record.attempts, 3);
    assert!(record.last_error.is_some());
    assert_eq!(h.destination.fulfillment_count(&id), 0);
    assert_eq!(h.destination.balance_of(BOB), 0);
}

#[tokio::test]
async fn test_slow_confirmation_is_reverified() {
    let mut h = Harness::new();
    h.submission_timeout = Duration::from_millis(50);
    h.destination.set_confirmation_delay(Duration::from_millis(200));
    let id = h.deposit("slow", CAROL, 33);

    let running = h.start();
    let record = h.wait_for_status(id, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(record.attempts, 1);
    assert_eq!(h.destination.fulfillment_count(&id), 1);
    assert_eq!(h.destination.balance_of(CAROL), 33);
}

#[tokio::test]
async fn test_permanent_failure_does_not_block_others() {
    let h = Harness::new();
    let bad = h.deposit("burned-to-zero", EvmAddress::ZERO, 5);
    let good = h.deposit("fine", BOB, 5);

    let running = h.start();
    let failed = h.wait_for_status(bad, Status::Failed).await;
    h.wait_for_status(good, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(failed.attempts, 0);
    assert!(failed.last_error.is_some());
    assert_eq!(h.destination.fulfillment_count(&bad), 0);
    assert_eq!(h.destination.fulfillment_count(&good), 1);
}

#[tokio::test]
async fn test_duplicate_of_in_flight_deposit_does_not_stall_others() {
    let mut h = Harness::new();
    h.submission_timeout = Duration::from_secs(10);
    h.destination.set_confirmation_delay(Duration::from_secs(3));
    let slow = h.deposit("slow", BOB, 4);

    let running = h.start();
    // Worker now holds the record while it waits for confirmation
    h.wait_for_status(slow, Status::Submitted).await;

    h.deposit("slow", BOB, 4);
    let next = h.deposit("next", CAROL, 9);
    let height = h.source.height();

    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let cursor = h.store.cursor().await.unwrap().unwrap_or(0);
            if h.record(next).await.is_some() && cursor >= height {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("unrelated deposit should be recorded while the duplicate is in flight");
    assert_ne!(h.record(slow).await.unwrap().status, Status::Confirmed);

    h.wait_for_status(slow, Status::Confirmed).await;
    h.wait_for_status(next, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.fulfillment_count(&slow), 1);
    assert_eq!(h.destination.fulfillment_count(&next), 1);
    assert_eq!(h.destination.balance_of(BOB), 4);
}

#[tokio::test]
async fn test_backoff_does_not_hold_a_worker_slot() {
    let mut h = Harness::new();
    h.config.worker_concurrency = 1;
    h.config.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_secs(2),
        max_backoff: Duration::from_secs(2),
        backoff_multiplier: 2.0,
    };
    h.destination
        .push_submit_fault(LedgerError::Unavailable("connection reset".into()));
    let a = h.deposit("backoff-a", BOB, 1);
    let b = h.deposit("backoff-b", CAROL, 2);

    let running = h.start();

    // Whichever deposit hits the fault sleeps; the other takes the only slot
    let (backing_off, confirmed) = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let (ra, rb) = (h.record(a).await, h.record(b).await);
            if let (Some(ra), Some(rb)) = (ra, rb) {
                match (ra.status, rb.status) {
                    (Status::Observed, Status::Confirmed) if ra.attempts == 1 => return (a, b),
                    (Status::Confirmed, Status::Observed) if rb.attempts == 1 => return (b, a),
                    _ => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second deposit should confirm while the first backs off");

    let record = h.wait_for_status(backing_off, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(record.attempts, 1);
    assert_eq!(h.destination.fulfillment_count(&backing_off), 1);
    assert_eq!(h.destination.fulfillment_count(&confirmed), 1);
}

#[tokio::test]
async fn test_unauthorized_relayer_fails_permanently() {
    let mut h = Harness::new();
    h.destination = InMemoryLedger::new();
    let id = h.deposit("no-role", BOB, 5);

    let running = h.start();
    h.wait_for_status(id, Status::Failed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.processed_count(), 0);
}

#[tokio::test]
async fn test_other_destinations_are_ignored() {
    let h = Harness::new();
    let elsewhere = h.deposit_to("elsewhere", BOB, 5, ChainTag(7));
    let ours = h.deposit("ours", BOB, 6);

    let running = h.start();
    h.wait_for_status(ours, Status::Confirmed).await;
    h.wait_for_cursor(h.source.height()).await;
    running.shutdown().await.unwrap();

    assert!(h.record(elsewhere).await.is_none());
    assert_eq!(h.destination.fulfillment_count(&elsewhere), 0);
    assert_eq!(h.destination.balance_of(BOB), 6);
}

#[tokio::test]
async fn test_duplicate_notifications_fulfill_once() {
    let h = Harness::new();
    let id = h.deposit("dup", BOB, 20);
    // Same identifier seen again, and once more with different fields
    h.deposit("dup", BOB, 20);
    h.deposit("dup", CAROL, 999);

    let running = h.start();
    let record = h.wait_for_status(id, Status::Confirmed).await;
    h.wait_for_cursor(h.source.height()).await;
    running.shutdown().await.unwrap();

    assert_eq!(record.recipient, BOB);
    assert_eq!(record.amount, 20);
    assert_eq!(h.destination.fulfillment_count(&id), 1);
    assert_eq!(h.destination.balance_of(BOB), 20);
    assert_eq!(h.destination.balance_of(CAROL), 0);
}

#[tokio::test]
async fn test_source_outage_does_not_skip_deposits() {
    let h = Harness::new();
    let before = h.deposit("before", BOB, 1);

    let running = h.start();
    h.wait_for_status(before, Status::Confirmed).await;

    h.source.set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.source.set_unavailable(false);
    let after = h.deposit("after", BOB, 2);

    h.wait_for_status(after, Status::Confirmed).await;
    running.shutdown().await.unwrap();

    assert_eq!(h.destination.balance_of(BOB), 3);
}

#[tokio::test]
async fn test_store_failure_stops_the_relay() {
    let h = Harness::new();
    h.backend.set_fail_writes(true);
    let id = h.deposit("unrecordable", BOB, 5);

    let running = h.start();
    let result = tokio::time::timeout(WAIT, running.handle)
        .await
        .expect("relay should stop on its own")
        .unwrap();

    assert!(matches!(result, Err(RelayError::StoreUnavailable(_))));
    assert_eq!(h.destination.fulfillment_count(&id), 0);
}
