//! Engine driven end to end through the in-memory ledger.

use async_trait::async_trait;
use microloan_sync::adapters::{InMemoryLedger, MetadataService, RawLoanMetadata, StaticCatalog};
use microloan_sync::config::AppConfig;
use microloan_sync::domain::{LedgerTopic, LoanId, OperationCall, SubmissionStatus};
use microloan_sync::engine::{EngineHandle, EngineNotification, ReconciliationEngine, Snapshot};
use microloan_sync::error::MetadataFetchError;
use microloan_sync::services::{
    LedgerSubscriptionHub, MetadataFetcher, PriceConverter, TransactionGateway,
};
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(5);

fn entry(id: i64, name: &str, amount: &str) -> RawLoanMetadata {
    RawLoanMetadata {
        id,
        name: Some(name.to_string()),
        description: Some(format!("{} is raising a loan", name)),
        image_url: None,
        country_code: Some("KE".to_string()),
        target_amount: Some(amount.to_string()),
    }
}

/// Blocks every batch lookup until the test hands out permits
struct GatedService {
    inner: StaticCatalog,
    gate: Semaphore,
}

#[async_trait]
impl MetadataService for GatedService {
    async fn fetch_loans(&self, ids: &[LoanId]) -> Result<Vec<RawLoanMetadata>, MetadataFetchError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| MetadataFetchError::Transport(e.to_string()))?;
        self.inner.fetch_loans(ids).await
    }

    async fn fetch_random_fundraising(
        &self,
        exclude: &[LoanId],
    ) -> Result<Option<RawLoanMetadata>, MetadataFetchError> {
        self.inner.fetch_random_fundraising(exclude).await
    }
}

/// Fails the first `failures` batch lookups
struct FlakyService {
    inner: StaticCatalog,
    failures: AtomicU32,
}

#[async_trait]
impl MetadataService for FlakyService {
    async fn fetch_loans(&self, ids: &[LoanId]) -> Result<Vec<RawLoanMetadata>, MetadataFetchError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(MetadataFetchError::Transport("service unavailable".into()));
        }
        self.inner.fetch_loans(ids).await
    }

    async fn fetch_random_fundraising(
        &self,
        exclude: &[LoanId],
    ) -> Result<Option<RawLoanMetadata>, MetadataFetchError> {
        self.inner.fetch_random_fundraising(exclude).await
    }
}

struct Harness {
    ledger: Arc<InMemoryLedger>,
    hub: Arc<LedgerSubscriptionHub>,
    handle: EngineHandle,
    notifications: broadcast::Receiver<EngineNotification>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(ledger: Arc<InMemoryLedger>, service: Arc<dyn MetadataService>) -> Self {
        let config = AppConfig::offline();
        let hub = Arc::new(LedgerSubscriptionHub::new(ledger.clone()));
        let fetcher = Arc::new(MetadataFetcher::new(service, &config.metadata));
        let gateway = Arc::new(TransactionGateway::new(ledger.clone(), false));
        let engine = ReconciliationEngine::new(config.engine, hub.clone(), fetcher, gateway);

        let handle = engine.handle();
        let notifications = handle.subscribe_notifications();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(engine.run(shutdown_rx));

        Self {
            ledger,
            hub,
            handle,
            notifications,
            shutdown_tx,
            task,
        }
    }

    async fn wait_for<F>(&self, predicate: F) -> Arc<Snapshot>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        tokio::time::timeout(WAIT, self.handle.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("engine stopped")
    }

    async fn next_notification<F>(&mut self, mut matches: F) -> EngineNotification
    where
        F: FnMut(&EngineNotification) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let notification = self.notifications.recv().await.expect("notifications closed");
                if matches(&notification) {
                    return notification;
                }
            }
        })
        .await
        .expect("timed out waiting for notification")
    }
}

fn catalog() -> StaticCatalog {
    StaticCatalog::new([
        entry(1, "Amina", "1225.00"),
        entry(2, "Jose", "850.00"),
        entry(7, "Nguyen", "600.00"),
        entry(42, "Fatou", "475.00"),
    ])
}

#[tokio::test]
async fn test_list_fetch_numeric_and_removal() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_loan(1, 1225);
    ledger.add_loan(2, 850);
    let harness = Harness::start(ledger, Arc::new(catalog()));

    let snapshot = harness
        .wait_for(|s| s.loans.len() == 2 && s.pending_ids.is_empty())
        .await;
    assert_eq!(snapshot.ids(), vec![1, 2]);
    assert_eq!(snapshot.loan(1).unwrap().name, "Amina");
    assert_eq!(snapshot.loan(2).unwrap().target_amount, 850);

    harness.ledger.set_numeric(1, 500, 0);
    let snapshot = harness
        .wait_for(|s| s.loan(1).map(|l| l.funded_amount == 500).unwrap_or(false))
        .await;
    assert_eq!(snapshot.loan(2).unwrap().funded_amount, 0);

    harness.ledger.remove_loan(1);
    let snapshot = harness.wait_for(|s| !s.contains(1)).await;
    assert_eq!(snapshot.ids(), vec![2]);
    assert_eq!(snapshot.loan(2).unwrap().name, "Jose");
}

#[tokio::test]
async fn test_description_for_removed_loan_is_discarded() {
    let ledger = Arc::new(InMemoryLedger::new());
    let service = Arc::new(GatedService {
        inner: catalog(),
        gate: Semaphore::new(0),
    });
    let harness = Harness::start(ledger, service.clone());

    harness.ledger.add_loan(7, 600);
    harness.wait_for(|s| s.is_pending(7)).await;

    harness.ledger.remove_loan(7);
    harness.wait_for(|s| !s.contains(7)).await;

    service.gate.add_permits(1);
    let snapshot = harness
        .wait_for(|s| s.stats.stale_results_discarded >= 1)
        .await;
    assert!(!snapshot.contains(7));
    assert!(!snapshot.is_pending(7));
}

#[tokio::test]
async fn test_candidate_promoted_after_add_loan() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_loan(1, 1225);
    ledger.add_loan(2, 850);
    ledger.add_loan(7, 600);
    let mut harness = Harness::start(ledger, Arc::new(catalog()));
    harness.wait_for(|s| s.loans.len() == 3 && s.pending_ids.is_empty()).await;

    assert_ok!(harness.handle.discover_candidate().await);
    let snapshot = harness.wait_for(|s| s.candidate.is_some()).await;
    let candidate = snapshot.candidate.clone().unwrap();
    assert_eq!(candidate.id, 42);
    assert!(candidate.is_candidate);
    assert_eq!(candidate.funded_amount, 0);

    let submission = harness
        .handle
        .submit(OperationCall::add_loan(42, candidate.target_amount))
        .await
        .unwrap();

    let promoted = harness
        .next_notification(|n| matches!(n, EngineNotification::CandidatePromoted { .. }))
        .await;
    assert_eq!(promoted, EngineNotification::CandidatePromoted { loan_id: 42 });

    let snapshot = harness
        .wait_for(|s| {
            s.submission(submission)
                .map(|e| e.status == SubmissionStatus::Finalized)
                .unwrap_or(false)
                && s.contains(42)
        })
        .await;
    assert!(snapshot.candidate.is_none());
    let records: Vec<_> = snapshot.loans.iter().filter(|l| l.id == 42).collect();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_candidate);
    assert_eq!(records[0].name, "Fatou");
    assert!(!snapshot.is_pending(42));
}

#[tokio::test]
async fn test_lend_flows_back_through_the_ledger() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_loan(1, 3);
    ledger.set_oracle_rate(Some(184_512_000_000));
    let harness = Harness::start(ledger, Arc::new(catalog()));
    harness
        .wait_for(|s| s.contains(1) && s.oracle_rate.is_some())
        .await;

    assert_ok!(harness.handle.submit(OperationCall::lend(1, 2_000)).await);
    let snapshot = harness
        .wait_for(|s| {
            s.loan(1).map(|l| l.funded_amount == 2_000).unwrap_or(false)
                && s.counters.reserved == Some(2_000)
        })
        .await;

    let converter = PriceConverter::default();
    let loan = snapshot.loan(1).unwrap();
    assert_eq!(converter.to_display_unit(loan.funded_amount), dec!(2.00));
    assert_eq!(
        converter
            .to_display_currency(loan.funded_amount, snapshot.oracle_rate)
            .value(),
        Some(dec!(3690))
    );
    assert!(converter.is_fully_funded(loan, snapshot.oracle_rate));
}

#[tokio::test]
async fn test_failed_submission_is_surfaced() {
    let ledger = Arc::new(InMemoryLedger::new());
    let mut harness = Harness::start(ledger, Arc::new(catalog()));

    let id = harness.handle.submit(OperationCall::lend(99, 10)).await.unwrap();
    let notification = harness
        .next_notification(|n| {
            matches!(n, EngineNotification::Submission { status, .. } if status.is_terminal())
        })
        .await;
    match notification {
        EngineNotification::Submission { id: seen, status, .. } => {
            assert_eq!(seen, id);
            assert!(matches!(status, SubmissionStatus::Failed(_)));
        }
        other => panic!("unexpected notification {:?}", other),
    }

    let snapshot = harness.wait_for(|s| s.last_error.is_some()).await;
    assert!(snapshot.last_error.as_deref().unwrap().contains("unknown loan 99"));
}

#[tokio::test]
async fn test_fetch_failure_then_retry() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_loan(2, 850);
    let service = Arc::new(FlakyService {
        inner: catalog(),
        failures: AtomicU32::new(1),
    });
    let mut harness = Harness::start(ledger, service);

    let failure = harness
        .next_notification(|n| matches!(n, EngineNotification::MetadataFetchFailed { .. }))
        .await;
    assert!(failure.is_error());

    let snapshot = harness.wait_for(|s| s.last_error.is_some()).await;
    assert!(snapshot.is_pending(2));
    assert!(snapshot.contains(2));

    assert_ok!(harness.handle.retry_fetch(Vec::new()).await);
    let snapshot = harness.wait_for(|s| s.pending_ids.is_empty()).await;
    assert_eq!(snapshot.loan(2).unwrap().name, "Jose");
    assert_eq!(snapshot.stats.fetch_failures, 1);
}

#[tokio::test]
async fn test_subscription_setup_failure_is_reported() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.reject_topic(&LedgerTopic::OracleRate);
    ledger.add_loan(1, 1225);
    let mut harness = Harness::start(ledger, Arc::new(catalog()));

    let notification = harness
        .next_notification(|n| matches!(n, EngineNotification::SubscriptionFailed { .. }))
        .await;
    assert!(matches!(
        notification,
        EngineNotification::SubscriptionFailed { ref topic, .. } if topic == "oracle_rate"
    ));

    // Everything else keeps working
    let snapshot = harness.wait_for(|s| s.contains(1) && s.pending_ids.is_empty()).await;
    assert_eq!(snapshot.oracle_rate, None);
}

#[tokio::test]
async fn test_dropped_ledger_stream_is_reported() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_loan(1, 1225);
    let mut harness = Harness::start(ledger, Arc::new(catalog()));
    harness.wait_for(|s| s.contains(1) && s.pending_ids.is_empty()).await;

    harness.ledger.drop_connections();
    let notification = harness
        .next_notification(|n| {
            matches!(n, EngineNotification::SubscriptionFailed { topic, .. } if topic == "identifier_list")
        })
        .await;
    assert!(notification.is_error());

    let snapshot = harness
        .wait_for(|s| {
            s.last_error
                .as_deref()
                .map(|e| e.contains("ledger stream ended"))
                .unwrap_or(false)
        })
        .await;
    // Last known state is kept
    assert_eq!(snapshot.loan(1).unwrap().name, "Amina");
}

#[tokio::test]
async fn test_shutdown_releases_subscriptions() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.add_loan(1, 1225);
    let harness = Harness::start(ledger, Arc::new(catalog()));
    harness.wait_for(|s| s.contains(1) && s.pending_ids.is_empty()).await;
    assert!(harness.hub.active_count() > 0);

    assert_ok!(harness.handle.shutdown().await);
    tokio::time::timeout(WAIT, harness.task)
        .await
        .expect("engine did not stop")
        .unwrap();

    assert_eq!(harness.hub.active_count(), 0);
    assert_err!(harness.handle.discover_candidate().await);
    drop(harness.shutdown_tx);
}

#[tokio::test]
async fn test_broadcast_shutdown_stops_engine() {
    let ledger = Arc::new(InMemoryLedger::new());
    let harness = Harness::start(ledger, Arc::new(catalog()));
    harness.wait_for(|_| true).await;

    harness.shutdown_tx.send(()).unwrap();
    tokio::time::timeout(WAIT, harness.task)
        .await
        .expect("engine did not stop")
        .unwrap();
    assert_eq!(harness.hub.active_count(), 0);
}
