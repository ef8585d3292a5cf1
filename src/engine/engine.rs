//! Reconciliation engine: the single writer of loan state.
//!
//! Ledger pushes, metadata results, submission statuses and handle commands
//! all arrive on channels and are folded into [`ReconciliationState`] by one
//! task. `EngineHandle` is the clone-friendly way in from everywhere else.
//! The main `run()` loop uses `tokio::select!` with a fixed priority:
//!   - shutdown
//!   - ledger updates (so a queued list update is applied before any result)
//!   - async results (metadata fetches, discovery, numeric resubscription)
//!   - submission statuses
//!   - handle commands

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::command::{EngineCommand, EngineNotification};
use super::event::EngineEvent;
use super::snapshot::Snapshot;
use super::state::{Effects, ReconciliationState};
use crate::config::EngineConfig;
use crate::domain::{LedgerTopic, LedgerUpdate, LoanId, OperationCall, SubmissionId};
use crate::error::{Result, SyncError};
use crate::services::{
    LedgerSubscriptionHub, MetadataFetcher, SubmissionUpdate, SubscriptionHandle,
    TransactionGateway,
};

/// Output of engine-spawned tasks
enum TaskOutput {
    Event(EngineEvent),
    NumericSubscribed {
        generation: u64,
        result: Result<SubscriptionHandle>,
    },
}

/// Clone-friendly access to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
    notify_tx: broadcast::Sender<EngineNotification>,
}

impl EngineHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    /// Wait for the next snapshot published after the last one this handle saw
    pub async fn changed(&mut self) -> Result<Arc<Snapshot>> {
        self.snapshot_rx
            .changed()
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        Ok(self.snapshot_rx.borrow_and_update().clone())
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<Arc<Snapshot>>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let mut rx = self.snapshot_rx.clone();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            rx.changed().await.map_err(|_| SyncError::EngineClosed)?;
        }
    }

    pub async fn discover_candidate(&self) -> Result<()> {
        self.send(EngineCommand::DiscoverCandidate).await
    }

    /// Retry descriptive fetches for `ids`, or for every pending id if empty
    pub async fn retry_fetch(&self, ids: Vec<LoanId>) -> Result<()> {
        self.send(EngineCommand::RetryFetch(ids)).await
    }

    /// Hand `call` to the transaction gateway; statuses show up in snapshots
    /// and as [`EngineNotification::Submission`]
    pub async fn submit(&self, call: OperationCall) -> Result<SubmissionId> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineCommand::Submit { call, reply }).await?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<EngineNotification> {
        self.notify_tx.subscribe()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineCommand::Shutdown).await
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::EngineClosed)
    }
}

pub struct ReconciliationEngine {
    config: EngineConfig,
    state: ReconciliationState,
    hub: Arc<LedgerSubscriptionHub>,
    fetcher: Arc<MetadataFetcher>,
    gateway: Arc<TransactionGateway>,

    ledger_tx: mpsc::Sender<LedgerUpdate>,
    ledger_rx: mpsc::Receiver<LedgerUpdate>,
    result_tx: mpsc::Sender<TaskOutput>,
    result_rx: mpsc::Receiver<TaskOutput>,
    submission_tx: mpsc::Sender<SubmissionUpdate>,
    submission_rx: mpsc::Receiver<SubmissionUpdate>,
    command_tx: mpsc::Sender<EngineCommand>,
    command_rx: mpsc::Receiver<EngineCommand>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    notify_tx: broadcast::Sender<EngineNotification>,

    tasks: JoinSet<()>,
    next_request_id: u64,
    numeric_generation: u64,
    numeric_subscription: Option<SubscriptionHandle>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl ReconciliationEngine {
    pub fn new(
        config: EngineConfig,
        hub: Arc<LedgerSubscriptionHub>,
        fetcher: Arc<MetadataFetcher>,
        gateway: Arc<TransactionGateway>,
    ) -> Self {
        let (ledger_tx, ledger_rx) = mpsc::channel(config.ledger_channel_capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel(config.result_channel_capacity.max(1));
        let (submission_tx, submission_rx) = mpsc::channel(config.result_channel_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (snapshot_tx, _) = watch::channel(Arc::new(Snapshot::empty()));
        let (notify_tx, _) = broadcast::channel(config.notification_capacity.max(1));

        Self {
            config,
            state: ReconciliationState::new(),
            hub,
            fetcher,
            gateway,
            ledger_tx,
            ledger_rx,
            result_tx,
            result_rx,
            submission_tx,
            submission_rx,
            command_tx,
            command_rx,
            snapshot_tx,
            notify_tx,
            tasks: JoinSet::new(),
            next_request_id: 0,
            numeric_generation: 0,
            numeric_subscription: None,
            subscriptions: Vec::new(),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            command_tx: self.command_tx.clone(),
            snapshot_rx: self.snapshot_tx.subscribe(),
            notify_tx: self.notify_tx.clone(),
        }
    }

    /// Open the ledger subscriptions and process events until shutdown
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("reconciliation engine starting");
        self.open_subscriptions().await;
        self.publish();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("reconciliation engine: shutdown signal received");
                    break;
                }

                Some(update) = self.ledger_rx.recv() => {
                    self.handle_event(EngineEvent::from(update));
                }

                Some(output) = self.result_rx.recv() => {
                    self.handle_task_output(output);
                }

                Some(update) = self.submission_rx.recv() => {
                    self.handle_event(EngineEvent::SubmissionStatus(update));
                }

                Some(command) = self.command_rx.recv() => {
                    if matches!(command, EngineCommand::Shutdown) {
                        info!("reconciliation engine: shutdown requested");
                        break;
                    }
                    self.handle_command(command);
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("engine task panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.shutdown();
        info!("reconciliation engine stopped");
    }

    async fn open_subscriptions(&mut self) {
        let mut topics = vec![LedgerTopic::IdentifierList, LedgerTopic::OracleRate];
        topics.extend(self.config.counters.iter().copied().map(LedgerTopic::Counter));

        for topic in topics {
            match self.hub.subscribe(topic.clone(), self.ledger_tx.clone()).await {
                Ok(handle) => self.subscriptions.push(handle),
                Err(e) => {
                    self.apply(EngineEvent::SubscriptionFailed {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            open = self.subscriptions.len(),
            "ledger subscriptions established"
        );
    }

    fn handle_event(&mut self, event: EngineEvent) {
        let effects = self.apply(event);
        self.execute(effects);
        self.publish();
    }

    fn handle_task_output(&mut self, output: TaskOutput) {
        match output {
            TaskOutput::Event(event) => self.handle_event(event),
            TaskOutput::NumericSubscribed { generation, result } => {
                if generation != self.numeric_generation {
                    // Dropping the handle cancels the superseded subscription
                    debug!(generation, "discarding superseded numeric subscription");
                    return;
                }
                match result {
                    Ok(handle) => {
                        debug!(id = handle.id(), "numeric subscription switched");
                        self.numeric_subscription = Some(handle);
                    }
                    Err(e) => {
                        self.apply(EngineEvent::SubscriptionFailed {
                            topic: "numeric_state".to_string(),
                            reason: e.to_string(),
                        });
                        self.publish();
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::DiscoverCandidate => self.spawn_discovery(),
            EngineCommand::RetryFetch(ids) => {
                let pending = self.state.pending_subset(&ids);
                if pending.is_empty() {
                    debug!("retry requested but nothing is pending");
                } else {
                    self.spawn_fetch(pending);
                }
            }
            EngineCommand::Submit { call, reply } => {
                let id = self.gateway.submit(call, self.submission_tx.clone());
                if reply.send(id).is_err() {
                    debug!(%id, "submitter stopped waiting for the submission id");
                }
            }
            EngineCommand::Shutdown => {}
        }
    }

    /// Fold one event and emit its notifications; callers decide when to publish
    fn apply(&mut self, event: EngineEvent) -> Effects {
        let mut effects = self.state.apply_event(event);
        for notification in effects.notifications.drain(..) {
            // No receivers is fine
            let _ = self.notify_tx.send(notification);
        }
        effects
    }

    fn execute(&mut self, effects: Effects) {
        if let Some(ids) = effects.resubscribe_numeric {
            self.resubscribe_numeric(ids);
        }
        if !effects.fetch.is_empty() {
            self.spawn_fetch(effects.fetch);
        }
    }

    fn resubscribe_numeric(&mut self, ids: Vec<LoanId>) {
        self.numeric_generation += 1;
        if let Some(previous) = self.numeric_subscription.take() {
            previous.cancel();
        }
        if ids.is_empty() {
            return;
        }

        let generation = self.numeric_generation;
        let hub = self.hub.clone();
        let sink = self.ledger_tx.clone();
        let result_tx = self.result_tx.clone();
        self.tasks.spawn(async move {
            let result = hub.subscribe(LedgerTopic::NumericState(ids), sink).await;
            let _ = result_tx
                .send(TaskOutput::NumericSubscribed { generation, result })
                .await;
        });
    }

    fn spawn_fetch(&mut self, ids: Vec<LoanId>) {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.state.note_fetch_issued();
        debug!(request_id, count = ids.len(), "fetching loan descriptions");

        let fetcher = self.fetcher.clone();
        let result_tx = self.result_tx.clone();
        self.tasks.spawn(async move {
            let event = match fetcher.fetch_batch(&ids).await {
                Ok(descriptions) => EngineEvent::DescriptiveResolved {
                    request_id,
                    descriptions,
                },
                Err(error) => EngineEvent::DescriptiveFailed {
                    request_id,
                    ids,
                    error,
                },
            };
            if result_tx.send(TaskOutput::Event(event)).await.is_err() {
                debug!(request_id, "engine stopped, discarding metadata result");
            }
        });
    }

    fn spawn_discovery(&mut self) {
        let request_id = self.state.begin_discovery();
        let exclude: Vec<LoanId> = self.state.ids().to_vec();
        info!(request_id, "discovering a candidate loan");

        let fetcher = self.fetcher.clone();
        let result_tx = self.result_tx.clone();
        self.tasks.spawn(async move {
            let event = match fetcher.fetch_random_candidate(&exclude).await {
                Ok(description) => EngineEvent::CandidateDiscovered {
                    request_id,
                    description,
                },
                Err(error) => EngineEvent::CandidateFailed { request_id, error },
            };
            if result_tx.send(TaskOutput::Event(event)).await.is_err() {
                debug!(request_id, "engine stopped, discarding discovery result");
            }
        });
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.state.snapshot()));
    }

    fn shutdown(&mut self) {
        self.numeric_generation += 1;
        if let Some(handle) = self.numeric_subscription.take() {
            handle.cancel();
        }
        for handle in self.subscriptions.drain(..) {
            handle.cancel();
        }
        let in_flight = self.tasks.len();
        self.tasks.abort_all();
        self.result_rx.close();
        if in_flight > 0 {
            warn!(in_flight, "aborted in-flight engine tasks");
        }
        let stats = self.state.stats();
        info!(
            events = stats.events_applied,
            stale = stats.stale_results_discarded,
            fetches = stats.fetches_issued,
            failures = stats.fetch_failures,
            "reconciliation engine shut down"
        );
    }
}
