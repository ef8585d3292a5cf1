//! Live ledger subscriptions.
//!
//! Each subscription runs a forwarding task that validates raw values and
//! delivers typed [`LedgerUpdate`]s into the subscriber's channel. Delivery
//! happens under the handle's gate, so once `cancel` returns nothing more
//! reaches the sink. A source stream that ends on its own is reported to the
//! sink once as [`LedgerUpdate::Ended`].

use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::LedgerSource;
use crate::domain::{LedgerTopic, LedgerUpdate};
use crate::error::Result;

struct SubscriptionState {
    id: u64,
    topic: LedgerTopic,
    active: Mutex<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionState {
    fn deactivate(&self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *active, false)
    }
}

type Registry = Arc<DashMap<u64, Arc<SubscriptionState>>>;

/// Send `update` only while the subscription is active.
///
/// Returns false once the subscription was cancelled or the sink closed.
async fn deliver(
    state: &SubscriptionState,
    sink: &mpsc::Sender<LedgerUpdate>,
    update: LedgerUpdate,
) -> bool {
    let Ok(permit) = sink.reserve().await else {
        debug!(id = state.id, "subscriber channel closed");
        return false;
    };
    let active = state.active.lock().unwrap_or_else(|e| e.into_inner());
    if *active {
        permit.send(update);
    }
    *active
}

/// Owner of one live subscription; dropping it cancels the subscription
pub struct SubscriptionHandle {
    state: Arc<SubscriptionState>,
    registry: Registry,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn topic(&self) -> &LedgerTopic {
        &self.state.topic
    }

    pub fn is_active(&self) -> bool {
        *self.state.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stop delivery and release the transport. Idempotent.
    pub fn cancel(&self) {
        let was_active = self.state.deactivate();
        let task = self
            .state
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.registry.remove(&self.state.id);
        if was_active {
            debug!(id = self.state.id, topic = %self.state.topic, "subscription cancelled");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.state.id)
            .field("topic", &self.state.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

pub struct LedgerSubscriptionHub {
    source: Arc<dyn LedgerSource>,
    registry: Registry,
    next_id: AtomicU64,
}

impl LedgerSubscriptionHub {
    pub fn new(source: Arc<dyn LedgerSource>) -> Self {
        Self {
            source,
            registry: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open `topic` and forward every change into `sink`, current value first.
    ///
    /// Setup failures are returned here, once; the sink never sees them.
    pub async fn subscribe(
        &self,
        topic: LedgerTopic,
        sink: mpsc::Sender<LedgerUpdate>,
    ) -> Result<SubscriptionHandle> {
        let mut stream = match self.source.open(&topic).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%topic, "ledger subscription setup failed: {}", e);
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriptionState {
            id,
            topic: topic.clone(),
            active: Mutex::new(true),
            task: Mutex::new(None),
        });

        let task_state = state.clone();
        let task_registry = self.registry.clone();
        let task = tokio::spawn(async move {
            let mut source_ended = true;
            while let Some(raw) = stream.next().await {
                let update = match raw.into_update(&task_state.topic) {
                    Ok(update) => update,
                    Err(reason) => {
                        warn!(id, topic = %task_state.topic, %reason, "dropping invalid ledger value");
                        continue;
                    }
                };
                if !deliver(&task_state, &sink, update).await {
                    source_ended = false;
                    break;
                }
            }
            if source_ended {
                let ended = LedgerUpdate::Ended {
                    topic: task_state.topic.to_string(),
                };
                if deliver(&task_state, &sink, ended).await {
                    warn!(id, topic = %task_state.topic, "ledger stream ended by the source");
                }
            }
            if task_state.deactivate() {
                info!(id, topic = %task_state.topic, "ledger subscription ended");
            }
            task_registry.remove(&id);
        });

        *state.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        self.registry.insert(id, state.clone());
        debug!(id, %topic, "ledger subscription opened");

        Ok(SubscriptionHandle {
            state,
            registry: self.registry.clone(),
        })
    }

    /// Equivalent to [`SubscriptionHandle::cancel`]
    pub fn cancel(&self, handle: &SubscriptionHandle) {
        handle.cancel();
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryLedger;
    use crate::domain::{CounterName, NumericState, OracleRate};
    use std::time::Duration;
    use tokio::time::timeout;

    fn hub() -> (Arc<InMemoryLedger>, LedgerSubscriptionHub) {
        let ledger = Arc::new(InMemoryLedger::new());
        let hub = LedgerSubscriptionHub::new(ledger.clone());
        (ledger, hub)
    }

    #[tokio::test]
    async fn test_delivers_current_value_then_changes() {
        let (ledger, hub) = hub();
        ledger.set_oracle_rate(Some(100));
        let (tx, mut rx) = mpsc::channel(8);

        let _handle = hub.subscribe(LedgerTopic::OracleRate, tx).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LedgerUpdate::OracleRate(Some(OracleRate::from_raw(100))))
        );

        ledger.set_oracle_rate(None);
        assert_eq!(rx.recv().await, Some(LedgerUpdate::OracleRate(None)));
    }

    #[tokio::test]
    async fn test_values_are_validated_before_delivery() {
        let (ledger, hub) = hub();
        ledger.set_numeric(5, 100, 300);
        ledger.set_counter(CounterName::Staked, -7);
        let (tx, mut rx) = mpsc::channel(8);

        let _numeric = hub
            .subscribe(LedgerTopic::NumericState(vec![5]), tx.clone())
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LedgerUpdate::NumericState(vec![(5, NumericState::new(100, 100))]))
        );

        let _staked = hub
            .subscribe(LedgerTopic::Counter(CounterName::Staked), tx)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(LedgerUpdate::Counter(CounterName::Staked, 0))
        );
    }

    #[tokio::test]
    async fn test_nothing_delivered_after_cancel() {
        let (ledger, hub) = hub();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = hub.subscribe(LedgerTopic::IdentifierList, tx).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert_eq!(hub.active_count(), 1);

        hub.cancel(&handle);
        handle.cancel();
        assert!(!handle.is_active());
        assert_eq!(hub.active_count(), 0);

        ledger.add_loan(1, 10);
        ledger.add_loan(2, 20);
        // The aborted task drops its sender, so the channel closes empty
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drop_cancels_subscription() {
        let (_ledger, hub) = hub();
        let (tx, _rx) = mpsc::channel(8);

        let handle = hub.subscribe(LedgerTopic::OracleRate, tx).await.unwrap();
        assert_eq!(hub.active_count(), 1);
        drop(handle);
        assert_eq!(hub.active_count(), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_is_returned_once() {
        let (ledger, hub) = hub();
        ledger.reject_topic(&LedgerTopic::Counter(CounterName::Funded));
        let (tx, mut rx) = mpsc::channel(8);

        let result = hub
            .subscribe(LedgerTopic::Counter(CounterName::Funded), tx)
            .await;
        assert!(result.is_err());
        assert_eq!(hub.active_count(), 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_source_end_is_reported_once() {
        let (ledger, hub) = hub();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = hub.subscribe(LedgerTopic::IdentifierList, tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(LedgerUpdate::IdentifierList(vec![])));

        ledger.drop_connections();
        assert_eq!(
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
            Some(LedgerUpdate::Ended {
                topic: "identifier_list".into()
            })
        );
        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), None);
        assert!(!handle.is_active());
        assert_eq!(hub.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_reports_no_end() {
        let (ledger, hub) = hub();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = hub.subscribe(LedgerTopic::OracleRate, tx).await.unwrap();
        assert!(rx.recv().await.is_some());
        handle.cancel();
        ledger.drop_connections();

        assert_eq!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap(), None);
    }
}
