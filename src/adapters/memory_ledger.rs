//! In-process ledger used for local runs, the demo command and tests.
//!
//! Each topic is backed by a `watch` channel, so a fresh subscriber always
//! sees the current value first and then every later change.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::traits::{LedgerSource, LedgerSubmitter, RawLedgerStream};
use crate::domain::{
    CounterName, LedgerTopic, LoanId, OperationCall, RawLedgerValue, RawNumericState,
    SubmissionStatus, LOAN_MODULE, PRICE_FEED_MODULE,
};
use crate::error::{Result, SyncError};

/// Per-loan ledger row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerLoan {
    /// Display-currency target recorded by `addLoan`
    pub target_amount: u64,
    pub funded_amount: i128,
    pub paid_back_amount: i128,
}

pub struct InMemoryLedger {
    ids: watch::Sender<Vec<i64>>,
    loans: watch::Sender<BTreeMap<i64, LedgerLoan>>,
    oracle_rate: watch::Sender<Option<i128>>,
    counters: watch::Sender<BTreeMap<CounterName, i128>>,
    /// Bumped to end every stream opened so far
    connection_epoch: watch::Sender<u64>,
    rejected_topics: Mutex<HashSet<String>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        let counters = CounterName::ALL.iter().map(|name| (*name, 0)).collect();
        Self {
            ids: watch::channel(Vec::new()).0,
            loans: watch::channel(BTreeMap::new()).0,
            oracle_rate: watch::channel(None).0,
            counters: watch::channel(counters).0,
            connection_epoch: watch::channel(0).0,
            rejected_topics: Mutex::new(HashSet::new()),
        }
    }

    /// Register a loan, keeping insertion order in the identifier list
    pub fn add_loan(&self, id: i64, target_amount: u64) -> bool {
        let mut added = false;
        self.ids.send_modify(|ids| {
            if !ids.contains(&id) {
                ids.push(id);
                added = true;
            }
        });
        if added {
            self.loans.send_modify(|loans| {
                loans.insert(
                    id,
                    LedgerLoan {
                        target_amount,
                        ..LedgerLoan::default()
                    },
                );
            });
        }
        added
    }

    pub fn remove_loan(&self, id: i64) {
        self.ids.send_modify(|ids| ids.retain(|existing| *existing != id));
        self.loans.send_modify(|loans| {
            loans.remove(&id);
        });
    }

    /// Replace the identifier list wholesale, raw values included
    pub fn set_identifier_list(&self, ids: Vec<i64>) {
        self.ids.send_replace(ids);
    }

    pub fn set_numeric(&self, id: i64, funded_amount: i128, paid_back_amount: i128) {
        self.loans.send_modify(|loans| {
            let loan = loans.entry(id).or_default();
            loan.funded_amount = funded_amount;
            loan.paid_back_amount = paid_back_amount;
        });
    }

    pub fn set_oracle_rate(&self, raw: Option<i128>) {
        self.oracle_rate.send_replace(raw);
    }

    pub fn set_counter(&self, name: CounterName, raw: i128) {
        self.counters.send_modify(|counters| {
            counters.insert(name, raw);
        });
    }

    pub fn reset(&self) {
        self.ids.send_replace(Vec::new());
        self.loans.send_replace(BTreeMap::new());
        self.counters.send_modify(|counters| {
            for value in counters.values_mut() {
                *value = 0;
            }
        });
    }

    pub fn identifier_list(&self) -> Vec<i64> {
        self.ids.borrow().clone()
    }

    pub fn loan(&self, id: i64) -> Option<LedgerLoan> {
        self.loans.borrow().get(&id).copied()
    }

    /// Make every later `open` on `topic` fail with a setup error
    pub fn reject_topic(&self, topic: &LedgerTopic) {
        self.rejected_topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic_key(topic));
    }

    /// End every stream opened so far, as if the ledger connection dropped.
    ///
    /// Later `open` calls work normally.
    pub fn drop_connections(&self) {
        self.connection_epoch.send_modify(|epoch| *epoch += 1);
        info!("in-memory ledger dropped all open streams");
    }

    fn is_rejected(&self, topic: &LedgerTopic) -> bool {
        self.rejected_topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&topic_key(topic))
    }

    fn apply_call(&self, call: &OperationCall) -> std::result::Result<(), String> {
        match (call.module.as_str(), call.call.as_str()) {
            (LOAN_MODULE, "addLoan") => {
                let id = call.integer_param(0).ok_or("missing loan id")?;
                let target = call.integer_param(1).ok_or("missing target amount")?;
                if self.add_loan(id as i64, target) {
                    Ok(())
                } else {
                    Err(format!("loan {} already exists", id))
                }
            }
            (LOAN_MODULE, "resetLoans") => {
                self.reset();
                Ok(())
            }
            (LOAN_MODULE, "lend") => {
                let id = call.integer_param(0).ok_or("missing loan id")? as i64;
                let amount = call.integer_param(1).ok_or("missing amount")?;
                if !self.ids.borrow().contains(&id) {
                    return Err(format!("unknown loan {}", id));
                }
                self.loans.send_modify(|loans| {
                    let loan = loans.entry(id).or_default();
                    loan.funded_amount += i128::from(amount);
                });
                self.counters.send_modify(|counters| {
                    *counters.entry(CounterName::Reserved).or_insert(0) += i128::from(amount);
                });
                Ok(())
            }
            // Price requests are answered by an external oracle that this ledger does not run
            (PRICE_FEED_MODULE, "requestPrice") => Ok(()),
            (module, name) => Err(format!("unknown call {}.{}", module, name)),
        }
    }
}

fn topic_key(topic: &LedgerTopic) -> String {
    match topic {
        LedgerTopic::NumericState(_) => "numeric_state".to_string(),
        other => other.to_string(),
    }
}

/// Turn a watch receiver into a stream of projected values, current value first.
///
/// The stream ends when `epoch` moves on.
fn watch_stream<T, F>(
    rx: watch::Receiver<T>,
    epoch: watch::Receiver<u64>,
    project: F,
) -> RawLedgerStream
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> RawLedgerValue + Send + Sync + 'static,
{
    stream::unfold(
        (rx, epoch, project, true),
        |(mut rx, mut epoch, project, first)| async move {
            if !first {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    _ = epoch.changed() => return None,
                }
            }
            let value = project(&rx.borrow_and_update());
            Some((value, (rx, epoch, project, false)))
        },
    )
    .boxed()
}

#[async_trait]
impl LedgerSource for InMemoryLedger {
    async fn open(&self, topic: &LedgerTopic) -> Result<RawLedgerStream> {
        if self.is_rejected(topic) {
            return Err(SyncError::subscription_setup(topic, "topic rejected by ledger"));
        }
        debug!(%topic, "opening in-memory ledger read");
        let epoch = self.connection_epoch.subscribe();

        let stream = match topic {
            LedgerTopic::IdentifierList => watch_stream(self.ids.subscribe(), epoch, |ids| {
                RawLedgerValue::IdentifierList(ids.clone())
            }),
            LedgerTopic::NumericState(ids) => {
                let ids = ids.clone();
                watch_stream(self.loans.subscribe(), epoch, move |loans| {
                    let states = ids
                        .iter()
                        .map(|id| {
                            let loan = loans.get(&i64::from(*id)).copied().unwrap_or_default();
                            RawNumericState {
                                loan_id: i64::from(*id),
                                funded_amount: loan.funded_amount,
                                paid_back_amount: loan.paid_back_amount,
                            }
                        })
                        .collect();
                    RawLedgerValue::NumericState(states)
                })
            }
            LedgerTopic::OracleRate => watch_stream(self.oracle_rate.subscribe(), epoch, |rate| {
                RawLedgerValue::OracleRate(*rate)
            }),
            LedgerTopic::Counter(name) => {
                let name = *name;
                watch_stream(self.counters.subscribe(), epoch, move |counters| {
                    RawLedgerValue::Counter(counters.get(&name).copied().unwrap_or(0))
                })
            }
        };
        Ok(stream)
    }
}

#[async_trait]
impl LedgerSubmitter for InMemoryLedger {
    async fn send(
        &self,
        call: &OperationCall,
        status_tx: mpsc::Sender<SubmissionStatus>,
    ) -> Result<()> {
        let _ = status_tx.send(SubmissionStatus::Pending).await;

        let status = match self.apply_call(call) {
            Ok(()) => {
                info!(%call, trust = ?call.trust, "in-memory ledger applied call");
                SubmissionStatus::Finalized
            }
            Err(reason) => {
                debug!(%call, %reason, "in-memory ledger rejected call");
                SubmissionStatus::Failed(reason)
            }
        };
        let _ = status_tx.send(status).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PricePair;

    #[tokio::test]
    async fn test_identifier_stream_yields_current_then_changes() {
        let ledger = InMemoryLedger::new();
        ledger.add_loan(1, 500);

        let mut stream = ledger.open(&LedgerTopic::IdentifierList).await.unwrap();
        assert_eq!(stream.next().await, Some(RawLedgerValue::IdentifierList(vec![1])));

        ledger.add_loan(2, 800);
        assert_eq!(
            stream.next().await,
            Some(RawLedgerValue::IdentifierList(vec![1, 2]))
        );
    }

    #[tokio::test]
    async fn test_drop_connections_ends_open_streams() {
        let ledger = InMemoryLedger::new();
        let mut stream = ledger.open(&LedgerTopic::OracleRate).await.unwrap();
        assert_eq!(stream.next().await, Some(RawLedgerValue::OracleRate(None)));

        ledger.drop_connections();
        assert_eq!(stream.next().await, None);

        let mut reopened = ledger.open(&LedgerTopic::OracleRate).await.unwrap();
        ledger.set_oracle_rate(Some(7));
        assert_eq!(reopened.next().await, Some(RawLedgerValue::OracleRate(Some(7))));
    }

    #[tokio::test]
    async fn test_numeric_stream_defaults_missing_loans() {
        let ledger = InMemoryLedger::new();
        ledger.set_numeric(1, 400, 100);

        let mut stream = ledger
            .open(&LedgerTopic::NumericState(vec![1, 9]))
            .await
            .unwrap();
        let value = stream.next().await.unwrap();
        assert_eq!(
            value,
            RawLedgerValue::NumericState(vec![
                RawNumericState {
                    loan_id: 1,
                    funded_amount: 400,
                    paid_back_amount: 100
                },
                RawNumericState {
                    loan_id: 9,
                    funded_amount: 0,
                    paid_back_amount: 0
                },
            ])
        );
    }

    #[tokio::test]
    async fn test_rejected_topic_fails_setup() {
        let ledger = InMemoryLedger::new();
        ledger.reject_topic(&LedgerTopic::OracleRate);

        let result = ledger.open(&LedgerTopic::OracleRate).await;
        assert!(matches!(result, Err(SyncError::SubscriptionSetup { .. })));
        assert!(ledger.open(&LedgerTopic::IdentifierList).await.is_ok());
    }

    #[tokio::test]
    async fn test_lend_increases_funded_and_reserved() {
        let ledger = InMemoryLedger::new();
        ledger.add_loan(3, 100);

        let (tx, mut rx) = mpsc::channel(4);
        ledger.send(&OperationCall::lend(3, 2_000), tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(SubmissionStatus::Pending));
        assert_eq!(rx.recv().await, Some(SubmissionStatus::Finalized));
        assert_eq!(ledger.loan(3).unwrap().funded_amount, 2_000);
        assert_eq!(
            ledger.counters.borrow().get(&CounterName::Reserved).copied(),
            Some(2_000)
        );
    }

    #[tokio::test]
    async fn test_duplicate_add_loan_fails() {
        let ledger = InMemoryLedger::new();
        ledger.add_loan(3, 100);

        let (tx, mut rx) = mpsc::channel(4);
        ledger.send(&OperationCall::add_loan(3, 100), tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(SubmissionStatus::Pending));
        assert!(matches!(rx.recv().await, Some(SubmissionStatus::Failed(_))));
    }

    #[tokio::test]
    async fn test_request_price_and_reset() {
        let ledger = InMemoryLedger::new();
        ledger.add_loan(1, 100);

        let (tx, mut rx) = mpsc::channel(8);
        ledger
            .send(&OperationCall::request_price(PricePair::EthUsd), tx.clone())
            .await
            .unwrap();
        ledger.send(&OperationCall::reset_loans(), tx).await.unwrap();

        let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(statuses.iter().filter(|s| **s == SubmissionStatus::Finalized).count(), 2);
        assert!(ledger.identifier_list().is_empty());
    }
}
