//! Reconciliation state and the fold that applies engine events to it.
//!
//! Only the engine task owns a [`ReconciliationState`]; every change goes
//! through [`ReconciliationState::apply_event`], one event at a time.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use super::command::EngineNotification;
use super::event::EngineEvent;
use super::snapshot::{EngineStats, Snapshot, SubmissionEntry};
use crate::domain::{
    AggregateCounters, LoanDescription, LoanId, LoanRecord, NumericState, OracleRate,
    SubmissionStatus,
};
use crate::error::MetadataFetchError;
use crate::services::SubmissionUpdate;

/// Oldest finished submissions are forgotten beyond this many
const MAX_TRACKED_SUBMISSIONS: usize = 256;

/// Follow-up work requested by one applied event
#[derive(Debug, Default, PartialEq)]
pub struct Effects {
    /// Ids that need a descriptive fetch
    pub fetch: Vec<LoanId>,
    /// New id set for the numeric-state subscription
    pub resubscribe_numeric: Option<Vec<LoanId>>,
    pub notifications: Vec<EngineNotification>,
    /// Whether reconciled data changed
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct ReconciliationState {
    records: HashMap<LoanId, LoanRecord>,
    /// Identifier list as last pushed by the ledger
    order: Vec<LoanId>,
    candidate: Option<LoanRecord>,
    pending_ids: BTreeSet<LoanId>,
    oracle_rate: Option<OracleRate>,
    counters: AggregateCounters,
    submissions: Vec<SubmissionEntry>,
    last_error: Option<String>,
    latest_discovery: u64,
    discovery_in_flight: bool,
    /// Ids the ledger dropped while the latest discovery was in flight
    removed_since_discovery: HashSet<LoanId>,
    version: u64,
    stats: EngineStats,
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new discovery request and return its sequence number.
    ///
    /// Results tagged with an older sequence are stale from now on.
    pub fn begin_discovery(&mut self) -> u64 {
        self.latest_discovery += 1;
        self.discovery_in_flight = true;
        self.removed_since_discovery.clear();
        self.latest_discovery
    }

    fn end_discovery(&mut self) {
        self.discovery_in_flight = false;
        self.removed_since_discovery.clear();
    }

    pub fn note_fetch_issued(&mut self) {
        self.stats.fetches_issued += 1;
    }

    /// Pending ids among `ids`; every pending id when `ids` is empty
    pub fn pending_subset(&self, ids: &[LoanId]) -> Vec<LoanId> {
        if ids.is_empty() {
            return self.pending_ids.iter().copied().collect();
        }
        let mut subset: Vec<LoanId> = ids
            .iter()
            .copied()
            .filter(|id| self.pending_ids.contains(id))
            .collect();
        subset.dedup();
        subset
    }

    pub fn ids(&self) -> &[LoanId] {
        &self.order
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn apply_event(&mut self, event: EngineEvent) -> Effects {
        let kind = event.kind();
        let mut effects = Effects::default();

        match event {
            EngineEvent::IdentifierListChanged(ids) => self.on_identifier_list(ids, &mut effects),
            EngineEvent::NumericUpdated(states) => self.on_numeric(states, &mut effects),
            EngineEvent::DescriptiveResolved {
                request_id,
                descriptions,
            } => self.on_descriptions(request_id, descriptions, &mut effects),
            EngineEvent::DescriptiveFailed {
                request_id,
                ids,
                error,
            } => self.on_descriptions_failed(request_id, ids, error, &mut effects),
            EngineEvent::CandidateDiscovered {
                request_id,
                description,
            } => self.on_candidate(request_id, description, &mut effects),
            EngineEvent::CandidateFailed { request_id, error } => {
                if self.is_stale_discovery(request_id) {
                    return self.finish(kind, effects);
                }
                self.end_discovery();
                warn!(request_id, %error, "candidate discovery failed");
                self.record_error(format!("candidate discovery failed: {}", error), &mut effects);
                effects.notifications.push(EngineNotification::CandidateFailed {
                    error: error.to_string(),
                });
            }
            EngineEvent::OracleRateChanged(rate) => {
                if self.oracle_rate != rate {
                    self.oracle_rate = rate;
                    effects.changed = true;
                }
            }
            EngineEvent::CounterChanged(name, value) => {
                effects.changed = self.counters.set(name, value);
            }
            EngineEvent::SubmissionStatus(update) => self.on_submission(update, &mut effects),
            EngineEvent::SubscriptionFailed { topic, reason } => {
                self.record_error(format!("subscription {} failed: {}", topic, reason), &mut effects);
                effects
                    .notifications
                    .push(EngineNotification::SubscriptionFailed { topic, reason });
            }
        }

        self.finish(kind, effects)
    }

    fn finish(&mut self, kind: &'static str, effects: Effects) -> Effects {
        self.stats.events_applied += 1;
        if effects.changed {
            self.version += 1;
        }
        debug!(
            event = kind,
            changed = effects.changed,
            version = self.version,
            "applied engine event"
        );
        effects
    }

    fn on_identifier_list(&mut self, ids: Vec<LoanId>, effects: &mut Effects) {
        let incoming: HashSet<LoanId> = ids.iter().copied().collect();

        let removed: Vec<LoanId> = self
            .order
            .iter()
            .copied()
            .filter(|id| !incoming.contains(id))
            .collect();
        for id in &removed {
            self.records.remove(id);
            self.pending_ids.remove(id);
            if self.discovery_in_flight {
                self.removed_since_discovery.insert(*id);
            }
        }

        for id in &ids {
            if self.records.contains_key(id) {
                continue;
            }
            match self.candidate.take() {
                Some(candidate) if candidate.id == *id => {
                    info!(loan_id = id, "candidate confirmed on ledger, promoting");
                    let mut record = candidate;
                    record.is_candidate = false;
                    self.records.insert(*id, record);
                    effects
                        .notifications
                        .push(EngineNotification::CandidatePromoted { loan_id: *id });
                }
                other => {
                    self.candidate = other;
                    self.records.insert(*id, LoanRecord::placeholder(*id));
                    self.pending_ids.insert(*id);
                    effects.fetch.push(*id);
                }
            }
        }

        let promoted = !effects.notifications.is_empty();
        if !removed.is_empty() || !effects.fetch.is_empty() || promoted || self.order != ids {
            effects.changed = true;
        }
        if self.order != ids {
            effects.resubscribe_numeric = Some(ids.clone());
            self.order = ids;
        }
        if !removed.is_empty() || !effects.fetch.is_empty() {
            debug!(
                added = effects.fetch.len(),
                removed = removed.len(),
                total = self.order.len(),
                "identifier list reconciled"
            );
        }
    }

    fn on_numeric(&mut self, states: Vec<(LoanId, NumericState)>, effects: &mut Effects) {
        for (id, state) in states {
            match self.records.get_mut(&id) {
                Some(record) => effects.changed |= record.apply_numeric(state),
                None => {
                    self.stats.stale_results_discarded += 1;
                    debug!(loan_id = id, "discarding numeric state for unknown loan");
                }
            }
        }
    }

    fn on_descriptions(
        &mut self,
        request_id: u64,
        descriptions: HashMap<LoanId, LoanDescription>,
        effects: &mut Effects,
    ) {
        for (id, description) in descriptions {
            match self.records.get_mut(&id) {
                Some(record) => {
                    effects.changed |= record.merge_description(&description);
                    effects.changed |= self.pending_ids.remove(&id);
                }
                None => {
                    self.stats.stale_results_discarded += 1;
                    debug!(request_id, loan_id = id, "discarding description for removed loan");
                }
            }
        }
    }

    fn on_descriptions_failed(
        &mut self,
        request_id: u64,
        ids: Vec<LoanId>,
        error: MetadataFetchError,
        effects: &mut Effects,
    ) {
        self.stats.fetch_failures += 1;
        let still_pending: Vec<LoanId> = ids
            .into_iter()
            .filter(|id| self.pending_ids.contains(id))
            .collect();
        if still_pending.is_empty() {
            self.stats.stale_results_discarded += 1;
            debug!(request_id, "metadata failure for loans no longer pending");
            return;
        }

        warn!(request_id, ids = ?still_pending, %error, "metadata fetch failed");
        self.record_error(format!("metadata fetch failed: {}", error), effects);
        effects
            .notifications
            .push(EngineNotification::metadata_failed(still_pending, &error));
    }

    fn on_candidate(&mut self, request_id: u64, description: LoanDescription, effects: &mut Effects) {
        if self.is_stale_discovery(request_id) {
            return;
        }
        let id = description.id;
        let removed_meanwhile = self.removed_since_discovery.contains(&id);
        self.end_discovery();

        if let Some(record) = self.records.get_mut(&id) {
            info!(loan_id = id, "candidate already on ledger, promoting");
            if self.pending_ids.remove(&id) {
                record.merge_description(&description);
            }
            self.candidate = None;
            effects.changed = true;
            effects
                .notifications
                .push(EngineNotification::CandidatePromoted { loan_id: id });
            return;
        }

        // List updates are applied before candidate results, so an id the
        // ledger dropped while this discovery was in flight retires it.
        if removed_meanwhile {
            info!(loan_id = id, "candidate was removed from the ledger, retiring");
            effects.changed |= self.candidate.take().is_some();
            effects
                .notifications
                .push(EngineNotification::CandidateRetired { loan_id: id });
            return;
        }

        let candidate = LoanRecord::candidate(&description);
        if self.candidate.as_ref() != Some(&candidate) {
            info!(loan_id = id, name = %candidate.name, "new candidate discovered");
            self.candidate = Some(candidate);
            effects.changed = true;
        }
    }

    fn on_submission(&mut self, update: SubmissionUpdate, effects: &mut Effects) {
        let now = Utc::now();
        match self.submissions.iter_mut().find(|entry| entry.id == update.id) {
            Some(entry) => {
                entry.status = update.status.clone();
                entry.updated_at = now;
            }
            None => {
                self.submissions.push(SubmissionEntry {
                    id: update.id,
                    call: update.call.clone(),
                    status: update.status.clone(),
                    updated_at: now,
                });
                self.prune_submissions();
            }
        }
        effects.changed = true;

        if let SubmissionStatus::Failed(reason) = &update.status {
            self.record_error(format!("{} failed: {}", update.call, reason), effects);
        }
        effects.notifications.push(EngineNotification::Submission {
            id: update.id,
            call: update.call,
            status: update.status,
        });
    }

    fn prune_submissions(&mut self) {
        while self.submissions.len() > MAX_TRACKED_SUBMISSIONS {
            match self.submissions.iter().position(|e| e.status.is_terminal()) {
                Some(index) => {
                    self.submissions.remove(index);
                }
                None => break,
            }
        }
    }

    fn is_stale_discovery(&mut self, request_id: u64) -> bool {
        if request_id < self.latest_discovery {
            self.stats.stale_results_discarded += 1;
            debug!(
                request_id,
                latest = self.latest_discovery,
                "discarding superseded discovery result"
            );
            return true;
        }
        false
    }

    fn record_error(&mut self, message: String, effects: &mut Effects) {
        if self.last_error.as_deref() != Some(message.as_str()) {
            self.last_error = Some(message);
            effects.changed = true;
        }
    }

    /// Immutable copy of the current state
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            taken_at: Utc::now(),
            loans: self
                .order
                .iter()
                .filter_map(|id| self.records.get(id).cloned())
                .collect(),
            candidate: self.candidate.clone(),
            pending_ids: self.pending_ids.iter().copied().collect(),
            oracle_rate: self.oracle_rate,
            counters: self.counters,
            submissions: self.submissions.clone(),
            last_error: self.last_error.clone(),
            stats: self.stats,
        }
    }
}
