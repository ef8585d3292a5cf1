use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{AggregateCounters, LoanId, LoanRecord, OracleRate, SubmissionId, SubmissionStatus};

/// Latest known status of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionEntry {
    pub id: SubmissionId,
    pub call: String,
    pub status: SubmissionStatus,
    pub updated_at: DateTime<Utc>,
}

/// Engine counters for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub events_applied: u64,
    pub stale_results_discarded: u64,
    pub fetches_issued: u64,
    pub fetch_failures: u64,
}

/// Consistent point-in-time view of the reconciled state.
///
/// Snapshots are immutable once published; every applied event that changes
/// anything produces a new one with a higher `version`.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub taken_at: DateTime<Utc>,
    /// Confirmed loans in ledger identifier-list order
    pub loans: Vec<LoanRecord>,
    pub candidate: Option<LoanRecord>,
    /// Loans whose descriptive data is still outstanding, ascending
    pub pending_ids: Vec<LoanId>,
    pub oracle_rate: Option<OracleRate>,
    pub counters: AggregateCounters,
    /// Ordered by first appearance
    pub submissions: Vec<SubmissionEntry>,
    /// Most recent collaborator failure, for a non-blocking error indicator
    pub last_error: Option<String>,
    pub stats: EngineStats,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: 0,
            taken_at: Utc::now(),
            loans: Vec::new(),
            candidate: None,
            pending_ids: Vec::new(),
            oracle_rate: None,
            counters: AggregateCounters::default(),
            submissions: Vec::new(),
            last_error: None,
            stats: EngineStats::default(),
        }
    }

    pub fn loan(&self, id: LoanId) -> Option<&LoanRecord> {
        self.loans.iter().find(|loan| loan.id == id)
    }

    pub fn contains(&self, id: LoanId) -> bool {
        self.loan(id).is_some()
    }

    pub fn is_pending(&self, id: LoanId) -> bool {
        self.pending_ids.binary_search(&id).is_ok()
    }

    pub fn ids(&self) -> Vec<LoanId> {
        self.loans.iter().map(|loan| loan.id).collect()
    }

    pub fn submission(&self, id: SubmissionId) -> Option<&SubmissionEntry> {
        self.submissions.iter().find(|entry| entry.id == id)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}
