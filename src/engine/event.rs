use std::collections::HashMap;

use crate::domain::{
    CounterName, LedgerUpdate, LoanDescription, LoanId, NumericState, OracleRate,
};
use crate::error::MetadataFetchError;
use crate::services::SubmissionUpdate;

/// Everything that can change reconciliation state, folded one at a time
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Full ledger identifier list, in ledger order
    IdentifierListChanged(Vec<LoanId>),
    NumericUpdated(Vec<(LoanId, NumericState)>),
    DescriptiveResolved {
        request_id: u64,
        descriptions: HashMap<LoanId, LoanDescription>,
    },
    DescriptiveFailed {
        request_id: u64,
        ids: Vec<LoanId>,
        error: MetadataFetchError,
    },
    CandidateDiscovered {
        request_id: u64,
        description: LoanDescription,
    },
    CandidateFailed {
        request_id: u64,
        error: MetadataFetchError,
    },
    OracleRateChanged(Option<OracleRate>),
    CounterChanged(CounterName, u64),
    SubmissionStatus(SubmissionUpdate),
    SubscriptionFailed {
        topic: String,
        reason: String,
    },
}

impl From<LedgerUpdate> for EngineEvent {
    fn from(update: LedgerUpdate) -> Self {
        match update {
            LedgerUpdate::IdentifierList(ids) => Self::IdentifierListChanged(ids),
            LedgerUpdate::NumericState(states) => Self::NumericUpdated(states),
            LedgerUpdate::OracleRate(rate) => Self::OracleRateChanged(rate),
            LedgerUpdate::Counter(name, value) => Self::CounterChanged(name, value),
            LedgerUpdate::Ended { topic } => Self::SubscriptionFailed {
                topic,
                reason: "ledger stream ended".to_string(),
            },
        }
    }
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdentifierListChanged(_) => "identifier_list_changed",
            Self::NumericUpdated(_) => "numeric_updated",
            Self::DescriptiveResolved { .. } => "descriptive_resolved",
            Self::DescriptiveFailed { .. } => "descriptive_failed",
            Self::CandidateDiscovered { .. } => "candidate_discovered",
            Self::CandidateFailed { .. } => "candidate_failed",
            Self::OracleRateChanged(_) => "oracle_rate_changed",
            Self::CounterChanged(..) => "counter_changed",
            Self::SubmissionStatus(_) => "submission_status",
            Self::SubscriptionFailed { .. } => "subscription_failed",
        }
    }
}
