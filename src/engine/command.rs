//! Messages into and out of the reconciliation engine

use serde::Serialize;
use tokio::sync::oneshot;

use crate::domain::{LoanId, OperationCall, SubmissionId, SubmissionStatus};
use crate::error::MetadataFetchError;

/// Requests sent through [`super::EngineHandle`]
#[derive(Debug)]
pub enum EngineCommand {
    /// Fetch one random candidate, superseding any earlier discovery
    DiscoverCandidate,
    /// Re-fetch descriptions for ids that are still pending
    RetryFetch(Vec<LoanId>),
    Submit {
        call: OperationCall,
        reply: oneshot::Sender<SubmissionId>,
    },
    Shutdown,
}

/// Side-channel notices; none of these alter the loan record set by themselves
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineNotification {
    SubscriptionFailed { topic: String, reason: String },
    MetadataFetchFailed { ids: Vec<LoanId>, error: String },
    CandidateFailed { error: String },
    CandidatePromoted { loan_id: LoanId },
    CandidateRetired { loan_id: LoanId },
    Submission { id: SubmissionId, call: String, status: SubmissionStatus },
}

impl EngineNotification {
    pub fn metadata_failed(ids: Vec<LoanId>, error: &MetadataFetchError) -> Self {
        Self::MetadataFetchFailed {
            ids,
            error: error.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Self::SubscriptionFailed { .. }
            | Self::MetadataFetchFailed { .. }
            | Self::CandidateFailed { .. } => true,
            Self::Submission { status, .. } => matches!(status, SubmissionStatus::Failed(_)),
            Self::CandidatePromoted { .. } | Self::CandidateRetired { .. } => false,
        }
    }
}
