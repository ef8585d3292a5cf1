//! Seams to the external collaborators: the ledger query transport, the
//! descriptive-metadata service and the ledger submission transport.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::{LedgerTopic, LoanId, OperationCall, RawLedgerValue, SubmissionStatus};
use crate::error::{MetadataFetchError, Result};

/// Live values for one topic: the current value first, then every change
pub type RawLedgerStream = BoxStream<'static, RawLedgerValue>;

#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Open a live read. Errors here are subscription setup failures.
    async fn open(&self, topic: &LedgerTopic) -> Result<RawLedgerStream>;
}

/// Descriptive record as the metadata service returned it, not yet validated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLoanMetadata {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub country_code: Option<String>,
    /// Decimal string in display currency, e.g. "1225.00"
    pub target_amount: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Look up the given ids; unknown ids are simply absent from the result
    async fn fetch_loans(
        &self,
        ids: &[LoanId],
    ) -> std::result::Result<Vec<RawLoanMetadata>, MetadataFetchError>;

    /// Pick one fundraising loan at random, skipping `exclude`
    async fn fetch_random_fundraising(
        &self,
        exclude: &[LoanId],
    ) -> std::result::Result<Option<RawLoanMetadata>, MetadataFetchError>;
}

#[async_trait]
pub trait LedgerSubmitter: Send + Sync {
    /// Sign (or sudo-wrap) and submit `call`, pushing raw statuses as they occur.
    ///
    /// Returning an error means the transport gave up; the gateway turns that
    /// into a terminal `Failed` status if none was pushed.
    async fn send(
        &self,
        call: &OperationCall,
        status_tx: mpsc::Sender<SubmissionStatus>,
    ) -> Result<()>;
}
