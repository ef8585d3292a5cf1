//! Descriptive-metadata retrieval: batching, timeouts and record validation
//! in front of a [`MetadataService`].

use futures::future::try_join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::adapters::{MetadataService, RawLoanMetadata};
use crate::config::MetadataConfig;
use crate::domain::{LoanDescription, LoanId};
use crate::error::MetadataFetchError;

/// Check a raw record and convert it to a [`LoanDescription`].
///
/// `name` and `target_amount` are required. The image URL must parse and the
/// country code must be two ASCII letters when present. The target is rounded
/// half away from zero to whole display-currency units.
pub fn validate_record(raw: RawLoanMetadata) -> Result<LoanDescription, MetadataFetchError> {
    let loan_id = LoanId::try_from(raw.id).map_err(|_| {
        MetadataFetchError::MalformedResponse(format!("loan id {} out of range", raw.id))
    })?;
    let invalid = |reason: &str| MetadataFetchError::InvalidShape {
        loan_id,
        reason: reason.to_string(),
    };

    let name = raw
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| invalid("missing name"))?;

    let image_url = match raw.image_url.map(|u| u.trim().to_string()) {
        Some(url) if url.is_empty() => None,
        Some(url) => {
            Url::parse(&url).map_err(|_| invalid("image url does not parse"))?;
            Some(url)
        }
        None => None,
    };

    let country_code = match raw.country_code.map(|c| c.trim().to_string()) {
        Some(code) if code.is_empty() => None,
        Some(code) if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) => {
            Some(code.to_ascii_uppercase())
        }
        Some(_) => return Err(invalid("country code is not ISO 3166-1 alpha-2")),
        None => None,
    };

    let target = raw
        .target_amount
        .ok_or_else(|| invalid("missing target amount"))?;
    let target = Decimal::from_str(target.trim()).map_err(|_| invalid("target amount is not a number"))?;
    if target.is_sign_negative() {
        return Err(invalid("target amount is negative"));
    }
    let target_amount = target
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .ok_or_else(|| invalid("target amount out of range"))?;

    Ok(LoanDescription {
        id: loan_id,
        name,
        description: raw.description.unwrap_or_default().trim().to_string(),
        image_url,
        country_code,
        target_amount,
    })
}

pub struct MetadataFetcher {
    service: Arc<dyn MetadataService>,
    request_timeout: Duration,
    max_batch_size: usize,
}

impl MetadataFetcher {
    pub fn new(service: Arc<dyn MetadataService>, config: &MetadataConfig) -> Self {
        Self {
            service,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_batch_size: config.max_batch_size.max(1),
        }
    }

    /// Fetch descriptions for `ids`.
    ///
    /// Ids the service does not know are absent from the result. Records for
    /// ids that were not asked for are dropped. Any invalid record, transport
    /// error or timeout fails the whole call.
    pub async fn fetch_batch(
        &self,
        ids: &[LoanId],
    ) -> Result<HashMap<LoanId, LoanDescription>, MetadataFetchError> {
        let mut requested: Vec<LoanId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !requested.contains(id) {
                requested.push(*id);
            }
        }
        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        let chunks = requested
            .chunks(self.max_batch_size)
            .map(|chunk| self.fetch_chunk(chunk));
        let results = try_join_all(chunks).await?;

        let mut descriptions = HashMap::with_capacity(requested.len());
        for raw in results.into_iter().flatten() {
            let description = validate_record(raw)?;
            if !requested.contains(&description.id) {
                debug!(loan_id = description.id, "ignoring unrequested metadata record");
                continue;
            }
            descriptions.insert(description.id, description);
        }

        if descriptions.len() < requested.len() {
            debug!(
                requested = requested.len(),
                resolved = descriptions.len(),
                "metadata service did not know every id"
            );
        }
        Ok(descriptions)
    }

    /// Pick one fundraising loan that is not in `exclude`
    pub async fn fetch_random_candidate(
        &self,
        exclude: &[LoanId],
    ) -> Result<LoanDescription, MetadataFetchError> {
        let raw = timeout(self.request_timeout, self.service.fetch_random_fundraising(exclude))
            .await
            .map_err(|_| self.timeout_error())??;
        match raw {
            Some(raw) => validate_record(raw),
            None => Err(MetadataFetchError::NoCandidate),
        }
    }

    async fn fetch_chunk(&self, chunk: &[LoanId]) -> Result<Vec<RawLoanMetadata>, MetadataFetchError> {
        match timeout(self.request_timeout, self.service.fetch_loans(chunk)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(count = chunk.len(), "metadata request timed out");
                Err(self.timeout_error())
            }
        }
    }

    fn timeout_error(&self) -> MetadataFetchError {
        MetadataFetchError::Timeout {
            elapsed_ms: self.request_timeout.as_millis() as u64,
        }
    }
}
