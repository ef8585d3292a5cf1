//! Kiva lend GraphQL API client for descriptive loan metadata.
//!
//! Batches are fetched with one aliased query (`l<id>: loan(id: <id>)`), so a
//! single round trip covers a whole chunk of identifiers.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::traits::{MetadataService, RawLoanMetadata};
use crate::config::MetadataConfig;
use crate::domain::LoanId;
use crate::error::{MetadataFetchError, Result, SyncError};

/// Random candidates are drawn from a page this large
const RANDOM_PAGE_SIZE: usize = 20;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct LendAliases {
    lend: HashMap<String, Option<KivaLoan>>,
}

#[derive(Debug, Deserialize)]
struct LendSearch {
    lend: LoanSearch,
}

#[derive(Debug, Deserialize)]
struct LoanSearch {
    loans: LoanPage,
}

#[derive(Debug, Deserialize)]
struct LoanPage {
    #[serde(default)]
    values: Vec<KivaLoan>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KivaLoan {
    id: i64,
    name: Option<String>,
    description: Option<String>,
    image: Option<KivaImage>,
    geocode: Option<KivaGeocode>,
    loan_amount: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KivaImage {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KivaGeocode {
    country: Option<KivaCountry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KivaCountry {
    iso_code: Option<String>,
}

impl From<KivaLoan> for RawLoanMetadata {
    fn from(loan: KivaLoan) -> Self {
        Self {
            id: loan.id,
            name: loan.name,
            description: loan.description,
            image_url: loan.image.and_then(|image| image.url),
            country_code: loan
                .geocode
                .and_then(|geo| geo.country)
                .and_then(|country| country.iso_code),
            target_amount: loan.loan_amount,
        }
    }
}

pub struct KivaGraphqlClient {
    http: Client,
    api_url: String,
    image_preset: String,
}

impl KivaGraphqlClient {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("microloan-sync/0.1")
            .build()
            .map_err(|e| SyncError::Internal(format!("failed to build Kiva HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            image_preset: config.image_preset.clone(),
        })
    }

    fn loan_fields(&self) -> String {
        format!(
            "id name description image {{ url(presetSize: {}) }} geocode {{ country {{ isoCode }} }} loanAmount",
            self.image_preset
        )
    }

    fn batch_query(&self, ids: &[LoanId]) -> String {
        let fields = self.loan_fields();
        let aliases: Vec<String> = ids
            .iter()
            .map(|id| format!("l{id}: loan(id: {id}) {{ {fields} }}"))
            .collect();
        format!("{{ lend {{ {} }} }}", aliases.join(" "))
    }

    fn random_query(&self) -> String {
        format!(
            "{{ lend {{ loans(filters: {{ status: fundRaising }}, sortBy: random, limit: {}) {{ values {{ {} }} }} }} }}",
            RANDOM_PAGE_SIZE,
            self.loan_fields()
        )
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        query: String,
    ) -> std::result::Result<T, MetadataFetchError> {
        let body = serde_json::json!({ "query": query });
        let resp = self
            .http
            .post(&self.api_url)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(MetadataFetchError::Service(format!(
                "Kiva API returned status={} body={}",
                status,
                &text[..text.len().min(200)]
            )));
        }

        let parsed: GraphQlResponse<T> = serde_json::from_str(&text)
            .map_err(|e| MetadataFetchError::MalformedResponse(e.to_string()))?;
        let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();

        match parsed.data {
            Some(data) => {
                if !messages.is_empty() {
                    // Unknown ids come back as null aliases plus an error entry
                    warn!(errors = ?messages, "Kiva API returned partial data");
                }
                Ok(data)
            }
            None if !messages.is_empty() => Err(MetadataFetchError::Service(messages.join("; "))),
            None => Err(MetadataFetchError::MalformedResponse(
                "response carried neither data nor errors".into(),
            )),
        }
    }
}

#[async_trait]
impl MetadataService for KivaGraphqlClient {
    async fn fetch_loans(
        &self,
        ids: &[LoanId],
    ) -> std::result::Result<Vec<RawLoanMetadata>, MetadataFetchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = ids.len(), "querying Kiva for loan metadata");

        let data: LendAliases = self.post(self.batch_query(ids)).await?;
        Ok(data
            .lend
            .into_values()
            .flatten()
            .map(RawLoanMetadata::from)
            .collect())
    }

    async fn fetch_random_fundraising(
        &self,
        exclude: &[LoanId],
    ) -> std::result::Result<Option<RawLoanMetadata>, MetadataFetchError> {
        let data: LendSearch = self.post(self.random_query()).await?;
        Ok(data
            .lend
            .loans
            .values
            .into_iter()
            .find(|loan| {
                LoanId::try_from(loan.id)
                    .map(|id| !exclude.contains(&id))
                    .unwrap_or(true)
            })
            .map(RawLoanMetadata::from))
    }
}
