//! Fixed in-process metadata catalog, for offline runs and the demo.

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use super::traits::{MetadataService, RawLoanMetadata};
use crate::domain::LoanId;
use crate::error::MetadataFetchError;

#[derive(Default)]
pub struct StaticCatalog {
    entries: RwLock<BTreeMap<i64, RawLoanMetadata>>,
    latency: Option<Duration>,
}

impl StaticCatalog {
    pub fn new(entries: impl IntoIterator<Item = RawLoanMetadata>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().map(|e| (e.id, e)).collect()),
            latency: None,
        }
    }

    /// Delay every lookup, to emulate a remote service
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, entry: RawLoanMetadata) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.id, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handful of fundraising loans used by the demo command
    pub fn sample() -> Self {
        let entry = |id: i64, name: &str, description: &str, country: &str, amount: &str| {
            RawLoanMetadata {
                id,
                name: Some(name.to_string()),
                description: Some(description.to_string()),
                image_url: Some(format!("https://www-kiva-org.global.ssl.fastly.net/img/s100/{}.jpg", id)),
                country_code: Some(country.to_string()),
                target_amount: Some(amount.to_string()),
            }
        };
        Self::new([
            entry(1_568_001, "Amina", "Expanding a tailoring workshop", "KE", "1225.00"),
            entry(1_568_002, "Jose", "Seeds and fertilizer for the coffee harvest", "PE", "850.00"),
            entry(1_568_003, "Nguyen", "A second sewing machine", "VN", "600.00"),
            entry(1_568_004, "Fatou", "Restocking a grocery stall", "SN", "475.00"),
            entry(1_568_005, "Rosa", "Solar lamps for resale", "GT", "1000.00"),
            entry(1_568_006, "Tanvir", "Rickshaw repairs", "BD", "325.00"),
        ])
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl MetadataService for StaticCatalog {
    async fn fetch_loans(
        &self,
        ids: &[LoanId],
    ) -> Result<Vec<RawLoanMetadata>, MetadataFetchError> {
        self.simulate_latency().await;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(ids
            .iter()
            .filter_map(|id| entries.get(&i64::from(*id)).cloned())
            .collect())
    }

    async fn fetch_random_fundraising(
        &self,
        exclude: &[LoanId],
    ) -> Result<Option<RawLoanMetadata>, MetadataFetchError> {
        self.simulate_latency().await;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::thread_rng();
        Ok(entries
            .values()
            .filter(|entry| {
                LoanId::try_from(entry.id)
                    .map(|id| !exclude.contains(&id))
                    .unwrap_or(false)
            })
            .choose(&mut rng)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_loans_skips_unknown_ids() {
        let catalog = StaticCatalog::sample();
        let records = catalog.fetch_loans(&[1_568_001, 42]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("Amina"));
    }

    #[tokio::test]
    async fn test_random_pick_honours_exclusions() {
        let catalog = StaticCatalog::sample();
        let all: Vec<LoanId> = vec![1_568_001, 1_568_002, 1_568_003, 1_568_004, 1_568_005];
        for _ in 0..10 {
            let pick = catalog.fetch_random_fundraising(&all).await.unwrap().unwrap();
            assert_eq!(pick.id, 1_568_006);
        }

        let mut every = all.clone();
        every.push(1_568_006);
        assert_eq!(catalog.fetch_random_fundraising(&every).await.unwrap(), None);
    }
}
