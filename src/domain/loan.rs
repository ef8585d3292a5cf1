use serde::{Deserialize, Serialize};

use super::NumericState;

/// Ledger-assigned loan identifier
pub type LoanId = u32;

/// Descriptive fields for one loan, validated at the metadata boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanDescription {
    pub id: LoanId,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    /// ISO 3166-1 alpha-2, upper case
    pub country_code: Option<String>,
    /// Target amount in whole display-currency units
    pub target_amount: u64,
}

/// One loan as seen by consumers: descriptive data merged with ledger numerics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub id: LoanId,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub country_code: Option<String>,
    pub target_amount: u64,
    /// Ledger fixed-point units
    pub funded_amount: u64,
    /// Ledger fixed-point units, never above `funded_amount`
    pub paid_back_amount: u64,
    /// True until the id is confirmed present on the ledger
    pub is_candidate: bool,
}

impl LoanRecord {
    /// Record for an id that appeared on the ledger before its description
    pub fn placeholder(id: LoanId) -> Self {
        Self {
            id,
            name: String::new(),
            description: String::new(),
            image_url: None,
            country_code: None,
            target_amount: 0,
            funded_amount: 0,
            paid_back_amount: 0,
            is_candidate: false,
        }
    }

    /// Speculative record discovered off-ledger
    pub fn candidate(description: &LoanDescription) -> Self {
        let mut record = Self::placeholder(description.id);
        record.merge_description(description);
        record.is_candidate = true;
        record
    }

    /// Copy descriptive fields. Returns true if anything changed.
    pub fn merge_description(&mut self, description: &LoanDescription) -> bool {
        let before = self.clone();
        self.name = description.name.clone();
        self.description = description.description.clone();
        self.image_url = description.image_url.clone();
        self.country_code = description.country_code.clone();
        self.target_amount = description.target_amount;
        *self != before
    }

    /// Copy ledger numerics. Returns true if anything changed.
    pub fn apply_numeric(&mut self, state: NumericState) -> bool {
        if self.numeric() == state {
            return false;
        }
        self.funded_amount = state.funded();
        self.paid_back_amount = state.paid_back();
        true
    }

    pub fn numeric(&self) -> NumericState {
        NumericState::new(self.funded_amount, self.paid_back_amount)
    }
}
