use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::LoanId;

/// Ledger module holding the loan book
pub const LOAN_MODULE: &str = "kidotLoan";
/// Ledger module holding the oracle price feed
pub const PRICE_FEED_MODULE: &str = "pricefeed";

/// Who must authorize a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Ordinary call signed by the user's account
    Signed,
    /// Call requiring the privileged (root) origin
    Privileged,
}

/// One positional call parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallParam {
    Integer(u64),
    Text(String),
}

impl fmt::Display for CallParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Price pairs the oracle job knows how to answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricePair {
    #[serde(rename = "ETH/USD")]
    EthUsd,
    #[serde(rename = "BTC/USD")]
    BtcUsd,
    #[serde(rename = "LINK/USD")]
    LinkUsd,
    #[serde(rename = "EUR/USD")]
    EurUsd,
}

impl PricePair {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EthUsd => "ETH/USD",
            Self::BtcUsd => "BTC/USD",
            Self::LinkUsd => "LINK/USD",
            Self::EurUsd => "EUR/USD",
        }
    }
}

impl fmt::Display for PricePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PricePair {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().replace('-', "/").as_str() {
            "ETH/USD" => Ok(Self::EthUsd),
            "BTC/USD" => Ok(Self::BtcUsd),
            "LINK/USD" => Ok(Self::LinkUsd),
            "EUR/USD" => Ok(Self::EurUsd),
            other => Err(format!("unsupported price pair '{}'", other)),
        }
    }
}

/// A named ledger operation with ordered parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCall {
    pub module: String,
    pub call: String,
    pub params: Vec<CallParam>,
    pub trust: TrustLevel,
}

impl OperationCall {
    pub fn new(module: &str, call: &str, params: Vec<CallParam>, trust: TrustLevel) -> Self {
        Self {
            module: module.to_string(),
            call: call.to_string(),
            params,
            trust,
        }
    }

    /// Fund `amount` ledger units towards a loan
    pub fn lend(loan_id: LoanId, amount: u64) -> Self {
        Self::new(
            LOAN_MODULE,
            "lend",
            vec![CallParam::Integer(loan_id as u64), CallParam::Integer(amount)],
            TrustLevel::Signed,
        )
    }

    /// Put a discovered loan on the ledger with its display-currency target
    pub fn add_loan(loan_id: LoanId, target_amount: u64) -> Self {
        Self::new(
            LOAN_MODULE,
            "addLoan",
            vec![
                CallParam::Integer(loan_id as u64),
                CallParam::Integer(target_amount),
            ],
            TrustLevel::Privileged,
        )
    }

    pub fn reset_loans() -> Self {
        Self::new(LOAN_MODULE, "resetLoans", Vec::new(), TrustLevel::Privileged)
    }

    /// Ask the oracle to refresh the rate for `pair`
    pub fn request_price(pair: PricePair) -> Self {
        Self::new(
            PRICE_FEED_MODULE,
            "requestPrice",
            vec![CallParam::Text(pair.as_str().to_string())],
            TrustLevel::Signed,
        )
    }

    pub fn integer_param(&self, index: usize) -> Option<u64> {
        match self.params.get(index) {
            Some(CallParam::Integer(v)) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for OperationCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(f, "{}.{}({})", self.module, self.call, params.join(", "))
    }
}

/// Identifier assigned to each submission by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Submission progress, in increasing finality order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Finalized,
    Failed(String),
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed(_))
    }

    /// Terminal statuses share the highest rank
    pub fn finality_rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Finalized | Self::Failed(_) => 1,
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Finalized => write!(f, "finalized"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
