//! Ledger-sourced values: per-loan numerics, the oracle rate and aggregate
//! counters, in both their raw wire shape and their validated shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use super::LoanId;

/// Funded / paid-back pair for one loan, in ledger fixed-point units.
///
/// Always satisfies `paid_back <= funded`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumericState {
    funded: u64,
    paid_back: u64,
}

impl NumericState {
    /// Build a state, clamping `paid_back` into `[0, funded]`
    pub fn new(funded: u64, paid_back: u64) -> Self {
        Self {
            funded,
            paid_back: paid_back.min(funded),
        }
    }

    /// Clamp signed ledger integers to the nearest valid state
    pub fn from_raw(funded: i128, paid_back: i128) -> Self {
        Self::new(clamp_to_u64(funded), clamp_to_u64(paid_back))
    }

    pub fn funded(&self) -> u64 {
        self.funded
    }

    pub fn paid_back(&self) -> u64 {
        self.paid_back
    }
}

/// Display-currency value of one ledger unit, as the raw fixed-point oracle answer.
///
/// An absent rate is modelled as `Option<OracleRate>::None`, never as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OracleRate(i128);

impl OracleRate {
    /// Negative answers are clamped to zero
    pub fn from_raw(raw: i128) -> Self {
        Self(raw.max(0))
    }

    pub fn raw(&self) -> i128 {
        self.0
    }
}

/// Named aggregate ledger counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterName {
    Reserved,
    Funded,
    Staked,
    PaidBack,
}

impl CounterName {
    pub const ALL: [CounterName; 4] = [
        CounterName::Reserved,
        CounterName::Funded,
        CounterName::Staked,
        CounterName::PaidBack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Funded => "funded",
            Self::Staked => "staked",
            Self::PaidBack => "paid_back",
        }
    }
}

impl fmt::Display for CounterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CounterName {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reserved" => Ok(Self::Reserved),
            "funded" => Ok(Self::Funded),
            "staked" => Ok(Self::Staked),
            "paid_back" | "paidback" | "payed_back" => Ok(Self::PaidBack),
            other => Err(format!("unknown counter '{}'", other)),
        }
    }
}

/// Aggregate counters; each is absent until its first push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounters {
    pub reserved: Option<u64>,
    pub funded: Option<u64>,
    pub staked: Option<u64>,
    pub paid_back: Option<u64>,
}

impl AggregateCounters {
    pub fn get(&self, name: CounterName) -> Option<u64> {
        match name {
            CounterName::Reserved => self.reserved,
            CounterName::Funded => self.funded,
            CounterName::Staked => self.staked,
            CounterName::PaidBack => self.paid_back,
        }
    }

    /// Returns true if the stored value changed
    pub fn set(&mut self, name: CounterName, value: u64) -> bool {
        let slot = match name {
            CounterName::Reserved => &mut self.reserved,
            CounterName::Funded => &mut self.funded,
            CounterName::Staked => &mut self.staked,
            CounterName::PaidBack => &mut self.paid_back,
        };
        let changed = *slot != Some(value);
        *slot = Some(value);
        changed
    }
}

/// A live ledger read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LedgerTopic {
    IdentifierList,
    /// Keyed batch read of per-loan numerics
    NumericState(Vec<LoanId>),
    OracleRate,
    Counter(CounterName),
}

impl fmt::Display for LedgerTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentifierList => write!(f, "identifier_list"),
            Self::NumericState(ids) => write!(f, "numeric_state[{}]", ids.len()),
            Self::OracleRate => write!(f, "oracle_rate"),
            Self::Counter(name) => write!(f, "counter:{}", name),
        }
    }
}

/// Raw numeric pair exactly as the ledger reported it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNumericState {
    pub loan_id: i64,
    #[serde(default)]
    pub funded_amount: i128,
    #[serde(default, alias = "payed_back_amount")]
    pub paid_back_amount: i128,
}

/// Raw value pushed by a ledger source, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawLedgerValue {
    IdentifierList(Vec<i64>),
    NumericState(Vec<RawNumericState>),
    OracleRate(Option<i128>),
    Counter(i128),
}

/// Typed, invariant-checked ledger update delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerUpdate {
    IdentifierList(Vec<LoanId>),
    NumericState(Vec<(LoanId, NumericState)>),
    OracleRate(Option<OracleRate>),
    Counter(CounterName, u64),
    /// The source stopped pushing for `topic`; nothing more will follow
    Ended { topic: String },
}

impl RawLedgerValue {
    /// Validate a raw value read on `topic`.
    ///
    /// Ids that do not fit a `LoanId` are dropped; numerics are clamped.
    /// A value whose kind does not match the topic is rejected.
    pub fn into_update(self, topic: &LedgerTopic) -> std::result::Result<LedgerUpdate, String> {
        match (topic, self) {
            (LedgerTopic::IdentifierList, RawLedgerValue::IdentifierList(raw_ids)) => {
                let mut ids = Vec::with_capacity(raw_ids.len());
                for raw in raw_ids {
                    match LoanId::try_from(raw) {
                        Ok(id) if !ids.contains(&id) => ids.push(id),
                        Ok(_) => {}
                        Err(_) => warn!(raw_id = raw, "dropping out-of-range loan id"),
                    }
                }
                Ok(LedgerUpdate::IdentifierList(ids))
            }
            (LedgerTopic::NumericState(_), RawLedgerValue::NumericState(raw_states)) => {
                let states = raw_states
                    .into_iter()
                    .filter_map(|raw| match LoanId::try_from(raw.loan_id) {
                        Ok(id) => Some((
                            id,
                            NumericState::from_raw(raw.funded_amount, raw.paid_back_amount),
                        )),
                        Err(_) => {
                            warn!(raw_id = raw.loan_id, "dropping numeric state for out-of-range id");
                            None
                        }
                    })
                    .collect();
                Ok(LedgerUpdate::NumericState(states))
            }
            (LedgerTopic::OracleRate, RawLedgerValue::OracleRate(raw)) => {
                Ok(LedgerUpdate::OracleRate(raw.map(OracleRate::from_raw)))
            }
            (LedgerTopic::Counter(name), RawLedgerValue::Counter(raw)) => {
                Ok(LedgerUpdate::Counter(*name, clamp_to_u64(raw)))
            }
            (topic, value) => Err(format!(
                "value {:?} does not match topic {}",
                value.kind(),
                topic
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::IdentifierList(_) => "identifier_list",
            Self::NumericState(_) => "numeric_state",
            Self::OracleRate(_) => "oracle_rate",
            Self::Counter(_) => "counter",
        }
    }
}

fn clamp_to_u64(raw: i128) -> u64 {
    raw.clamp(0, u64::MAX as i128) as u64
}
