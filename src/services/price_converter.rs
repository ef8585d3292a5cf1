//! Conversion between ledger fixed-point amounts and display currency.
//!
//! All arithmetic is done in `Decimal`; rounding is half away from zero.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;

use crate::config::PricingConfig;
use crate::domain::{LoanRecord, OracleRate};

/// A converted amount, or the sentinel for "no oracle rate / not representable"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisplayValue {
    Available(Decimal),
    Unavailable,
}

impl DisplayValue {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    pub fn value(&self) -> Option<Decimal> {
        match self {
            Self::Available(v) => Some(*v),
            Self::Unavailable => None,
        }
    }
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available(v) => f.pad(&v.to_string()),
            Self::Unavailable => f.pad("n/a"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceConverter {
    units_per_display_unit: Decimal,
    rate_denominator: Decimal,
    display_decimals: u32,
}

impl Default for PriceConverter {
    fn default() -> Self {
        Self::new(&PricingConfig::default())
    }
}

impl PriceConverter {
    pub fn new(cfg: &PricingConfig) -> Self {
        Self {
            units_per_display_unit: Decimal::from(cfg.ledger_units_per_display_unit.max(1)),
            rate_denominator: Decimal::from(cfg.oracle_rate_denominator.max(1)),
            display_decimals: cfg.display_decimals,
        }
    }

    /// Ledger units to display units, rounded to `display_decimals` places
    pub fn to_display_unit(&self, amount: u64) -> Decimal {
        let value = Decimal::from(amount) / self.units_per_display_unit;
        self.round_display(value)
    }

    /// Ledger units to whole display-currency units at the given oracle rate
    pub fn to_display_currency(&self, amount: u64, rate: Option<OracleRate>) -> DisplayValue {
        let Some(per_unit) = rate.and_then(|r| self.rate_per_unit(r)) else {
            return DisplayValue::Unavailable;
        };

        match self.to_display_unit(amount).checked_mul(per_unit) {
            Some(v) => DisplayValue::Available(
                v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
            ),
            None => DisplayValue::Unavailable,
        }
    }

    /// The oracle rate itself in display currency, rounded to `display_decimals`
    pub fn oracle_price(&self, rate: Option<OracleRate>) -> DisplayValue {
        match rate.and_then(|r| self.rate_per_unit(r)) {
            Some(v) => DisplayValue::Available(self.round_display(v)),
            None => DisplayValue::Unavailable,
        }
    }

    /// True once the funded amount, in display currency, reaches the loan target.
    ///
    /// Loans without a target, or without a known rate, are never fully funded.
    pub fn is_fully_funded(&self, record: &LoanRecord, rate: Option<OracleRate>) -> bool {
        if record.target_amount == 0 {
            return false;
        }
        match self.to_display_currency(record.funded_amount, rate) {
            DisplayValue::Available(funded) => funded >= Decimal::from(record.target_amount),
            DisplayValue::Unavailable => false,
        }
    }

    fn rate_per_unit(&self, rate: OracleRate) -> Option<Decimal> {
        let raw = Decimal::try_from_i128_with_scale(rate.raw(), 0).ok()?;
        raw.checked_div(self.rate_denominator)
    }

    fn round_display(&self, value: Decimal) -> Decimal {
        let mut rounded =
            value.round_dp_with_strategy(self.display_decimals, RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(self.display_decimals);
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rate(usd: i128) -> Option<OracleRate> {
        Some(OracleRate::from_raw(usd * 100_000_000))
    }

    #[test]
    fn test_to_display_unit_basic() {
        let c = PriceConverter::default();
        assert_eq!(c.to_display_unit(1000), dec!(1.00));
        assert_eq!(c.to_display_unit(1000).to_string(), "1.00");
        assert_eq!(c.to_display_unit(0), Decimal::ZERO);
        assert_eq!(c.to_display_unit(2_500), dec!(2.50));
    }

    #[test]
    fn test_to_display_unit_rounds_half_away_from_zero() {
        let c = PriceConverter::default();
        assert_eq!(c.to_display_unit(1_234), dec!(1.23));
        assert_eq!(c.to_display_unit(1_235), dec!(1.24));
        assert_eq!(c.to_display_unit(1_245), dec!(1.25));
        assert_eq!(c.to_display_unit(5), dec!(0.01));
        assert_eq!(c.to_display_unit(4), dec!(0.00));
    }

    #[test]
    fn test_to_display_currency_applies_rate() {
        let c = PriceConverter::default();
        // 2.00 units at 1845.12 per unit
        let r = Some(OracleRate::from_raw(184_512_000_000));
        assert_eq!(c.to_display_currency(2_000, r), DisplayValue::Available(dec!(3690)));
        // 1.00 unit at 2.50 rounds half away from zero to 3
        let r = Some(OracleRate::from_raw(250_000_000));
        assert_eq!(c.to_display_currency(1_000, r), DisplayValue::Available(dec!(3)));
    }

    #[test]
    fn test_to_display_currency_without_rate_is_unavailable() {
        let c = PriceConverter::default();
        let v = c.to_display_currency(1_000, None);
        assert_eq!(v, DisplayValue::Unavailable);
        assert!(!v.is_available());
        assert_eq!(v.value(), None);
        assert_eq!(v.to_string(), "n/a");
    }

    #[test]
    fn test_zero_rate_is_a_value_not_absent() {
        let c = PriceConverter::default();
        let v = c.to_display_currency(1_000, Some(OracleRate::from_raw(0)));
        assert_eq!(v, DisplayValue::Available(Decimal::ZERO));
    }

    #[test]
    fn test_overflow_is_unavailable() {
        let c = PriceConverter::default();
        let v = c.to_display_currency(u64::MAX, Some(OracleRate::from_raw(i128::MAX)));
        assert_eq!(v, DisplayValue::Unavailable);
    }

    #[test]
    fn test_oracle_price_two_decimals() {
        let c = PriceConverter::default();
        let r = Some(OracleRate::from_raw(184_512_345_678));
        assert_eq!(c.oracle_price(r), DisplayValue::Available(dec!(1845.12)));
        assert_eq!(c.oracle_price(None), DisplayValue::Unavailable);
    }

    #[test]
    fn test_is_fully_funded() {
        let c = PriceConverter::default();
        let mut record = LoanRecord::placeholder(1);
        record.target_amount = 100;
        record.funded_amount = 50_000; // 50 units

        assert!(c.is_fully_funded(&record, rate(2)));
        assert!(!c.is_fully_funded(&record, rate(1)));
        assert!(!c.is_fully_funded(&record, None));

        record.target_amount = 0;
        assert!(!c.is_fully_funded(&record, rate(2)));
    }

    #[test]
    fn test_custom_scale() {
        let cfg = PricingConfig {
            ledger_units_per_display_unit: 1_000_000,
            oracle_rate_denominator: 100,
            display_decimals: 3,
        };
        let c = PriceConverter::new(&cfg);
        assert_eq!(c.to_display_unit(1_234_567).to_string(), "1.235");
        let r = Some(OracleRate::from_raw(150));
        assert_eq!(c.to_display_currency(2_000_000, r), DisplayValue::Available(dec!(3)));
    }
}
