//! The enumerated set of voucher face values.
//!
//! Initiation, webhook synthesis, voucher matching and the admin API all
//! validate amounts against one `DenominationSet` loaded from configuration.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("amount {amount} is not a sold denomination (allowed: {allowed})")]
pub struct InvalidDenomination {
    pub amount: i64,
    pub allowed: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenominationSet {
    values: Vec<i64>,
}

impl DenominationSet {
    pub const DEFAULT: &'static str = "600,1000,1500,7000";

    pub fn new(values: impl IntoIterator<Item = i64>) -> Result<Self, String> {
        let mut values: Vec<i64> = values.into_iter().collect();
        if values.is_empty() {
            return Err("at least one denomination is required".to_string());
        }
        if let Some(bad) = values.iter().find(|v| **v <= 0) {
            return Err(format!("denomination {} must be positive", bad));
        }
        values.sort_unstable();
        values.dedup();
        Ok(Self { values })
    }

    pub fn contains(&self, amount: i64) -> bool {
        self.values.binary_search(&amount).is_ok()
    }

    /// Returns the amount back when it is one of the configured values.
    pub fn check(&self, amount: i64) -> Result<i64, InvalidDenomination> {
        if self.contains(amount) {
            Ok(amount)
        } else {
            Err(InvalidDenomination {
                amount,
                allowed: self.to_string(),
            })
        }
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }
}

impl Default for DenominationSet {
    fn default() -> Self {
        Self {
            values: vec![600, 1000, 1500, 7000],
        }
    }
}

impl fmt::Display for DenominationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", joined)
    }
}

impl FromStr for DenominationSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i64>()
                    .map_err(|_| format!("'{}' is not a whole number", part))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_matches_price_list() {
        let set = DenominationSet::default();
        assert_eq!(set.values(), &[600, 1000, 1500, 7000]);
        assert_eq!(DenominationSet::DEFAULT.parse::<DenominationSet>().unwrap(), set);
    }

    #[test]
    fn check_rejects_unknown_amounts() {
        let set = DenominationSet::default();
        assert_eq!(set.check(1000), Ok(1000));

        let err = set.check(999).unwrap_err();
        assert_eq!(err.amount, 999);
        assert_eq!(err.allowed, "600,1000,1500,7000");
    }

    #[test]
    fn parsing_sorts_and_dedups() {
        let set: DenominationSet = " 1500, 600,1500 ,".parse().unwrap();
        assert_eq!(set.values(), &[600, 1500]);
    }

    #[test]
    fn parsing_rejects_garbage() {
        assert!("".parse::<DenominationSet>().is_err());
        assert!("1000,abc".parse::<DenominationSet>().is_err());
        assert!("0,1000".parse::<DenominationSet>().is_err());
    }
}
