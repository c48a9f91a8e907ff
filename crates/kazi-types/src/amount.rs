use crate::error::KaziError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CURRENCY: &str = "KES";
pub const AMOUNT_DECIMALS: u32 = 2;
pub const BASE_UNITS_PER_MAJOR: u64 = 100; // 10^2

/// Currency amount in base units (cents). Unsigned: a wallet balance has no
/// representation below zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    pub const fn from_major(major: u64) -> Self {
        Self(major * BASE_UNITS_PER_MAJOR)
    }

    pub const fn from_base_units(units: u64) -> Self {
        Self(units)
    }

    pub fn to_base_units(&self) -> u64 {
        self.0
    }

    pub fn to_major_f64(&self) -> f64 {
        self.0 as f64 / BASE_UNITS_PER_MAJOR as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{:02}",
            CURRENCY,
            self.0 / BASE_UNITS_PER_MAJOR,
            self.0 % BASE_UNITS_PER_MAJOR
        )
    }
}

/// Parses `"288"`, `"288.5"` or `"288.50"` (major units, at most two decimals).
impl FromStr for Amount {
    type Err = KaziError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().trim_start_matches(CURRENCY).trim();
        let (whole, frac) = match raw.split_once('.') {
            Some((w, f)) => (w, f),
            None => (raw, ""),
        };

        if whole.is_empty() || frac.len() > AMOUNT_DECIMALS as usize {
            return Err(KaziError::InvalidAmount(s.to_string()));
        }

        let whole: u64 = whole
            .parse()
            .map_err(|_| KaziError::InvalidAmount(s.to_string()))?;
        let cents: u64 = match frac.len() {
            0 => Ok(0),
            1 => frac.parse::<u64>().map(|d| d * 10),
            _ => frac.parse::<u64>(),
        }
        .map_err(|_| KaziError::InvalidAmount(s.to_string()))?;

        whole
            .checked_mul(BASE_UNITS_PER_MAJOR)
            .and_then(|units| units.checked_add(cents))
            .map(Self)
            .ok_or_else(|| KaziError::InvalidAmount(format!("{} overflows", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Amount::from_major(288).to_string(), "KES 288.00");
        assert_eq!(Amount::from_base_units(5005).to_string(), "KES 50.05");
        assert_eq!(Amount::ZERO.to_string(), "KES 0.00");
    }

    #[test]
    fn test_parse() {
        assert_eq!("288".parse::<Amount>().unwrap(), Amount::from_major(288));
        assert_eq!("12.5".parse::<Amount>().unwrap(), Amount::from_base_units(1250));
        assert_eq!("KES 0.05".parse::<Amount>().unwrap(), Amount::from_base_units(5));
        assert!("1.234".parse::<Amount>().is_err());
        assert!("-5".parse::<Amount>().is_err());
        assert!(".5".parse::<Amount>().is_err());
    }

    #[test]
    fn test_checked_arithmetic() {
        let fifty = Amount::from_major(50);
        let reward = Amount::from_major(288);

        assert!(fifty.checked_sub(reward).is_none());
        assert_eq!(fifty.saturating_sub(reward), Amount::ZERO);
        assert_eq!(reward.checked_sub(fifty), Some(Amount::from_major(238)));
        assert_eq!(
            Amount::from_base_units(u64::MAX).checked_add(Amount::from_base_units(1)),
            None
        );
    }
}
