use crate::error::KaziError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Earning tier. Level 0 is the temporary (unlevelled) worker tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Level(u8);

impl Level {
    pub const TEMPORARY: Self = Self(0);

    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    pub fn is_temporary(&self) -> bool {
        self.0 == 0
    }
}

impl From<u8> for Level {
    fn from(level: u8) -> Self {
        Self(level)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl FromStr for Level {
    type Err = KaziError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let raw = raw
            .strip_prefix('L')
            .or_else(|| raw.strip_prefix('l'))
            .unwrap_or(raw);
        raw.parse::<u8>()
            .map(Self)
            .map_err(|_| KaziError::InvalidLevel(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_level() {
        assert!(Level::TEMPORARY.is_temporary());
        assert!(!Level::new(1).is_temporary());
        assert!(Level::new(1) > Level::TEMPORARY);
    }

    #[test]
    fn test_parse() {
        assert_eq!("3".parse::<Level>().unwrap(), Level::new(3));
        assert_eq!("L2".parse::<Level>().unwrap(), Level::new(2));
        assert!("level-two".parse::<Level>().is_err());
        assert!("256".parse::<Level>().is_err());
    }
}
