//! Reward table and engine configuration.
//!
//! The reward table is data: it maps an invitee's level at qualification to
//! the bonus owed to the inviter. It is loaded from TOML alongside the
//! runtime settings and can be overridden from the environment.

use anyhow::{bail, Context, Result};
use kazi_types::{Amount, Level};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardTable {
    entries: BTreeMap<Level, Amount>,
}

impl RewardTable {
    pub fn new(entries: impl IntoIterator<Item = (Level, Amount)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Reward owed for an invitee at `level`. `None` means the level is not
    /// eligible: level 0 never is, and neither is a level mapped to zero.
    pub fn reward_for(&self, level: Level) -> Option<Amount> {
        if level.is_temporary() {
            return None;
        }
        self.entries.get(&level).copied().filter(|a| !a.is_zero())
    }

    pub fn is_rewarded(&self, level: Level) -> bool {
        self.reward_for(level).is_some()
    }

    pub fn levels(&self) -> impl Iterator<Item = Level> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Level, Amount)> + '_ {
        self.entries.iter().map(|(l, a)| (*l, *a))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RewardTable {
    fn default() -> Self {
        Self::new([
            (Level::new(1), Amount::from_major(288)),
            (Level::new(2), Amount::from_major(600)),
            (Level::new(3), Amount::from_major(1200)),
            (Level::new(4), Amount::from_major(1800)),
            (Level::new(5), Amount::from_major(2400)),
        ])
    }
}

// TOML tables need string keys, and amounts are written in major units:
//   [reward_table]
//   1 = 288
//   2 = "600.50"
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AmountRepr {
    Major(u64),
    Text(String),
}

impl Serialize for RewardTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let map: BTreeMap<String, AmountRepr> = self
            .entries
            .iter()
            .map(|(level, amount)| {
                let repr = if amount.to_base_units() % kazi_types::BASE_UNITS_PER_MAJOR == 0 {
                    AmountRepr::Major(amount.to_base_units() / kazi_types::BASE_UNITS_PER_MAJOR)
                } else {
                    AmountRepr::Text(format!("{:.2}", amount.to_major_f64()))
                };
                (level.get().to_string(), repr)
            })
            .collect();
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RewardTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, AmountRepr>::deserialize(deserializer)?;
        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            let level: Level = key.parse().map_err(serde::de::Error::custom)?;
            let amount = match value {
                AmountRepr::Major(major) => major
                    .checked_mul(kazi_types::BASE_UNITS_PER_MAJOR)
                    .map(Amount::from_base_units)
                    .ok_or_else(|| serde::de::Error::custom("reward amount overflows"))?,
                AmountRepr::Text(text) => text.parse().map_err(serde::de::Error::custom)?,
            };
            if amount.is_zero() {
                return Err(serde::de::Error::custom(format!(
                    "reward for level {} must be greater than zero",
                    key
                )));
            }
            entries.insert(level, amount);
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsConfig {
    /// Upper bound on waiting for a per-pair or per-inviter settlement lock.
    pub lock_timeout_ms: u64,
    /// Upper bound on waiting for the store's write lock (SQLite busy timeout).
    pub store_busy_timeout_ms: u64,
    pub notifications_enabled: bool,
    // Kept last: TOML tables must follow plain values.
    pub reward_table: RewardTable,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            store_busy_timeout_ms: 5_000,
            notifications_enabled: true,
            reward_table: RewardTable::default(),
        }
    }
}

impl RewardsConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rewards config: {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse rewards config: {}", path.display()))?;
        info!(
            path = %path.display(),
            levels = config.reward_table.len(),
            "Rewards configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = env::var("KAZI_LOCK_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => self.lock_timeout_ms = ms,
                Err(_) => warn!(value = %timeout, "Ignoring invalid KAZI_LOCK_TIMEOUT_MS"),
            }
        }
        if let Ok(timeout) = env::var("KAZI_STORE_BUSY_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => self.store_busy_timeout_ms = ms,
                Err(_) => warn!(value = %timeout, "Ignoring invalid KAZI_STORE_BUSY_TIMEOUT_MS"),
            }
        }
        if let Ok(enabled) = env::var("KAZI_NOTIFICATIONS") {
            self.notifications_enabled = matches!(enabled.as_str(), "1" | "true" | "on");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.reward_table.is_empty() {
            bail!("Reward table must define at least one level");
        }
        for (level, amount) in self.reward_table.entries.iter() {
            if level.is_temporary() {
                bail!("Level 0 (temporary workers) cannot carry a referral reward");
            }
            if amount.is_zero() {
                bail!("Reward for {} must be greater than zero", level);
            }
        }
        if self.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be greater than zero");
        }
        if self.store_busy_timeout_ms == 0 {
            bail!("store_busy_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn store_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store_busy_timeout_ms)
    }
}
