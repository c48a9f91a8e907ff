use anyhow::{bail, Context, Result};
use kazi_rewards::RewardsConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "./kazi.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub database_path: PathBuf,
    pub logging: LoggingConfig,
    pub rewards: RewardsConfig,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./kazi.db"),
            logging: LoggingConfig::default(),
            rewards: RewardsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
    pub file_output: Option<PathBuf>,
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_output: None,
            module_filters: HashMap::new(),
        }
    }
}

impl AdminConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Explicit path, then `./kazi.toml` if present, then defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = env::var("KAZI_DATABASE_PATH") {
            if !path.is_empty() {
                self.database_path = PathBuf::from(path);
            }
        }
        if let Ok(level) = env::var("KAZI_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("KAZI_LOG_FORMAT") {
            self.logging.format = format;
        }
        self.rewards.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            bail!("database_path must not be empty");
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            bail!(
                "Unknown log format '{}': expected pretty, compact or json",
                self.logging.format
            );
        }
        self.rewards.validate()
    }
}
