use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::policy::{Enforcement, QuotaPolicy, DEFAULT_RESERVED_FRACTION};

/// Path of an explicit configuration file.
pub const CONFIG_ENV: &str = "VRAMCAP_CONFIG";
/// Overrides `quota.reserved_fraction`.
pub const FRACTION_ENV: &str = "VRAMCAP_RESERVED_FRACTION";
/// Overrides `quota.enforcement`.
pub const ENFORCEMENT_ENV: &str = "VRAMCAP_ENFORCEMENT";

/// Top-level vramcap configuration, loaded from vramcap.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VramcapConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Fraction of device memory hidden from the application (0 < f < 1)
    #[serde(default = "default_fraction")]
    pub reserved_fraction: f64,
    /// "advisory" or "strict"
    #[serde(default)]
    pub enforcement: Enforcement,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            reserved_fraction: default_fraction(),
            enforcement: Enforcement::default(),
        }
    }
}

impl VramcapConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|source| CoreError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Load the configuration the way the preloaded library sees it: the file
    /// named by `VRAMCAP_CONFIG` (or the default search path), then the
    /// environment overrides.
    pub fn from_environment() -> Result<Self, CoreError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(&path)?,
            Err(_) => match default_config_path() {
                Some(path) => Self::load(&path)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `VRAMCAP_RESERVED_FRACTION` / `VRAMCAP_ENFORCEMENT` style
    /// overrides, reading values through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(FRACTION_ENV) {
            self.quota.reserved_fraction = raw.trim().parse().map_err(|_| {
                CoreError::ConfigError(format!("{}='{}' is not a number", FRACTION_ENV, raw))
            })?;
        }
        if let Some(raw) = lookup(ENFORCEMENT_ENV) {
            self.quota.enforcement = raw.parse()?;
        }
        Ok(())
    }

    /// Validate the quota section into a policy.
    pub fn policy(&self) -> Result<QuotaPolicy, CoreError> {
        QuotaPolicy::new(self.quota.reserved_fraction, self.quota.enforcement)
    }
}

/// Returns the default config file path, if one exists.
/// Search order:
/// 1. System-wide config: `/etc/vramcap/vramcap.toml`
/// 2. Local fallback: `./vramcap.toml`
pub fn default_config_path() -> Option<String> {
    ["/etc/vramcap/vramcap.toml", "vramcap.toml"]
        .iter()
        .find(|path| std::path::Path::new(path).exists())
        .map(|path| path.to_string())
}

fn default_fraction() -> f64 {
    DEFAULT_RESERVED_FRACTION
}
