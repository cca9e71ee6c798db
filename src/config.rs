//! Cache configuration.
//!
//! Defaults mirror what a browser-embedded bytecode cache uses: 100 MiB, with
//! maintenance scheduled at 80% and eviction down to 70%.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheError, IntegrityMode};

pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_HIGH_WATER_FRACTION: f64 = 0.8;
pub const DEFAULT_TARGET_FRACTION: f64 = 0.7;
pub const DEFAULT_STALE_TEMP_SECS: u64 = 60 * 60;

pub const ENV_CACHE_DIR: &str = "CODECACHE_DIR";
pub const ENV_MAX_SIZE: &str = "CODECACHE_MAX_SIZE";
pub const ENV_ENABLED: &str = "CODECACHE_ENABLED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false the cache never touches the filesystem.
    pub enabled: bool,
    /// Custom cache root. Empty counts as unset.
    pub root: Option<PathBuf>,
    /// Maximum cache size in bytes.
    pub max_bytes: u64,
    /// Fraction of `max_bytes` above which maintenance is scheduled.
    pub high_water_fraction: f64,
    /// Fraction of `max_bytes` eviction brings the cache back down to.
    pub target_fraction: f64,
    pub integrity: IntegrityMode,
    /// Age after which orphaned temp files are swept during maintenance.
    pub stale_temp_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            max_bytes: DEFAULT_MAX_BYTES,
            high_water_fraction: DEFAULT_HIGH_WATER_FRACTION,
            target_fraction: DEFAULT_TARGET_FRACTION,
            integrity: IntegrityMode::default(),
            stale_temp_secs: DEFAULT_STALE_TEMP_SECS,
        }
    }
}

impl CacheConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Overlays environment values fetched through `lookup` on the defaults.
    /// Unparseable values are ignored.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            config.root = Some(PathBuf::from(dir));
        }
        if let Some(max) = lookup(ENV_MAX_SIZE) {
            config.max_bytes = max.trim().parse().unwrap_or(DEFAULT_MAX_BYTES);
        }
        if let Some(enabled) = lookup(ENV_ENABLED) {
            config.enabled = parse_flag(&enabled).unwrap_or(true);
        }
        config
    }

    #[cfg(feature = "toml-config")]
    pub fn from_toml_file(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cache config {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse cache config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "max_bytes must be greater than zero".into(),
            ));
        }
        for (name, value) in [
            ("high_water_fraction", self.high_water_fraction),
            ("target_fraction", self.target_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CacheError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.target_fraction >= self.high_water_fraction {
            return Err(CacheError::InvalidConfig(format!(
                "target_fraction ({}) must be below high_water_fraction ({})",
                self.target_fraction, self.high_water_fraction
            )));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_bytes, 100 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = CacheConfig::from_env_with(lookup(&[
            (ENV_CACHE_DIR, "/tmp/cc"),
            (ENV_MAX_SIZE, "4096"),
            (ENV_ENABLED, "false"),
        ]));
        assert_eq!(config.root, Some(PathBuf::from("/tmp/cc")));
        assert_eq!(config.max_bytes, 4096);
        assert!(!config.enabled);
    }

    #[test]
    fn unparseable_env_values_fall_back() {
        let config = CacheConfig::from_env_with(lookup(&[
            (ENV_MAX_SIZE, "lots"),
            (ENV_ENABLED, "maybe"),
        ]));
        assert_eq!(config.max_bytes, DEFAULT_MAX_BYTES);
        assert!(config.enabled);
    }

    #[test]
    fn validate_rejects_inverted_fractions() {
        let config = CacheConfig {
            high_water_fraction: 0.6,
            target_fraction: 0.7,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_zero_size_and_bad_fraction() {
        let zero = CacheConfig {
            max_bytes: 0,
            ..CacheConfig::default()
        };
        assert!(zero.validate().is_err());

        let nan = CacheConfig {
            high_water_fraction: f64::NAN,
            ..CacheConfig::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: CacheConfig = serde_json::from_str(r#"{"max_bytes": 1024}"#).unwrap();
        assert_eq!(config.max_bytes, 1024);
        assert_eq!(config.integrity, IntegrityMode::Content);
        assert!(config.enabled);
    }
}
