//! Configuration management for Timescape
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (timescape.toml)
//! - Environment variables (TIMESCAPE__*)
//!
//! ## Example config file (timescape.toml):
//! ```toml
//! [registry]
//! snapshot_path = "./timescape-registry.json"
//! snapshot_interval_secs = 60
//!
//! [transformer]
//! max_chain_length = 10
//! hop_timeout_ms = 1000
//!
//! [lifecycle]
//! sweep_interval_secs = 300
//! protected_tags = ["stable", "production"]
//! excluded_handlers = ["/health"]
//! dry_run = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimescapeConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub transformer: TransformerConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Registry persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Where the registry snapshot is written; no persistence when unset
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// Seconds between background snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

/// Version resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Entries kept in the resolution cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// Transformer chains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Longest chain, in hops, that will be built
    #[serde(default = "default_max_chain_length")]
    pub max_chain_length: usize,

    /// Time allowed for a single hop
    #[serde(default = "default_hop_timeout")]
    pub hop_timeout_ms: u64,
}

/// Lifecycle classification and deactivation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Requests within the classification window that make a version hot
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: u64,

    /// Length of the request-counting window
    #[serde(default = "default_classification_window")]
    pub classification_window_ms: i64,

    /// Idle time after which a version is cold
    #[serde(default = "default_cold_threshold")]
    pub cold_threshold_ms: i64,

    /// Cold versions with fewer lifetime requests than this are retired
    #[serde(default = "default_min_request_count")]
    pub min_request_count: u64,

    /// Tags whose versions are never retired automatically
    #[serde(default = "default_protected_tags")]
    pub protected_tags: Vec<String>,

    /// Handlers the sweep leaves alone
    #[serde(default)]
    pub excluded_handlers: Vec<String>,

    /// Report what would be retired without retiring it
    #[serde(default)]
    pub dry_run: bool,
}

/// Database schema migrations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_migration_timeout")]
    pub migration_timeout_ms: u64,

    #[serde(default = "default_migration_timeout")]
    pub rollback_timeout_ms: u64,
}

// Default value functions
fn default_snapshot_interval() -> u64 {
    60
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_max_chain_length() -> usize {
    10
}

fn default_hop_timeout() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_hot_threshold() -> u64 {
    100
}

fn default_classification_window() -> i64 {
    HOUR_MS
}

fn default_cold_threshold() -> i64 {
    7 * DAY_MS
}

fn default_min_request_count() -> u64 {
    10
}

fn default_protected_tags() -> Vec<String> {
    ["stable", "production", "latest"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_migration_timeout() -> u64 {
    30_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            max_chain_length: default_max_chain_length(),
            hop_timeout_ms: default_hop_timeout(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            hot_threshold: default_hot_threshold(),
            classification_window_ms: default_classification_window(),
            cold_threshold_ms: default_cold_threshold(),
            min_request_count: default_min_request_count(),
            protected_tags: default_protected_tags(),
            excluded_handlers: Vec::new(),
            dry_run: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            migration_timeout_ms: default_migration_timeout(),
            rollback_timeout_ms: default_migration_timeout(),
        }
    }
}

impl TransformerConfig {
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }
}

impl LifecycleConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl DatabaseConfig {
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_millis(self.rollback_timeout_ms)
    }
}

impl TimescapeConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["timescape.toml", ".timescape.toml", "config/timescape.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(dirs) = directories::ProjectDirs::from("dev", "timescape", "timescape") {
            let xdg_config = dirs.config_dir().join("timescape.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // TIMESCAPE__LIFECYCLE__DRY_RUN=true
        builder = builder.add_source(
            Environment::with_prefix("TIMESCAPE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Snapshot path resolved against the working directory
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.registry.snapshot_path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                std::env::current_dir().unwrap_or_default().join(p)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TimescapeConfig::default();
        assert_eq!(config.transformer.max_chain_length, 10);
        assert_eq!(config.lifecycle.cold_threshold_ms, 7 * DAY_MS);
        assert_eq!(config.lifecycle.protected_tags, vec!["stable", "production", "latest"]);
        assert!(!config.lifecycle.dry_run);
        assert!(config.snapshot_path().is_none());
    }

    #[test]
    fn test_serialize_config() {
        let config = TimescapeConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[lifecycle]"));
        assert!(toml_str.contains("[transformer]"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[lifecycle]\ndry_run = true\nmin_request_count = 3\n\n[transformer]\nhop_timeout_ms = 250\n",
        )
        .unwrap();

        let config = TimescapeConfig::load_from(path.to_str()).unwrap();
        assert!(config.lifecycle.dry_run);
        assert_eq!(config.lifecycle.min_request_count, 3);
        assert_eq!(config.lifecycle.hot_threshold, 100);
        assert_eq!(config.transformer.hop_timeout(), Duration::from_millis(250));
    }
}
