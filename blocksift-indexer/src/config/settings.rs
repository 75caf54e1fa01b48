//! Settings structs and loading logic.
//!
//! All settings have sensible defaults and can be overridden via
//! environment variables or configuration files.

use std::collections::HashSet;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::Result;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Chain endpoints and dictionary endpoints.
    pub network: NetworkSettings,
    /// Fetching and dispatching behavior.
    pub indexer: IndexerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Metrics configuration.
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Load settings from configuration files and environment variables.
    ///
    /// Files are loaded in this order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (if exists)
    /// 3. Environment variables with `BLOCKSIFT_` prefix
    ///
    /// # Errors
    /// Returns `ConfigError` if configuration is invalid or cannot be loaded.
    pub fn load(environment: &str) -> std::result::Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("network.endpoints", vec!["http://localhost:8545"])?
            .set_default("network.dictionary", Vec::<String>::new())?
            .set_default("network.dictionary_resolver", Option::<String>::None)?
            .set_default("network.dictionary_timeout_ms", 30_000)?
            .set_default("network.request_timeout_ms", 120_000)?
            .set_default("indexer.batch_size", 30)?
            .set_default("indexer.dictionary_query_size", 10_000)?
            .set_default("indexer.query_address_limit", 1_000)?
            .set_default("indexer.unfinalized_blocks", false)?
            .set_default("indexer.bypass_blocks", Vec::<String>::new())?
            .set_default("indexer.worker_retries", 3)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "plain")?
            .set_default("logging.file_path", Option::<String>::None)?
            .set_default("metrics.enabled", true)?
            .set_default("metrics.host", "0.0.0.0")?
            .set_default("metrics.port", 9090)?
            // Load default configuration file
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            // Load environment-specific file
            .add_source(File::with_name(&format!("{config_dir}/{environment}")).required(false))
            // Override with environment variables (BLOCKSIFT_ prefix)
            .add_source(
                Environment::with_prefix("BLOCKSIFT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("network.endpoints")
                    .with_list_parse_key("network.dictionary")
                    .with_list_parse_key("indexer.bypass_blocks"),
            );

        builder.build()?.try_deserialize()
    }

    /// Load settings from a specific file path.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    /// Returns [`crate::error::IndexerError::Config`] on invalid settings.
    pub fn validate(&self) -> Result<()> {
        if self.network.endpoints.is_empty() {
            return Err(crate::error::IndexerError::Config(
                "at least one network endpoint is required".into(),
            ));
        }
        if self.indexer.batch_size == 0 {
            return Err(crate::error::IndexerError::Config(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.indexer.dictionary_query_size == 0 {
            return Err(crate::error::IndexerError::Config(
                "dictionary_query_size must be at least 1".into(),
            ));
        }
        // Parse eagerly so bad bypass entries fail at startup, not mid-sync.
        self.indexer.bypass_set()?;
        Ok(())
    }
}

/// Chain and dictionary endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSettings {
    /// JSON-RPC endpoints; all must serve the same chain.
    pub endpoints: Vec<String>,
    /// Dictionary endpoints (empty disables acceleration).
    #[serde(default)]
    pub dictionary: Vec<String>,
    /// Dictionary resolver URL. Accepted for manifest compatibility;
    /// resolution happens in the deployment layer, not here.
    #[serde(default)]
    pub dictionary_resolver: Option<String>,
    /// Per-query dictionary timeout.
    pub dictionary_timeout_ms: u64,
    /// Wall-clock deadline for one RPC call (including retries).
    pub request_timeout_ms: u64,
}

/// Fetching and dispatching behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerSettings {
    /// Blocks per fetch batch.
    pub batch_size: usize,
    /// Width of a dictionary query window.
    pub dictionary_query_size: u64,
    /// Ceiling on distinct addresses per dictionary condition set.
    pub query_address_limit: usize,
    /// Index up to the best tip, tracking unfinalized blocks.
    pub unfinalized_blocks: bool,
    /// Heights to skip: integers or `"start-end"` ranges.
    #[serde(default)]
    pub bypass_blocks: Vec<String>,
    /// Internal fetch retries before a worker failure turns fatal.
    pub worker_retries: u32,
}

impl IndexerSettings {
    /// Bypass entries expanded into a height set.
    ///
    /// # Errors
    /// Returns [`crate::error::IndexerError::Config`] on malformed entries.
    pub fn bypass_set(&self) -> Result<HashSet<u64>> {
        crate::indexer::service::parse_bypass_blocks(&self.bypass_blocks)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Default filter level (`trace`..`error`).
    pub level: String,
    /// `plain` or `json`.
    pub format: String,
    /// Daily-rolling log file; absent logs to stdout.
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    /// Whether to expose a Prometheus endpoint.
    pub enabled: bool,
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Settings {
        Settings::load("test-nonexistent-environment").expect("defaults load")
    }

    #[test]
    fn defaults_are_valid() {
        let settings = defaults();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.indexer.batch_size, 30);
        assert_eq!(settings.indexer.dictionary_query_size, 10_000);
        assert!(!settings.indexer.unfinalized_blocks);
        assert_eq!(settings.network.request_timeout_ms, 120_000);
        assert!(settings.logging.file_path.is_none(), "stdout by default");
    }

    #[test]
    fn empty_endpoints_fail_validation() {
        let mut settings = defaults();
        settings.network.endpoints.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_batch_size_fails_validation() {
        let mut settings = defaults();
        settings.indexer.batch_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bad_bypass_entries_fail_validation() {
        let mut settings = defaults();
        settings.indexer.bypass_blocks = vec!["not-a-number".into()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bypass_ranges_expand() {
        let mut settings = defaults();
        settings.indexer.bypass_blocks = vec!["2-5".into(), "10".into()];
        let set = settings.indexer.bypass_set().expect("parse");
        assert_eq!(set, HashSet::from([2, 3, 4, 5, 10]));
    }
}
