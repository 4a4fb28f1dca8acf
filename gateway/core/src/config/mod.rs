//! TOML Configuration File Support
//!
//! Loads gateway configuration from `~/.config/llm-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/llm-gateway/gateway.toml` (typically `~/.config/llm-gateway/gateway.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [breaker]
//! failure_threshold = 5
//! success_threshold = 2
//! timeout_seconds = 60
//! failure_window_seconds = 60
//! failure_rate_threshold = 0.5
//! min_requests_for_rate = 10
//!
//! [breaker.providers.openai]
//! failure_threshold = 3
//!
//! [selector]
//! ema_alpha = 0.3
//! degraded_success_rate = 0.8
//! degraded_latency_ms = 10000
//! credentialed_providers = ["openai", "anthropic"]
//!
//! [failover]
//! max_retries = 3
//!
//! [catalog]
//! path = "/etc/llm-gateway/catalog.toml"
//! reload_interval_secs = 300
//!
//! [store]
//! enabled = false
//! sync_interval_secs = 5
//! path = "/var/lib/llm-gateway/breaker-state"
//!
//! [metrics]
//! log_interval_secs = 60
//! export_path = "/var/lib/llm-gateway/metrics.prom"
//! ```
//!
//! Runtime state (the shared breaker store and the metrics export) defaults
//! to `$XDG_DATA_HOME/llm-gateway/`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::{BreakerConfig, ProviderRouterBuilder, SelectorConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Breaker thresholds; every field optional so sections can override a subset
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerFieldsToml {
    /// Consecutive failures that open the circuit
    pub failure_threshold: Option<u32>,

    /// Consecutive probe successes that close it
    pub success_threshold: Option<u32>,

    /// Seconds to stay open
    pub timeout_seconds: Option<u64>,

    /// Rolling window horizon in seconds
    pub failure_window_seconds: Option<u64>,

    /// Failure rate that opens the circuit
    pub failure_rate_threshold: Option<f64>,

    /// Samples needed before the rate is evaluated
    pub min_requests_for_rate: Option<u32>,
}

impl BreakerFieldsToml {
    /// Overlay the fields that are set onto `config`
    pub fn apply_to(&self, config: &mut BreakerConfig) {
        if let Some(n) = self.failure_threshold {
            config.failure_threshold = n;
        }
        if let Some(n) = self.success_threshold {
            config.success_threshold = n;
        }
        if let Some(secs) = self.timeout_seconds {
            config.timeout_seconds = secs;
        }
        if let Some(secs) = self.failure_window_seconds {
            config.failure_window_seconds = secs;
        }
        if let Some(rate) = self.failure_rate_threshold {
            config.failure_rate_threshold = rate;
        }
        if let Some(n) = self.min_requests_for_rate {
            config.min_requests_for_rate = n;
        }
    }
}

/// Breaker section of the TOML configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerToml {
    /// Defaults for every provider
    #[serde(flatten)]
    pub defaults: BreakerFieldsToml,

    /// Per-provider overrides
    pub providers: BTreeMap<String, BreakerFieldsToml>,
}

/// Selector section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorToml {
    /// EMA smoothing for health stats
    pub ema_alpha: Option<f64>,

    /// Success rate below which a provider is demoted
    pub degraded_success_rate: Option<f64>,

    /// Latency above which a provider is demoted
    pub degraded_latency_ms: Option<f64>,

    /// Providers with credentials configured
    pub credentialed_providers: Option<Vec<String>>,
}

/// Failover section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverToml {
    /// Planned attempts examined per request
    pub max_retries: Option<usize>,
}

/// Catalog section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogToml {
    /// Catalog file path
    pub path: Option<PathBuf>,

    /// Seconds between catalog reloads
    pub reload_interval_secs: Option<u64>,
}

/// Shared store section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Whether breaker state is mirrored
    pub enabled: Option<bool>,

    /// Seconds between pulls of remote state
    pub sync_interval_secs: Option<u64>,

    /// Directory shared by every instance on the host
    pub path: Option<PathBuf>,
}

/// Metrics section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsToml {
    /// Seconds between metrics summaries in the log
    pub log_interval_secs: Option<u64>,

    /// Prometheus text file rewritten on every summary
    pub export_path: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Breaker configuration section
    pub breaker: BreakerToml,

    /// Selector configuration section
    pub selector: SelectorToml,

    /// Failover configuration section
    pub failover: FailoverToml,

    /// Catalog configuration section
    pub catalog: CatalogToml,

    /// Shared store configuration section
    pub store: StoreToml,

    /// Metrics configuration section
    pub metrics: MetricsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved gateway configuration
///
/// Use [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Default breaker thresholds
    pub breaker: BreakerConfig,

    /// Per-provider breaker overrides, applied over `breaker`
    pub provider_breakers: BTreeMap<String, BreakerFieldsToml>,

    /// Selector tuning
    pub selector: SelectorConfig,

    /// Planned attempts examined per request
    pub max_retries: usize,

    /// Catalog file, if any
    pub catalog_path: Option<PathBuf>,

    /// Catalog reload period
    pub catalog_reload_interval: Duration,

    /// Whether breaker state is mirrored to a shared store
    pub store_enabled: bool,

    /// Shared store pull period
    pub store_sync_interval: Duration,

    /// Directory of the file-backed shared store
    pub store_path: PathBuf,

    /// Metrics summary log period
    pub metrics_log_interval: Duration,

    /// Where serve mode exports metrics for the `metrics` command
    pub metrics_export_path: PathBuf,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            provider_breakers: BTreeMap::new(),
            selector: SelectorConfig::default(),
            max_retries: 3,
            catalog_path: None,
            catalog_reload_interval: Duration::from_secs(300),
            store_enabled: false,
            store_sync_interval: Duration::from_secs(5),
            store_path: default_data_dir().join("breaker-state"),
            metrics_log_interval: Duration::from_secs(60),
            metrics_export_path: default_data_dir().join("metrics.prom"),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Effective breaker thresholds for one provider
    #[must_use]
    pub fn breaker_for(&self, provider: &str) -> BreakerConfig {
        let mut config = self.breaker.clone();
        if let Some(fields) = self.provider_breakers.get(provider) {
            fields.apply_to(&mut config);
        }
        config
    }

    /// Check every value range
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("breaker: {e}")))?;
        for provider in self.provider_breakers.keys() {
            self.breaker_for(provider)
                .validate()
                .map_err(|e| ConfigError::ValidationError(format!("breaker.providers.{provider}: {e}")))?;
        }

        let alpha = self.selector.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "selector.ema_alpha must be in (0, 1], got {alpha}"
            )));
        }
        if !(0.0..=1.0).contains(&self.selector.degraded_success_rate) {
            return Err(ConfigError::ValidationError(format!(
                "selector.degraded_success_rate must be in [0, 1], got {}",
                self.selector.degraded_success_rate
            )));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "failover.max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Router builder carrying this configuration
    #[must_use]
    pub fn router_builder(&self) -> ProviderRouterBuilder {
        let mut builder = ProviderRouterBuilder::default()
            .breaker_config(self.breaker.clone())
            .selector_config(self.selector.clone())
            .max_retries(self.max_retries);
        for provider in self.provider_breakers.keys() {
            builder = builder.provider_breaker_config(provider.clone(), self.breaker_for(provider));
        }
        builder
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-gateway/gateway.toml` or
/// `~/.config/llm-gateway/gateway.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("llm-gateway").join("gateway.toml"))
}

/// Directory for runtime state shared between gateway processes
///
/// Returns `$XDG_DATA_HOME/llm-gateway`, falling back to the system temp
/// directory when no data directory is known.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("llm-gateway")
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if validation fails.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    toml.breaker.defaults.apply_to(&mut config.breaker);
    config.provider_breakers = toml.breaker.providers.clone();

    if let Some(alpha) = toml.selector.ema_alpha {
        config.selector.ema_alpha = alpha;
    }
    if let Some(rate) = toml.selector.degraded_success_rate {
        config.selector.degraded_success_rate = rate;
    }
    if let Some(latency) = toml.selector.degraded_latency_ms {
        config.selector.degraded_latency_ms = latency;
    }
    if let Some(ref providers) = toml.selector.credentialed_providers {
        config.selector.credentialed_providers = Some(providers.iter().cloned().collect::<HashSet<_>>());
    }

    if let Some(retries) = toml.failover.max_retries {
        config.max_retries = retries;
    }

    if toml.catalog.path.is_some() {
        config.catalog_path = toml.catalog.path.clone();
    }
    if let Some(secs) = toml.catalog.reload_interval_secs {
        config.catalog_reload_interval = Duration::from_secs(secs);
    }

    if let Some(enabled) = toml.store.enabled {
        config.store_enabled = enabled;
    }
    if let Some(secs) = toml.store.sync_interval_secs {
        config.store_sync_interval = Duration::from_secs(secs);
    }
    if let Some(ref path) = toml.store.path {
        config.store_path = path.clone();
    }

    if let Some(secs) = toml.metrics.log_interval_secs {
        config.metrics_log_interval = Duration::from_secs(secs);
    }
    if let Some(ref path) = toml.metrics.export_path {
        config.metrics_export_path = path.clone();
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut GatewayConfig) {
    if let Ok(path) = std::env::var("GATEWAY_CATALOG_PATH") {
        config.catalog_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
    if let Ok(retries) = std::env::var("GATEWAY_MAX_RETRIES") {
        if let Ok(n) = retries.parse::<usize>() {
            config.max_retries = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(threshold) = std::env::var("GATEWAY_BREAKER_FAILURE_THRESHOLD") {
        if let Ok(n) = threshold.parse::<u32>() {
            config.breaker.failure_threshold = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(timeout) = std::env::var("GATEWAY_BREAKER_TIMEOUT_SECS") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.breaker.timeout_seconds = secs;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(enabled) = std::env::var("GATEWAY_STORE_ENABLED") {
        config.store_enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Ok(path) = std::env::var("GATEWAY_STORE_PATH") {
        config.store_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`], then call [`GatewayConfig::validate`].
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Catalog path override
    pub catalog_path: Option<PathBuf>,

    /// Max retries override
    pub max_retries: Option<usize>,

    /// Failure threshold override
    pub failure_threshold: Option<u32>,

    /// Shared store override
    pub store_enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set catalog path override
    #[must_use]
    pub fn with_catalog_path(mut self, path: PathBuf) -> Self {
        self.catalog_path = Some(path);
        self
    }

    /// Set max retries override
    #[must_use]
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set failure threshold override
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set shared store override
    #[must_use]
    pub fn with_store_enabled(mut self, enabled: bool) -> Self {
        self.store_enabled = Some(enabled);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.catalog_path.is_some()
            || self.max_retries.is_some()
            || self.failure_threshold.is_some()
            || self.store_enabled.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.catalog_path {
            config.catalog_path = Some(path.clone());
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(threshold) = self.failure_threshold {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(enabled) = self.store_enabled {
            config.store_enabled = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
