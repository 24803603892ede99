// ============================================================================
// CONFIGURATION
// ============================================================================
// TOML file merged with `ARCHSTATS_<SECTION>__<FIELD>` environment
// overrides. Every field has a serde default so an empty file is valid.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{
    DEFAULT_APPLIANCE_URL, DEFAULT_CACHE_TTL_MS, DEFAULT_DATABASE_URL, DEFAULT_FAILURE_BACKOFF_SECS,
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_INTER_GROUP_DELAY_MS, DEFAULT_NAMESPACE_TEMPLATE, DEFAULT_NON_FINITE_SENTINEL,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_PREFIX, DEFAULT_STORE_TIMEOUT_SECS, MIN_POLL_INTERVAL_SECS,
    SHUTDOWN_GRACE_PERIOD_SECS,
};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "ARCHSTATS_";

/// Legacy variable naming the appliance
pub const LEGACY_URL_VAR: &str = "ARCHIVER_URL";

// ----------------------------------------------------------------------------
// Root
// ----------------------------------------------------------------------------

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub appliance: ApplianceConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load a TOML file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Defaults plus environment overrides, no file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Figment::new())
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        if let Ok(raw) = std::env::var(LEGACY_URL_VAR) {
            if !raw.is_empty() {
                config.appliance.url = normalize_appliance_url(&raw)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text (no environment).
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(ConfigError::invalid_value(
                "bridge.poll_interval_secs",
                format!("Poll interval must be at least {}s", MIN_POLL_INTERVAL_SECS),
            ));
        }
        if self.bridge.failure_backoff_secs < 1 {
            return Err(ConfigError::invalid_value(
                "bridge.failure_backoff_secs",
                "Failure backoff must be at least 1s",
            ));
        }
        if self.bridge.bootstrap_retry_secs < 1 {
            return Err(ConfigError::invalid_value(
                "bridge.bootstrap_retry_secs",
                "Bootstrap retry must be at least 1s",
            ));
        }

        Url::parse(&self.appliance.url)
            .map_err(|e| ConfigError::invalid_value("appliance.url", e.to_string()))?;
        if self.appliance.http_timeout_secs == 0 {
            return Err(ConfigError::invalid_value("appliance.http_timeout_secs", "Timeout must be positive"));
        }

        if self.database.namespace_template.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "database.namespace_template",
                "Namespace template cannot be empty",
            ));
        }
        if let Some(pattern) = &self.database.namespace_suffix {
            if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
                return Err(ConfigError::invalid_value(
                    "database.namespace_suffix",
                    format!("'{}' is not a valid strftime pattern", pattern),
                ));
            }
        }
        if !self.database.non_finite_sentinel.is_finite() {
            return Err(ConfigError::invalid_value(
                "database.non_finite_sentinel",
                "Sentinel must be a finite number",
            ));
        }
        if self.database.timeout_secs == 0 {
            return Err(ConfigError::invalid_value("database.timeout_secs", "Timeout must be positive"));
        }

        Ok(())
    }

    /// The defaults rendered as TOML.
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Add a missing scheme and reduce to `scheme://host[:port]/`.
///
/// ```
/// use archstats::config::normalize_appliance_url;
/// assert_eq!(
///     normalize_appliance_url("appliance.example:17665/mgmt/ui").unwrap(),
///     "http://appliance.example:17665/",
/// );
/// ```
pub fn normalize_appliance_url(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    let with_scheme = if raw.starts_with("http") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let url = Url::parse(&with_scheme).map_err(|e| ConfigError::invalid_value(LEGACY_URL_VAR, e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::invalid_value(LEGACY_URL_VAR, "URL has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}/", url.scheme(), host, port),
        None => format!("{}://{}/", url.scheme(), host),
    })
}

// ----------------------------------------------------------------------------
// [bridge]
// ----------------------------------------------------------------------------

/// Loop timing and channel naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Prefix of every published channel
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_inter_group_delay_ms")]
    pub inter_group_delay_ms: u64,

    /// Extra sleep after a failed pass
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Pause between instance discovery attempts
    #[serde(default = "default_bootstrap_retry_secs")]
    pub bootstrap_retry_secs: u64,

    /// Warn when one pass takes longer than this
    #[serde(default = "default_pass_warn_threshold_ms")]
    pub pass_warn_threshold_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            poll_interval_secs: default_poll_interval_secs(),
            inter_group_delay_ms: default_inter_group_delay_ms(),
            failure_backoff_secs: default_failure_backoff_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            bootstrap_retry_secs: default_bootstrap_retry_secs(),
            pass_warn_threshold_ms: default_pass_warn_threshold_ms(),
        }
    }
}

impl BridgeSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn bootstrap_retry(&self) -> Duration {
        Duration::from_secs(self.bootstrap_retry_secs)
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_inter_group_delay_ms() -> u64 {
    DEFAULT_INTER_GROUP_DELAY_MS
}
fn default_failure_backoff_secs() -> u64 {
    DEFAULT_FAILURE_BACKOFF_SECS
}
fn default_shutdown_timeout_secs() -> u64 {
    SHUTDOWN_GRACE_PERIOD_SECS
}
fn default_bootstrap_retry_secs() -> u64 {
    10
}
fn default_pass_warn_threshold_ms() -> u64 {
    5000
}

// ----------------------------------------------------------------------------
// [appliance]
// ----------------------------------------------------------------------------

/// The management API being polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplianceConfig {
    /// Base URL, ending in `/`
    #[serde(default = "default_appliance_url")]
    pub url: String,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Keys forced to float in addition to the built-in set
    #[serde(default)]
    pub extra_float_keys: Vec<String>,

    #[serde(default = "default_true")]
    pub storage_metrics: bool,

    #[serde(default)]
    pub process_metrics: bool,

    /// Publish the instance list itself as a group
    #[serde(default)]
    pub summary_group: bool,
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            url: default_appliance_url(),
            http_timeout_secs: default_http_timeout_secs(),
            cache_ttl_ms: default_cache_ttl_ms(),
            extra_float_keys: Vec::new(),
            storage_metrics: true,
            process_metrics: false,
            summary_group: false,
        }
    }
}

impl ApplianceConfig {
    /// `url` joined with a management path.
    pub fn endpoint(&self, path: &str) -> String {
        if self.url.ends_with('/') {
            format!("{}{}", self.url, path)
        } else {
            format!("{}/{}", self.url, path)
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn default_appliance_url() -> String {
    DEFAULT_APPLIANCE_URL.to_string()
}
fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}
fn default_cache_ttl_ms() -> u64 {
    DEFAULT_CACHE_TTL_MS
}
fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// [database]
// ----------------------------------------------------------------------------

/// Document store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Elastic,
    File,
    Memory,
}

impl FromStr for DatabaseBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "elastic" | "elasticsearch" => Ok(DatabaseBackend::Elastic),
            "file" => Ok(DatabaseBackend::File),
            "memory" => Ok(DatabaseBackend::Memory),
            _ => Err(ConfigError::UnknownBackend { backend: s.to_string() }),
        }
    }
}

impl Display for DatabaseBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseBackend::Elastic => write!(f, "elastic"),
            DatabaseBackend::File => write!(f, "file"),
            DatabaseBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Where snapshots go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,

    /// Store URL, or a directory for the file backend
    #[serde(default = "default_database_url")]
    pub url: String,

    /// `{instance}` is replaced by the lowercased instance name
    #[serde(default = "default_namespace_template")]
    pub namespace_template: String,

    /// strftime suffix for time-partitioned namespaces, e.g. `-%Y.%m`
    #[serde(default)]
    pub namespace_suffix: Option<String>,

    /// Identity embedded in documents when groups share a namespace
    #[serde(default)]
    pub identity: Option<String>,

    #[serde(default = "default_non_finite_sentinel")]
    pub non_finite_sentinel: f64,

    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub restore_on_startup: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            url: default_database_url(),
            namespace_template: default_namespace_template(),
            namespace_suffix: None,
            identity: None,
            non_finite_sentinel: default_non_finite_sentinel(),
            timeout_secs: default_store_timeout_secs(),
            restore_on_startup: true,
        }
    }
}

impl DatabaseConfig {
    /// Namespace of the group for `instance`.
    pub fn namespace_for(&self, instance: &str) -> String {
        self.namespace_template.replace("{instance}", &instance.to_lowercase())
    }
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}
fn default_namespace_template() -> String {
    DEFAULT_NAMESPACE_TEMPLATE.to_string()
}
fn default_non_finite_sentinel() -> f64 {
    DEFAULT_NON_FINITE_SENTINEL
}
fn default_store_timeout_secs() -> u64 {
    DEFAULT_STORE_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// [logging]
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json, pretty or compact
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
