//! Agent configuration.
//!
//! Defines the on-disk configuration for the agent and the managed proxy,
//! loaded from a TOML file with per-field defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BackoffConfig;

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Path to the proxy binary to supervise.
    #[serde(default = "default_proxy_binary")]
    pub proxy_binary: PathBuf,

    /// Scratch directory for materialized configuration files.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Service cluster label passed to the proxy.
    #[serde(default = "default_service_cluster")]
    pub service_cluster: String,

    /// Service node label passed to the proxy.
    #[serde(default = "default_service_node")]
    pub service_node: String,

    /// Time an epoch must stay running before an exit is classified as a
    /// crash rather than a startup failure. Also the point at which the
    /// retry budget replenishes.
    #[serde(default = "default_stabilization_delay")]
    #[serde(with = "humantime_serde")]
    pub stabilization_delay: Duration,

    /// Reconcile rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Number of consecutive transient failures tolerated before the agent
    /// surfaces a fatal error.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Window over which retry-budget consumption is counted.
    #[serde(default = "default_retry_window")]
    #[serde(with = "humantime_serde")]
    pub retry_window: Duration,

    /// Back-off applied between scheduled retries.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Proxy-facing settings handed through to the generated bootstrap.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Token-bucket parameters for reconcile gating.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Maximum burst of reconciles.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

/// Settings that shape the proxy bootstrap and its command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// UDP sink for proxy metrics, e.g. `10.0.0.5:9125`. Omitted from the
    /// bootstrap when unset.
    #[serde(default)]
    pub statsd_address: Option<String>,

    /// TCP port for the proxy's own admin API.
    #[serde(default = "default_admin_port")]
    pub proxy_admin_port: u16,

    /// `host:port` of the upstream discovery service.
    #[serde(default = "default_discovery_address")]
    pub discovery_address: String,

    /// Polling cadence hint for the proxy's discovery subscriptions.
    #[serde(default = "default_discovery_refresh_delay")]
    #[serde(with = "humantime_serde")]
    pub discovery_refresh_delay: Duration,

    /// Upstream dial deadline.
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long a draining epoch tolerates in-flight connections.
    #[serde(default = "default_drain_duration")]
    #[serde(with = "humantime_serde")]
    pub drain_duration: Duration,

    /// Ceiling on graceful stop before the agent force-kills an epoch.
    #[serde(default = "default_parent_shutdown_duration")]
    #[serde(with = "humantime_serde")]
    pub parent_shutdown_duration: Duration,

    /// Authentication policy for inbound listeners.
    #[serde(default)]
    pub auth_policy: AuthPolicy,

    /// Directory holding credentials when `auth_policy` is `mutual_tls`.
    #[serde(default = "default_auth_certs_path")]
    pub auth_certs_path: PathBuf,
}

/// Authentication policy for the generated listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    /// No transport authentication.
    #[default]
    None,

    /// Mutual TLS with certificates from `auth_certs_path`.
    MutualTls,
}

fn default_proxy_binary() -> PathBuf {
    PathBuf::from("envoy")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/tmp/drover")
}

fn default_service_cluster() -> String {
    "drover".to_string()
}

fn default_service_node() -> String {
    "sidecar".to_string()
}

const fn default_stabilization_delay() -> Duration {
    Duration::from_secs(10)
}

const fn default_rate() -> f64 {
    1.0
}

const fn default_burst() -> u32 {
    10
}

const fn default_retry_budget() -> u32 {
    10
}

const fn default_retry_window() -> Duration {
    Duration::from_secs(120)
}

const fn default_admin_port() -> u16 {
    15000
}

fn default_discovery_address() -> String {
    "localhost:15003".to_string()
}

const fn default_discovery_refresh_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_drain_duration() -> Duration {
    Duration::from_secs(45)
}

const fn default_parent_shutdown_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_auth_certs_path() -> PathBuf {
    PathBuf::from("/etc/certs")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_binary: default_proxy_binary(),
            scratch_dir: default_scratch_dir(),
            service_cluster: default_service_cluster(),
            service_node: default_service_node(),
            stabilization_delay: default_stabilization_delay(),
            rate_limit: RateLimitConfig::default(),
            retry_budget: default_retry_budget(),
            retry_window: default_retry_window(),
            backoff: BackoffConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            burst: default_burst(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            statsd_address: None,
            proxy_admin_port: default_admin_port(),
            discovery_address: default_discovery_address(),
            discovery_refresh_delay: default_discovery_refresh_delay(),
            connect_timeout: default_connect_timeout(),
            drain_duration: default_drain_duration(),
            parent_shutdown_duration: default_parent_shutdown_duration(),
            auth_policy: AuthPolicy::default(),
            auth_certs_path: default_auth_certs_path(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.rate <= 0.0 || !self.rate_limit.rate.is_finite() {
            return Err(ConfigError::Invalid(
                "rate_limit.rate must be a positive number".to_string(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.burst must be at least 1".to_string(),
            ));
        }
        if self.retry_budget == 0 {
            return Err(ConfigError::Invalid(
                "retry_budget must be at least 1".to_string(),
            ));
        }
        if self.proxy.drain_duration > self.proxy.parent_shutdown_duration {
            return Err(ConfigError::Invalid(
                "drain_duration must not exceed parent_shutdown_duration".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}


mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
