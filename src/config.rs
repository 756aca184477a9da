//! Configuration management for Turnstile.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{KeySource, RateSpec};

/// Prefix for environment overrides, e.g. `TURNSTILE__ADMISSION__RATE=5`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,

    /// Prometheus scrape listener; null disables metrics
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_metrics_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from(([127, 0, 0, 1], 9090)))
}

/// How the retry hint on a rejection is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryHintMode {
    /// Always `retry_after_secs`
    #[default]
    Fixed,
    /// Derived from the client's bucket
    Computed,
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Tokens added per second, per key
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket capacity; zero or less means 1
    #[serde(default = "default_burst")]
    pub burst: i64,

    /// Where the client key comes from
    #[serde(default)]
    pub key: KeySource,

    #[serde(default)]
    pub retry_hint: RetryHintMode,

    /// Hint sent with `Fixed` retry hints
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,

    /// Evict buckets idle for this long. Unset keeps every bucket forever.
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,

    /// How often the idle sweeper runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            burst: default_burst(),
            key: KeySource::default(),
            retry_hint: RetryHintMode::default(),
            retry_after_secs: default_retry_after(),
            idle_ttl_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_rate() -> f64 {
    10.0
}

fn default_burst() -> i64 {
    20
}

fn default_retry_after() -> u64 {
    1
}

fn default_sweep_interval() -> u64 {
    60
}

impl AdmissionConfig {
    /// The bucket spec, with the burst default applied.
    pub fn rate_spec(&self) -> Result<RateSpec> {
        RateSpec::new(self.rate, self.burst)
    }

    /// Idle TTL and sweep interval, when eviction is enabled.
    pub fn eviction(&self) -> Result<Option<(Duration, Duration)>> {
        match self.idle_ttl_secs {
            None => Ok(None),
            Some(0) => Err(TurnstileError::Config("idle_ttl_secs must be positive".to_string())),
            Some(_) if self.sweep_interval_secs == 0 => Err(TurnstileError::Config(
                "sweep_interval_secs must be positive".to_string(),
            )),
            Some(ttl) => Ok(Some((
                Duration::from_secs(ttl),
                Duration::from_secs(self.sweep_interval_secs),
            ))),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file plus environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<TurnstileConfig>()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<TurnstileConfig>()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde alone cannot.
    pub fn validate(&self) -> Result<()> {
        self.admission.rate_spec()?;
        self.admission.eviction()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();

        assert_eq!(config.server.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.server.metrics_addr, Some("127.0.0.1:9090".parse().unwrap()));
        assert_eq!(config.admission.rate, 10.0);
        assert_eq!(config.admission.burst, 20);
        assert_eq!(config.admission.key, KeySource::RealIp);
        assert_eq!(config.admission.retry_hint, RetryHintMode::Fixed);
        assert_eq!(config.admission.retry_after_secs, 1);
        assert_eq!(config.admission.idle_ttl_secs, None);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Text);
    }

    #[test]
    fn test_from_yaml_overrides() {
        let yaml = r#"
server:
  addr: "0.0.0.0:9000"
admission:
  rate: 2.5
  burst: 4
  key:
    type: header
    name: x-api-key
  retry_hint: computed
  idle_ttl_secs: 300
log:
  level: debug
  format: json
"#;

        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.admission.rate, 2.5);
        assert_eq!(config.admission.burst, 4);
        assert_eq!(
            config.admission.key,
            KeySource::Header {
                name: "x-api-key".to_string()
            }
        );
        assert_eq!(config.admission.retry_hint, RetryHintMode::Computed);
        assert_eq!(
            config.admission.eviction().unwrap(),
            Some((Duration::from_secs(300), Duration::from_secs(60)))
        );
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = TurnstileConfig::from_yaml("admission:\n  rate: 1\n").unwrap();

        assert_eq!(config.admission.rate, 1.0);
        assert_eq!(config.admission.burst, 20);
        assert_eq!(config.server.addr, default_addr());
    }

    #[test]
    fn test_non_positive_burst_defaults_to_one() {
        let config = TurnstileConfig::from_yaml("admission:\n  burst: 0\n").unwrap();
        assert_eq!(config.admission.rate_spec().unwrap().burst, 1);

        let config = TurnstileConfig::from_yaml("admission:\n  burst: -3\n").unwrap();
        assert_eq!(config.admission.rate_spec().unwrap().burst, 1);
    }

    #[test]
    fn test_zero_rate_rejected() {
        let result = TurnstileConfig::from_yaml("admission:\n  rate: 0\n");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_metrics_listener_can_be_disabled() {
        let config = TurnstileConfig::from_yaml("server:\n  metrics_addr: ~\n").unwrap();
        assert_eq!(config.server.metrics_addr, None);
    }

    #[test]
    fn test_env_overrides_burst() {
        std::env::set_var("TURNSTILE__ADMISSION__BURST", "7");
        let result = TurnstileConfig::load(None);
        std::env::remove_var("TURNSTILE__ADMISSION__BURST");

        let config = result.unwrap();
        assert_eq!(config.admission.burst, 7);
        assert_eq!(config.admission.rate, 10.0);
    }

    #[test]
    fn test_zero_idle_ttl_rejected() {
        let result = TurnstileConfig::from_yaml("admission:\n  idle_ttl_secs: 0\n");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }
}
