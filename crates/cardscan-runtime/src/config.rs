//! Runtime configuration.
//!
//! Loaded from YAML or JSON. Durations are written in human-readable form
//! (`"30s"`, `"250ms"`, `"1m"`).
//!
//! ```yaml
//! resilience:
//!   breaker:
//!     failure_threshold: 5
//!     recovery_timeout: 60s
//!   dependencies:
//!     ml_identification:
//!       retry:
//!         max_attempts: 3
//!         base_delay: 1s
//!         max_delay: 10s
//!         backoff_factor: 2.0
//!         attempt_timeout: 15s
//!   offline_queue:
//!     max_retries: 3
//!     path: /var/lib/cardscan/offline-queue.json
//! limits:
//!   max_bytes: 10485760
//! ```

use cardscan_core::ScanLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::resilience::CircuitBreakerConfig;

/// Dependency name for the card detection pass.
pub const CARD_DETECTION: &str = "card_detection";

/// Dependency name for the ML identification call.
pub const ML_IDENTIFICATION: &str = "ml_identification";

/// Dependency name for persisting scan analytics.
pub const ANALYTICS_WRITE: &str = "analytics_write";

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retry settings for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySettings {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_duration")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_duration")]
    pub max_delay: Duration,

    /// Multiplier applied per retry
    pub backoff_factor: f64,

    /// Timeout applied to each individual attempt
    #[serde(default, with = "humantime_duration::option")]
    pub attempt_timeout: Option<Duration>,
}

impl RetrySettings {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_factor,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: retry.max_attempts must be at least 1",
                scope
            )));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "{}: retry.backoff_factor must be >= 1.0",
                scope
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::Invalid(format!(
                "{}: retry.max_delay must not be smaller than retry.base_delay",
                scope
            )));
        }
        Ok(())
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60), 2.0)
            .with_attempt_timeout(Duration::from_secs(10))
    }
}

/// Per-dependency overrides. Unset sections fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DependencySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker: Option<CircuitBreakerConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
}

/// Offline action queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSettings {
    /// Failed replays tolerated before an action is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Snapshot file; the queue is memory-only when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            path: None,
        }
    }
}

/// Background health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSettings {
    #[serde(default = "default_interval", with = "humantime_duration")]
    pub interval: Duration,

    #[serde(default = "default_probe_timeout", with = "humantime_duration")]
    pub probe_timeout: Duration,
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// Configuration of the resilience layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResilienceConfig {
    /// Breaker settings for dependencies without an override
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    /// Retry settings for dependencies without an override
    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default = "default_dependencies")]
    pub dependencies: BTreeMap<String, DependencySettings>,

    #[serde(default)]
    pub offline_queue: QueueSettings,

    #[serde(default)]
    pub health: HealthSettings,
}

fn default_dependencies() -> BTreeMap<String, DependencySettings> {
    let mut dependencies = BTreeMap::new();
    dependencies.insert(
        ML_IDENTIFICATION.to_string(),
        DependencySettings {
            breaker: None,
            retry: Some(
                RetrySettings::new(3, Duration::from_secs(1), Duration::from_secs(10), 2.0)
                    .with_attempt_timeout(Duration::from_secs(15)),
            ),
        },
    );
    dependencies.insert(
        ANALYTICS_WRITE.to_string(),
        DependencySettings {
            breaker: None,
            retry: Some(
                RetrySettings::new(5, Duration::from_millis(500), Duration::from_secs(30), 1.5)
                    .with_attempt_timeout(Duration::from_secs(5)),
            ),
        },
    );
    dependencies.insert(
        CARD_DETECTION.to_string(),
        DependencySettings {
            breaker: None,
            retry: Some(
                RetrySettings::new(2, Duration::from_millis(100), Duration::from_secs(5), 2.0)
                    .with_attempt_timeout(Duration::from_secs(5)),
            ),
        },
    );
    dependencies
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            retry: RetrySettings::default(),
            dependencies: default_dependencies(),
            offline_queue: QueueSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

impl ResilienceConfig {
    /// Breaker settings for a dependency.
    pub fn breaker_for(&self, dependency: &str) -> CircuitBreakerConfig {
        self.dependencies
            .get(dependency)
            .and_then(|d| d.breaker.clone())
            .unwrap_or_else(|| self.breaker.clone())
    }

    /// Retry settings for a dependency.
    pub fn retry_for(&self, dependency: &str) -> RetrySettings {
        self.dependencies
            .get(dependency)
            .and_then(|d| d.retry.clone())
            .unwrap_or_else(|| self.retry.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate("breaker")?;
        self.retry.validate("default")?;
        for (name, settings) in &self.dependencies {
            if let Some(breaker) = &settings.breaker {
                breaker.validate(name)?;
            }
            if let Some(retry) = &settings.retry {
                retry.validate(name)?;
            }
        }
        if self.offline_queue.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "offline_queue.max_retries must be at least 1".to_string(),
            ));
        }
        if self.health.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health.interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Identification cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    #[serde(default = "default_ttl", with = "humantime_duration")]
    pub ttl: Duration,
}

fn default_capacity() -> u64 {
    1000
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl: default_ttl(),
        }
    }
}

/// Top-level configuration for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub limits: ScanLimits,

    #[serde(default)]
    pub cache: CacheSettings,
}

impl RuntimeConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file; `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resilience.validate()?;
        if self.limits.allowed_types.is_empty() {
            return Err(ConfigError::Invalid(
                "limits.allowed_types must not be empty".to_string(),
            ));
        }
        if self.limits.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter for durations written as `"30s"`, `"1m 30s"`, `"250ms"`.
pub(crate) mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

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
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let text: Option<String> = Option::deserialize(deserializer)?;
            text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());

        let ml = config.resilience.retry_for(ML_IDENTIFICATION);
        assert_eq!(ml.max_attempts, 3);
        assert_eq!(ml.max_delay, Duration::from_secs(10));

        let db = config.resilience.retry_for(ANALYTICS_WRITE);
        assert_eq!(db.max_attempts, 5);
        assert_eq!(db.backoff_factor, 1.5);

        // Unknown dependencies use the defaults
        let other = config.resilience.retry_for("cloud_sync");
        assert_eq!(other, RetrySettings::default());
        assert_eq!(config.resilience.breaker_for("cloud_sync").failure_threshold, 5);
    }

    #[test]
    fn test_parse_yaml_with_human_durations() {
        let yaml = r#"
resilience:
  breaker:
    failure_threshold: 2
    recovery_timeout: 30s
  dependencies:
    ml_identification:
      retry:
        max_attempts: 4
        base_delay: 250ms
        max_delay: 2s
        backoff_factor: 2.0
        attempt_timeout: 5s
  offline_queue:
    max_retries: 5
    path: /tmp/queue.json
limits:
  max_bytes: 1024
cache:
  ttl: 10m
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.resilience.breaker.failure_threshold, 2);
        assert_eq!(config.resilience.breaker.recovery_timeout, Duration::from_secs(30));

        let ml = config.resilience.retry_for(ML_IDENTIFICATION);
        assert_eq!(ml.base_delay, Duration::from_millis(250));
        assert_eq!(ml.attempt_timeout, Some(Duration::from_secs(5)));

        assert_eq!(config.resilience.offline_queue.max_retries, 5);
        assert_eq!(config.limits.max_bytes, 1024);
        assert_eq!(config.limits.allowed_types.len(), 4);
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let yaml = r#"
resilience:
  retry:
    max_attempts: 0
    base_delay: 1s
    max_delay: 2s
    backoff_factor: 2.0
"#;
        assert!(matches!(
            RuntimeConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let mut config = RuntimeConfig::default();
        config.resilience.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_duration() {
        let yaml = r#"
resilience:
  health:
    interval: soon
"#;
        assert!(matches!(
            RuntimeConfig::from_yaml(yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip_of_defaults() {
        let config = RuntimeConfig::default();
        let yaml = config.to_yaml().unwrap();
        let parsed = RuntimeConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
