use crate::error::{CoreError, ErrorCode};
use crate::registry::FailoverStrategy;
use serde::Deserialize;
use std::time::Duration;

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_delay_millis() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> i64 {
    -1
}

fn default_prefetch_count() -> u16 {
    10
}

const fn default_true() -> bool {
    true
}

/// Pool-specific settings, embedded in [`Config`].
///
/// A plain `serde::Deserialize` derive with field aliases rather than a
/// dedicated macro system — see `DESIGN.md` for the tradeoff.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(alias = "max_channels")]
    pub max_channels: usize,
    #[serde(alias = "acquire_timeout_ms", with = "humantime_millis")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_channels: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Circuit-breaker settings, embedded in [`Config`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    #[serde(alias = "failure_threshold")]
    pub failure_threshold: u32,
    #[serde(alias = "reset_timeout_ms", with = "humantime_millis")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Cluster/failover settings, embedded in [`Config`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    #[serde(alias = "retry_connect_timeout_ms", with = "humantime_millis")]
    pub retry_connect_timeout: Duration,
    #[serde(alias = "node_recovery_interval_ms", with = "humantime_millis::option")]
    pub node_recovery_interval: Option<Duration>,
    #[serde(alias = "shuffle_nodes")]
    pub shuffle_nodes: bool,
    #[serde(alias = "priority_nodes")]
    pub priority_nodes: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            retry_connect_timeout: Duration::from_secs(5),
            node_recovery_interval: Some(Duration::from_secs(60)),
            shuffle_nodes: false,
            priority_nodes: Vec::new(),
        }
    }
}

/// Channel-recovery settings, embedded in [`Config`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChannelRecoveryConfig {
    #[serde(alias = "max_retries")]
    pub max_retries: u32,
    #[serde(alias = "retry_delay_ms", with = "humantime_millis")]
    pub retry_delay: Duration,
    #[serde(alias = "auto_recovery", default = "default_true")]
    pub auto_recovery: bool,
}

impl Default for ChannelRecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            auto_recovery: true,
        }
    }
}

/// Explicit TLS material, used when connecting with the `amqps` scheme.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    #[serde(alias = "ca_bundle")]
    pub ca_bundle: Option<String>,
    #[serde(alias = "client_cert")]
    pub client_cert: Option<String>,
    #[serde(alias = "client_key")]
    pub client_key: Option<String>,
    #[serde(alias = "key_passphrase")]
    pub key_passphrase: Option<String>,
    #[serde(default = "default_true")]
    pub validate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_bundle: None,
            client_cert: None,
            client_key: None,
            key_passphrase: None,
            validate: true,
        }
    }
}

/// The full, validated configuration for a [`Client`](crate::Client).
///
/// Carries a `serde::Deserialize` impl in a human-oriented style (field
/// aliases, sensible defaults) for embedding applications that load it from
/// their own YAML/JSON, but this crate never loads a file itself —
/// file/CLI/HTTP front-ends are out of scope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// One or more broker URLs. A single URL may be supplied directly in
    /// the source configuration; see [`ConfigBuilder::url`] for the
    /// programmatic equivalent.
    pub urls: Vec<String>,
    #[serde(alias = "heartbeat_secs", default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(alias = "connection_timeout_ms", default = "default_connection_timeout", with = "humantime_millis")]
    pub connection_timeout: Duration,
    #[serde(alias = "reconnect_delay_ms", default = "default_reconnect_delay_millis")]
    pub reconnect_delay_millis: u64,
    #[serde(alias = "max_reconnect_attempts", default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i64,
    #[serde(alias = "exponential_backoff")]
    pub exponential_backoff: bool,
    #[serde(alias = "failover_strategy")]
    pub failover_strategy: FailoverStrategy,
    pub pool: PoolConfig,
    #[serde(alias = "circuit_breaker")]
    pub breaker: BreakerConfig,
    pub cluster: ClusterConfig,
    #[serde(alias = "channel_recovery")]
    pub channel_recovery: ChannelRecoveryConfig,
    #[serde(alias = "prefetch_count", default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(alias = "prefetch_global")]
    pub prefetch_global: bool,
    pub vhost: Option<String>,
    pub tls: TlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            heartbeat_secs: default_heartbeat_secs(),
            connection_timeout: default_connection_timeout(),
            reconnect_delay_millis: default_reconnect_delay_millis(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            exponential_backoff: true,
            failover_strategy: FailoverStrategy::RoundRobin,
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            cluster: ClusterConfig::default(),
            channel_recovery: ChannelRecoveryConfig::default(),
            prefetch_count: default_prefetch_count(),
            prefetch_global: false,
            vhost: None,
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Accepts either a single URL or a list.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls = vec![url.into()];
        self
    }

    /// Validates this configuration: out-of-range values fail construction
    /// rather than being clamped silently.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.urls.is_empty() {
            return Err(CoreError::new(
                ErrorCode::Configuration,
                "at least one broker URL is required",
            ));
        }

        if !(1..=60).contains(&self.heartbeat_secs) {
            return Err(CoreError::new(
                ErrorCode::Configuration,
                "heartbeat must be between 1 and 60 seconds",
            )
            .with_detail("heartbeat_secs", self.heartbeat_secs.to_string()));
        }

        if !(1_000..=60_000).contains(&self.reconnect_delay_millis) {
            return Err(CoreError::new(
                ErrorCode::Configuration,
                "reconnectDelay must be between 1000 and 60000 ms",
            )
            .with_detail("reconnect_delay_millis", self.reconnect_delay_millis.to_string()));
        }

        if self.pool.max_channels < 1 {
            return Err(CoreError::new(
                ErrorCode::Configuration,
                "pool.maxChannels must be at least 1",
            ));
        }

        if self.max_reconnect_attempts < -1 {
            return Err(CoreError::new(
                ErrorCode::Configuration,
                "maxReconnectAttempts must be -1 (unbounded) or a non-negative count",
            ));
        }

        Ok(())
    }

    /// This config's base reconnect delay, as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_millis)
    }
}

/// (De)serializes a [`Duration`] from a plain integer count of milliseconds,
/// the convention used for every duration-shaped field in this config.
mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    /// Same codec for an optional duration, used by fields like
    /// `cluster.nodeRecoveryInterval` that may be left unconfigured.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_invalid_without_urls() {
        // Given
        let config = Config::default();

        // Then
        assert_eq!(
            config.validate().unwrap_err().code(),
            ErrorCode::Configuration
        );
    }

    #[test]
    fn single_url_is_accepted_and_wrapped_into_a_list() {
        // Given
        let config = Config::default().with_url("amqp://localhost:5672");

        // Then
        assert!(config.validate().is_ok());
        assert_eq!(config.urls, vec!["amqp://localhost:5672".to_string()]);
    }

    #[test]
    fn out_of_range_heartbeat_fails_validation() {
        // Given
        let config = Config {
            heartbeat_secs: 0,
            ..Config::default().with_url("amqp://localhost:5672")
        };

        // Then
        assert_eq!(
            config.validate().unwrap_err().code(),
            ErrorCode::Configuration
        );
    }

    #[test]
    fn zero_max_channels_fails_validation() {
        // Given
        let config = Config {
            pool: PoolConfig {
                max_channels: 0,
                ..PoolConfig::default()
            },
            ..Config::default().with_url("amqp://localhost:5672")
        };

        // Then
        assert_eq!(
            config.validate().unwrap_err().code(),
            ErrorCode::Configuration
        );
    }

    #[test]
    fn deserializes_from_yaml_with_aliases() {
        // Given
        let input = r#"
urls:
  - amqp://localhost:5672
heartbeat_secs: 30
pool:
  max_channels: 20
  acquire_timeout_ms: 2000
"#;

        // When
        let config: Config = serde_yml::from_str(input).unwrap();

        // Then
        assert_eq!(config.heartbeat_secs, 30);
        assert_eq!(config.pool.max_channels, 20);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(2000));
    }
}
