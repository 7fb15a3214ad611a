//! Process-level configuration.
//!
//! One [`CheckpointConfig`] is built at startup, from the environment or
//! programmatically, and selects the checkpointing strategy once; components
//! never re-branch on environment state. Intervals must be positive;
//! validation happens in [`CheckpointConfig::validate`] and on
//! [`CheckpointConfig::from_env`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Strategy selector was not a recognized value.
    #[error("invalid checkpoint strategy: {0}")]
    InvalidStrategy(String),
    /// A variable could not be parsed.
    #[error("invalid value for {var}: {value}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// An interval or limit must be positive.
    #[error("{var} must be positive")]
    NotPositive {
        /// Variable name.
        var: &'static str,
    },
}

/// Which checkpointing protocol the process runs. Selected once at startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointStrategy {
    /// Global barrier epochs driven by the coordinator.
    Coordinated,
    /// Independent, locally-timed snapshots per worker.
    Uncoordinated,
}

impl FromStr for CheckpointStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COORDINATED" => Ok(Self::Coordinated),
            "UNCOORDINATED" => Ok(Self::Uncoordinated),
            other => Err(ConfigError::InvalidStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for CheckpointStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinated => write!(f, "COORDINATED"),
            Self::Uncoordinated => write!(f, "UNCOORDINATED"),
        }
    }
}

/// Connection parameters for the external blob-store backend.
#[derive(Clone, Debug)]
pub struct BlobStoreConfig {
    /// Store host.
    pub host: String,
    /// Store port.
    pub port: u16,
    /// Access key / user.
    pub access_key: String,
    /// Secret key / password.
    pub secret_key: String,
    /// Bucket or container holding snapshot objects.
    pub bucket: String,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            access_key: String::new(),
            secret_key: String::new(),
            bucket: "snapweave-snapshots".to_string(),
        }
    }
}

/// Process-level checkpointing configuration.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Which protocol to run.
    pub strategy: CheckpointStrategy,
    /// Snapshot cadence: epoch trigger period (coordinated) or local timer
    /// interval (uncoordinated).
    pub snapshot_frequency: Duration,
    /// Compaction pass interval.
    pub compaction_interval: Duration,
    /// Silence limit after which a worker is declared dead.
    pub heartbeat_timeout: Duration,
    /// Liveness scan interval.
    pub heartbeat_check_interval: Duration,
    /// Blob-store connection parameters.
    pub blob_store: BlobStoreConfig,
    /// Event-log broker address.
    pub event_log_url: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            strategy: CheckpointStrategy::Coordinated,
            snapshot_frequency: Duration::from_secs(10),
            compaction_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_millis(5000),
            heartbeat_check_interval: Duration::from_millis(1000),
            blob_store: BlobStoreConfig::default(),
            event_log_url: "localhost:9092".to_string(),
        }
    }
}

impl CheckpointConfig {
    /// Sets the strategy.
    pub fn with_strategy(mut self, strategy: CheckpointStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the snapshot cadence.
    pub fn with_snapshot_frequency(mut self, d: Duration) -> Self {
        self.snapshot_frequency = d;
        self
    }

    /// Sets the compaction interval.
    pub fn with_compaction_interval(mut self, d: Duration) -> Self {
        self.compaction_interval = d;
        self
    }

    /// Sets the heartbeat silence limit.
    pub fn with_heartbeat_timeout(mut self, d: Duration) -> Self {
        self.heartbeat_timeout = d;
        self
    }

    /// Sets the liveness scan interval.
    pub fn with_heartbeat_check_interval(mut self, d: Duration) -> Self {
        self.heartbeat_check_interval = d;
        self
    }

    /// Checks that every interval is positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_frequency.is_zero() {
            return Err(ConfigError::NotPositive {
                var: "SNAPSHOT_FREQUENCY_SEC",
            });
        }
        if self.compaction_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                var: "COMPACTION_INTERVAL_SEC",
            });
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::NotPositive {
                var: "HEARTBEAT_TIMEOUT_MS",
            });
        }
        if self.heartbeat_check_interval.is_zero() {
            return Err(ConfigError::NotPositive {
                var: "HEARTBEAT_CHECK_INTERVAL_MS",
            });
        }
        Ok(())
    }

    /// Builds a config from the process environment, validating it.
    ///
    /// Recognized variables: `CHECKPOINT_STRATEGY`, `SNAPSHOT_FREQUENCY_SEC`,
    /// `COMPACTION_INTERVAL_SEC`, `HEARTBEAT_TIMEOUT_MS`,
    /// `HEARTBEAT_CHECK_INTERVAL_MS`, `BLOB_STORE_HOST`, `BLOB_STORE_PORT`,
    /// `BLOB_STORE_ACCESS_KEY`, `BLOB_STORE_SECRET_KEY`, `SNAPSHOT_BUCKET`,
    /// `EVENT_LOG_URL`. Unset variables fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            strategy: match std::env::var("CHECKPOINT_STRATEGY") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.strategy,
            },
            snapshot_frequency: env_secs("SNAPSHOT_FREQUENCY_SEC", defaults.snapshot_frequency)?,
            compaction_interval: env_secs("COMPACTION_INTERVAL_SEC", defaults.compaction_interval)?,
            heartbeat_timeout: env_millis("HEARTBEAT_TIMEOUT_MS", defaults.heartbeat_timeout)?,
            heartbeat_check_interval: env_millis(
                "HEARTBEAT_CHECK_INTERVAL_MS",
                defaults.heartbeat_check_interval,
            )?,
            blob_store: BlobStoreConfig {
                host: env_string("BLOB_STORE_HOST", defaults.blob_store.host),
                port: env_parse("BLOB_STORE_PORT", defaults.blob_store.port)?,
                access_key: env_string("BLOB_STORE_ACCESS_KEY", defaults.blob_store.access_key),
                secret_key: env_string("BLOB_STORE_SECRET_KEY", defaults.blob_store.secret_key),
                bucket: env_string("SNAPSHOT_BUCKET", defaults.blob_store.bucket),
            },
            event_log_url: env_string("EVENT_LOG_URL", defaults.event_log_url),
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_string(var: &'static str, default: String) -> String {
    std::env::var(var).unwrap_or(default)
}

fn env_parse<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(s) => s.parse().map_err(|_| ConfigError::Invalid { var, value: s }),
        Err(_) => Ok(default),
    }
}

fn env_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(
        var,
        default.as_secs(),
    )?))
}

fn env_millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(env_parse(
        var,
        default.as_millis() as u64,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_exact_values() {
        assert_eq!(
            "COORDINATED".parse::<CheckpointStrategy>().unwrap(),
            CheckpointStrategy::Coordinated
        );
        assert_eq!(
            "UNCOORDINATED".parse::<CheckpointStrategy>().unwrap(),
            CheckpointStrategy::Uncoordinated
        );
        assert!("coordinated".parse::<CheckpointStrategy>().is_err());
        assert!("EVENTUAL".parse::<CheckpointStrategy>().is_err());
    }

    #[test]
    fn strategy_display_round_trips() {
        for strategy in [CheckpointStrategy::Coordinated, CheckpointStrategy::Uncoordinated] {
            assert_eq!(
                strategy.to_string().parse::<CheckpointStrategy>().unwrap(),
                strategy
            );
        }
    }

    #[test]
    fn default_config_validates() {
        CheckpointConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = CheckpointConfig::default().with_snapshot_frequency(Duration::ZERO);
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::NotPositive {
                var: "SNAPSHOT_FREQUENCY_SEC"
            }
        ));

        let config = CheckpointConfig::default().with_heartbeat_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::NotPositive {
                var: "HEARTBEAT_TIMEOUT_MS"
            }
        ));
    }

    #[test]
    fn builders_override_defaults() {
        let config = CheckpointConfig::default()
            .with_strategy(CheckpointStrategy::Uncoordinated)
            .with_snapshot_frequency(Duration::from_secs(5))
            .with_compaction_interval(Duration::from_secs(30))
            .with_heartbeat_timeout(Duration::from_millis(2500))
            .with_heartbeat_check_interval(Duration::from_millis(500));
        assert_eq!(config.strategy, CheckpointStrategy::Uncoordinated);
        assert_eq!(config.snapshot_frequency, Duration::from_secs(5));
        assert_eq!(config.compaction_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(2500));
        assert_eq!(config.heartbeat_check_interval, Duration::from_millis(500));
        config.validate().unwrap();
    }
}
