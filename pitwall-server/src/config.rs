//! Configuration module
//!
//! Every setting comes from a `PITWALL_*` environment variable and falls back
//! to a default when unset. Values that are set but unparseable are errors.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },

    #[error("{key} must be {requirement}")]
    OutOfRange {
        key: &'static str,
        requirement: &'static str,
    },
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen port
    pub port: u16,

    /// Pause between dispatch ticks
    pub tick_interval: Duration,

    /// Pause after a failed tick
    pub error_backoff: Duration,

    /// Feature vectors kept per driver
    pub history_capacity: usize,

    /// History needed before a driver is scored
    pub min_samples: usize,

    /// |z| above which a feature is anomalous
    pub anomaly_threshold: f64,

    /// Cars in the offline simulation
    pub simulated_drivers: usize,

    /// Ticks between scripted radio lines per simulated driver (0 disables)
    pub radio_every: u64,

    /// Outbound queue depth per subscriber
    pub subscriber_queue: usize,

    /// Consecutive failed deliveries before a subscriber is evicted
    pub max_delivery_failures: u32,

    /// Idle time after which the live ingest source counts as disconnected
    pub live_timeout: Duration,

    /// Queue depth of the live ingest source
    pub ingest_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            tick_interval: Duration::from_millis(100),
            error_backoff: Duration::from_millis(1000),
            history_capacity: 100,
            min_samples: 10,
            anomaly_threshold: 2.5,
            simulated_drivers: 2,
            radio_every: 150,
            subscriber_queue: 256,
            max_delivery_failures: 3,
            live_timeout: Duration::from_millis(5000),
            ingest_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            parse(&lookup, key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let config = Self {
            port: parse(&lookup, "PITWALL_PORT", defaults.port)?,
            tick_interval: millis("PITWALL_TICK_MS", defaults.tick_interval)?,
            error_backoff: millis("PITWALL_ERROR_BACKOFF_MS", defaults.error_backoff)?,
            history_capacity: parse(&lookup, "PITWALL_HISTORY_CAPACITY", defaults.history_capacity)?,
            min_samples: parse(&lookup, "PITWALL_MIN_SAMPLES", defaults.min_samples)?,
            anomaly_threshold: parse(&lookup, "PITWALL_ANOMALY_THRESHOLD", defaults.anomaly_threshold)?,
            simulated_drivers: parse(&lookup, "PITWALL_SIMULATED_DRIVERS", defaults.simulated_drivers)?,
            radio_every: parse(&lookup, "PITWALL_RADIO_EVERY", defaults.radio_every)?,
            subscriber_queue: parse(&lookup, "PITWALL_SUBSCRIBER_QUEUE", defaults.subscriber_queue)?,
            max_delivery_failures: parse(&lookup, "PITWALL_MAX_DELIVERY_FAILURES", defaults.max_delivery_failures)?,
            live_timeout: millis("PITWALL_LIVE_TIMEOUT_MS", defaults.live_timeout)?,
            ingest_capacity: parse(&lookup, "PITWALL_INGEST_CAPACITY", defaults.ingest_capacity)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool, &'static str); 6] = [
            ("PITWALL_TICK_MS", !self.tick_interval.is_zero(), "greater than 0"),
            ("PITWALL_HISTORY_CAPACITY", self.history_capacity > 0, "greater than 0"),
            (
                "PITWALL_MIN_SAMPLES",
                (1..=self.history_capacity).contains(&self.min_samples),
                "between 1 and the history capacity",
            ),
            (
                "PITWALL_ANOMALY_THRESHOLD",
                self.anomaly_threshold.is_finite() && self.anomaly_threshold > 0.0,
                "a positive number",
            ),
            ("PITWALL_SUBSCRIBER_QUEUE", self.subscriber_queue > 0, "greater than 0"),
            ("PITWALL_INGEST_CAPACITY", self.ingest_capacity > 0, "greater than 0"),
        ];

        match checks.into_iter().find(|(_, ok, _)| !ok) {
            Some((key, _, requirement)) => Err(ConfigError::OutOfRange { key, requirement }),
            None => Ok(()),
        }
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
