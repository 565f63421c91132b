//! Connection pool configuration.
//!
//! A [`ConnectionPoolConfig`] is built once at startup (from defaults, a YAML
//! file, or the builder methods below) and never mutated afterwards; the pool
//! keeps its own copy.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default ceiling on concurrently held connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;
/// Default ceiling on concurrently held connections to one host.
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 5;
/// Default total timeout for one attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default ceiling on consecutive 429 waits for one logical request.
pub const DEFAULT_MAX_RATE_LIMIT_WAITS: u32 = 5;
/// Default size of the per-stream buffer (1 MiB).
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 1024 * 1024;

/// Settings for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Maximum connections held at once across all hosts.
    pub max_connections: usize,
    /// Maximum connections held at once to a single host.
    pub max_connections_per_host: usize,
    /// Total timeout for one attempt; connect and read each get a third.
    #[serde(with = "crate::utils::seconds")]
    pub timeout: Duration,
    /// Retries allowed after the first attempt for transport and 5xx failures.
    pub max_retries: u32,
    /// Requests allowed in any trailing 60 seconds.
    pub max_requests_per_minute: u32,
    /// Requests allowed in any trailing hour.
    pub max_requests_per_hour: u32,
    /// Requests allowed in any trailing 24 hours.
    pub max_requests_per_day: u32,
    /// Base of the exponential backoff.
    pub backoff_factor: f64,
    /// Ceiling on a single backoff delay.
    #[serde(with = "crate::utils::seconds")]
    pub max_backoff: Duration,
    /// Consecutive 429 responses tolerated for one request before giving up.
    pub max_rate_limit_waits: u32,
    /// Byte ceiling for one streamed response body.
    pub stream_buffer_size: usize,
}

impl ConnectionPoolConfig {
    /// Creates a configuration with the default values.
    ///
    /// Defaults:
    /// - 10 connections, 5 per host
    /// - 30 second timeout, 3 retries
    /// - 60/minute, 3600/hour, 50000/day
    /// - backoff factor 1.5, capped at 300 seconds
    pub fn new() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            max_requests_per_minute: 60,
            max_requests_per_hour: 3600,
            max_requests_per_day: 50_000,
            backoff_factor: 1.5,
            max_backoff: Duration::from_secs(300),
            max_rate_limit_waits: DEFAULT_MAX_RATE_LIMIT_WAITS,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
        }
    }

    /// Parses a configuration from YAML; omitted keys keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("could not read {}: {e}", path.display()), e))?;
        Self::from_yaml(&yaml)
    }

    /// Checks the settings for values the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::config(
                "must allow at least one connection",
                Some("max_connections".to_string()),
            ));
        }
        if self.max_connections_per_host == 0 {
            return Err(Error::config(
                "must allow at least one connection per host",
                Some("max_connections_per_host".to_string()),
            ));
        }
        if self.max_connections_per_host > self.max_connections {
            return Err(Error::config(
                "per-host ceiling exceeds the total ceiling",
                Some("max_connections_per_host".to_string()),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::config(
                "timeout must be positive",
                Some("timeout".to_string()),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(Error::config(
                "backoff factor must be at least 1.0",
                Some("backoff_factor".to_string()),
            ));
        }
        for (name, value) in [
            ("max_requests_per_minute", self.max_requests_per_minute),
            ("max_requests_per_hour", self.max_requests_per_hour),
            ("max_requests_per_day", self.max_requests_per_day),
        ] {
            if value == 0 {
                return Err(Error::config(
                    "rate ceiling must be positive",
                    Some(name.to_string()),
                ));
            }
        }
        if self.stream_buffer_size == 0 {
            return Err(Error::config(
                "stream buffer must hold at least one byte",
                Some("stream_buffer_size".to_string()),
            ));
        }
        Ok(())
    }

    /// Timeout for establishing a connection.
    pub fn connect_timeout(&self) -> Duration {
        self.timeout / 3
    }

    /// Timeout for a single socket read.
    pub fn read_timeout(&self) -> Duration {
        self.timeout / 3
    }

    /// Sets the total and per-host connection ceilings.
    pub fn with_connections(mut self, max_connections: usize, per_host: usize) -> Self {
        self.max_connections = max_connections;
        self.max_connections_per_host = per_host;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the number of retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the minute, hour and day request ceilings.
    pub fn with_rate_limits(mut self, per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        self.max_requests_per_minute = per_minute;
        self.max_requests_per_hour = per_hour;
        self.max_requests_per_day = per_day;
        self
    }

    /// Sets the exponential backoff base and its ceiling.
    pub fn with_backoff(mut self, factor: f64, max_backoff: Duration) -> Self {
        self.backoff_factor = factor;
        self.max_backoff = max_backoff;
        self
    }

    /// Sets how many consecutive 429 responses one request tolerates.
    pub fn with_max_rate_limit_waits(mut self, waits: u32) -> Self {
        self.max_rate_limit_waits = waits;
        self
    }

    /// Sets the byte ceiling for streamed bodies.
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
