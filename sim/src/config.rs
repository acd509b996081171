//! Configuration management for the simulation.

use std::env;
use std::time::Duration;

/// Simulation configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Identifier of the simulated collection
    pub collection: String,
    /// Delay before the loopback backend answers a persistence call
    pub latency: Duration,
    /// Reject every Nth persistence call; 0 never rejects
    pub fail_every: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let collection = lookup("TANDEM_COLLECTION").unwrap_or_else(|| "todos".to_string());

        let latency = lookup("TANDEM_LATENCY_MS")
            .unwrap_or_else(|| "50".to_string())
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidLatency)?;

        let fail_every = lookup("TANDEM_FAIL_EVERY")
            .unwrap_or_else(|| "0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidFailEvery)?;

        Ok(Self {
            collection,
            latency,
            fail_every,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid TANDEM_LATENCY_MS value")]
    InvalidLatency,

    #[error("Invalid TANDEM_FAIL_EVERY value")]
    InvalidFailEvery,
}
