//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker address to dial
    pub broker_address: String,

    /// Local service that tunneled clients are forwarded to
    pub target_address: String,

    /// How often to check whether a heartbeat is due
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Connection timeout for broker and target dials
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Register again after the control channel is lost
    pub reconnect: bool,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_address: String::new(),
            target_address: String::new(),
            heartbeat_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            reconnect: false,
            backoff: BackoffConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Reject delays and factors that cannot produce a usable delay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial.is_zero() {
            return Err(ConfigError::Invalid(
                "backoff.initial must be greater than zero".to_string(),
            ));
        }
        if self.max < self.initial {
            return Err(ConfigError::Invalid(format!(
                "backoff.max ({:?}) is below backoff.initial ({:?})",
                self.max, self.initial
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff.multiplier must be a finite number of at least 1, got {}",
                self.multiplier
            )));
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff.jitter must be between 0 and 1, got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}
