//! Configuration management for rh-exchange

mod agent;
mod broker;
mod role;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig};
pub use broker::{normalize_listen_address, BrokerConfig};
pub use role::Role;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Contents of a configuration file
///
/// ```toml
/// [broker]
/// listen_address = "0.0.0.0:17325"
///
/// [agent]
/// broker_address = "relay.example.com:17325"
/// target_address = "127.0.0.1:22"
/// heartbeat_interval = 10
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Broker settings
    pub broker: BrokerConfig,
    /// Agent settings
    pub agent: AgentConfig,
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rh-exchange")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
