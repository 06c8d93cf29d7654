//! Broker configuration

use serde::{Deserialize, Serialize};

/// Default listen address of the broker
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:17325";

/// Configuration for the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address to accept the agent and external clients on
    pub listen_address: String,

    /// Adopt a new control channel after the current one dies.
    ///
    /// Off by default: the first accepted connection is the control channel
    /// for the life of the process.
    pub readopt_control: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            readopt_control: false,
        }
    }
}

impl BrokerConfig {
    /// Listen address in a form the socket layer accepts
    pub fn bind_address(&self) -> String {
        normalize_listen_address(&self.listen_address)
    }
}

/// Expand a host-less listen address (`:17325`) to all interfaces.
pub fn normalize_listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}
