//! Command-line arguments and their merge with the config file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use rhx_core::config::{self, AgentConfig, BrokerConfig, ConfigFile, Role};

/// Reverse tunnel exchange.
///
/// Runs as the agent when both --server and --target are given, otherwise
/// as the broker.
#[derive(Debug, Parser)]
#[command(name = "rh-exchange")]
#[command(about = "Reverse tunnel exchange - expose a service behind NAT through a public broker")]
#[command(version)]
pub struct Cli {
    /// Address the broker listens on [default: :17325]
    #[arg(short, long, env = "RHX_LISTEN")]
    pub listen: Option<String>,

    /// Broker address to dial (agent mode)
    #[arg(short, long, env = "RHX_SERVER")]
    pub server: Option<String>,

    /// Target address to forward tunneled clients to (agent mode)
    #[arg(short, long, env = "RHX_TARGET")]
    pub target: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Verbose output (same as --log-level debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Agent: register again with backoff after losing the broker
    #[arg(long)]
    pub reconnect: bool,

    /// Broker: accept a new agent after the current one disconnects
    #[arg(long)]
    pub readopt_control: bool,
}

/// Fully resolved process settings
#[derive(Debug)]
pub struct Settings {
    pub role: Role,
    pub broker: BrokerConfig,
    pub agent: AgentConfig,
}

impl Cli {
    /// Effective log filter when `RUST_LOG` is unset
    pub fn log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }

    /// Merge flags over the config file and pick the role.
    ///
    /// Agent settings are validated when the agent role is selected.
    pub fn resolve(&self, file: ConfigFile) -> Result<Settings> {
        let ConfigFile {
            mut broker,
            mut agent,
        } = file;

        if let Some(listen) = &self.listen {
            broker.listen_address = listen.clone();
        }
        if let Some(server) = &self.server {
            agent.broker_address = server.clone();
        }
        if let Some(target) = &self.target {
            agent.target_address = target.clone();
        }
        if self.reconnect {
            agent.reconnect = true;
        }
        if self.readopt_control {
            broker.readopt_control = true;
        }

        let role = Role::from_addresses(
            &broker.listen_address,
            Some(agent.broker_address.as_str()),
            Some(agent.target_address.as_str()),
        );
        match &role {
            Role::Broker { listen } => broker.listen_address = listen.clone(),
            Role::Agent { .. } => agent.validate().context("Invalid agent configuration")?,
        }

        Ok(Settings {
            role,
            broker,
            agent,
        })
    }
}

/// Load the config file named on the command line, or the default one if
/// it exists.
///
/// An explicitly named file must load; a broken default file is only
/// warned about.
pub fn load_config_file(path: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if !default_path.exists() {
        return Ok(ConfigFile::default());
    }

    Ok(config::load_config(&default_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
        ConfigFile::default()
    }))
}
