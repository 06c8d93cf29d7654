//! Agent state management

use std::fmt;

/// Registration state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// No control channel
    Unregistered,
    /// Dialing the broker
    Registering,
    /// Registration sent, serving the control channel
    Active,
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentPhase::Unregistered => "unregistered",
            AgentPhase::Registering => "registering",
            AgentPhase::Active => "active",
        };
        f.write_str(name)
    }
}
