//! Process role selection

use std::fmt;

use super::broker::normalize_listen_address;

/// What this process runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accept the agent and external clients
    Broker {
        /// Address to listen on
        listen: String,
    },
    /// Dial the broker and forward to a local target
    Agent {
        /// Broker address to dial
        broker: String,
        /// Target address to forward to
        target: String,
    },
}

impl Role {
    /// Pick the role from the three process addresses.
    ///
    /// Agent mode needs both a broker and a target address; anything else
    /// runs the broker. Empty strings count as absent.
    pub fn from_addresses(listen: &str, broker: Option<&str>, target: Option<&str>) -> Self {
        let present = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);

        match (present(broker), present(target)) {
            (Some(broker), Some(target)) => Role::Agent { broker, target },
            _ => Role::Broker {
                listen: normalize_listen_address(listen),
            },
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Broker { .. } => write!(f, "broker"),
            Role::Agent { .. } => write!(f, "agent"),
        }
    }
}
