//! rhx-broker: Public side of the rh-exchange reverse tunnel
//!
//! The broker listens on one address for everything. The first connection
//! it accepts is the agent's control channel; every later connection is an
//! external client whose bytes are relayed to the agent over that channel.

pub mod server;
pub mod state;

pub use server::BrokerServer;
pub use state::{BrokerState, ControlSlot};
