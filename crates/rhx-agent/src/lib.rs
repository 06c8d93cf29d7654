//! rhx-agent: Agent side of the rh-exchange reverse tunnel
//!
//! The agent runs next to a service that is not publicly reachable. It
//! dials the broker, registers the address it forwards to, and then serves
//! the broker's commands: for every external client the broker announces,
//! it dials the target and relays bytes in both directions over the one
//! control channel.

pub mod agent;
pub mod heartbeat;
pub mod state;
pub mod tunnel;

pub use agent::Agent;
pub use rhx_core::ControlLoopEnd;
pub use state::AgentPhase;
