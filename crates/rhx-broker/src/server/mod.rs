//! Broker server
//!
//! Accept loop plus the two kinds of connection tasks it spawns.

mod client;
mod control;
mod listener;

pub use listener::BrokerServer;
