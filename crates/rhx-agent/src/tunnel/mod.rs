//! Control channel to the broker

mod connector;
mod reconnect;

pub use connector::{ActiveTunnel, TunnelConnector};
pub use reconnect::ExponentialBackoff;
