//! Outbound connector to the broker
//!
//! Dials the broker and announces the target address. Registration is
//! fire-and-forget: the broker never answers, so the tunnel counts as
//! active as soon as the `AgentRegister` frame is written.

use std::sync::Arc;

use rhx_core::{control_channel, ActivityFlag, ControlReader, ControlSender, Dialer, TunnelError};
use rhx_protocol::Message;

/// Dials the broker and registers the agent
pub struct TunnelConnector {
    broker_address: String,
    target_address: String,
    dialer: Arc<dyn Dialer>,
}

impl TunnelConnector {
    /// Create a new tunnel connector
    pub fn new(
        broker_address: impl Into<String>,
        target_address: impl Into<String>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            broker_address: broker_address.into(),
            target_address: target_address.into(),
            dialer,
        }
    }

    /// Broker this connector dials
    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    /// Dial the broker once and send the registration
    pub async fn connect(&self) -> Result<ActiveTunnel, TunnelError> {
        tracing::debug!("Agent dialing broker at {}", self.broker_address);
        let stream = self.dialer.dial(&self.broker_address).await?;

        let activity = ActivityFlag::new();
        let (reader, sender) = control_channel(stream, self.broker_address.clone());
        let sender = sender.with_activity(activity.clone());

        sender
            .send(Message::AgentRegister {
                target: self.target_address.clone(),
            })
            .await?;

        tracing::info!(
            "Agent registered with broker {}, target {}",
            self.broker_address,
            self.target_address
        );

        Ok(ActiveTunnel {
            reader,
            sender,
            activity,
        })
    }
}

/// A registered control channel to the broker
pub struct ActiveTunnel {
    /// Inbound commands from the broker
    pub reader: ControlReader,
    /// Outbound frames to the broker
    pub sender: ControlSender,
    /// Set whenever a frame crosses the channel
    pub activity: ActivityFlag,
}
