//! Global broker state

use std::sync::Arc;

use tokio::sync::watch;

use rhx_core::config::BrokerConfig;
use rhx_core::{ConnectionRegistry, ControlSender};

/// Ownership of the broker's single control channel
#[derive(Debug, Clone)]
pub enum ControlSlot {
    /// No connection accepted yet
    Vacant,
    /// A connection was taken as the control channel, but the agent has
    /// not registered on it yet
    Claimed {
        /// Remote address of the claiming connection
        peer: String,
    },
    /// The agent registered; clients are relayed over this channel
    Adopted(ControlSender),
    /// The control channel ended
    Dead,
}

impl ControlSlot {
    /// Whether a client waiting for the channel can stop waiting
    fn is_settled(&self) -> bool {
        matches!(self, ControlSlot::Adopted(_) | ControlSlot::Dead)
    }
}

/// Global state for the broker
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// External clients by identifier
    pub clients: Arc<ConnectionRegistry>,
    /// The control slot. Only the accept loop claims it and only the
    /// owning control loop adopts or retires it.
    control: watch::Sender<ControlSlot>,
}

impl BrokerState {
    /// Create new broker state
    pub fn new(config: BrokerConfig) -> Self {
        let (control, _) = watch::channel(ControlSlot::Vacant);
        Self {
            config,
            clients: Arc::new(ConnectionRegistry::new()),
            control,
        }
    }

    /// Snapshot of the control slot
    pub fn control_slot(&self) -> ControlSlot {
        self.control.borrow().clone()
    }

    /// Take the connection from `peer` as the control channel if the slot
    /// is free.
    ///
    /// The slot is free when nothing was accepted yet, or when the previous
    /// control channel died and re-adoption is enabled.
    pub fn claim_control(&self, peer: &str) -> bool {
        let readopt = self.config.readopt_control;
        self.control.send_if_modified(|slot| {
            let free = match slot {
                ControlSlot::Vacant => true,
                ControlSlot::Dead => readopt,
                _ => false,
            };
            if free {
                *slot = ControlSlot::Claimed {
                    peer: peer.to_string(),
                };
            }
            free
        })
    }

    /// Publish a registered control channel to client tasks
    pub fn adopt_control(&self, sender: &ControlSender) {
        self.control.send_if_modified(|slot| match slot {
            ControlSlot::Claimed { .. } => {
                *slot = ControlSlot::Adopted(sender.clone());
                true
            }
            ControlSlot::Adopted(current) if current.same_channel(sender) => {
                tracing::debug!("Agent on {} registered again", sender.peer());
                false
            }
            _ => {
                tracing::warn!(
                    "Ignoring registration from {}, control slot is not held by it",
                    sender.peer()
                );
                false
            }
        });
    }

    /// Mark the control channel owned by `sender` as dead.
    ///
    /// A slot that moved on to another channel is left alone.
    pub fn retire_control(&self, sender: &ControlSender) {
        self.control.send_if_modified(|slot| {
            let owned = match slot {
                ControlSlot::Claimed { peer } => peer == sender.peer(),
                ControlSlot::Adopted(current) => current.same_channel(sender),
                _ => false,
            };
            if owned {
                *slot = ControlSlot::Dead;
            }
            owned
        });
    }

    /// Wait until the agent has registered.
    ///
    /// Returns `None` if the control channel died first.
    pub async fn wait_for_control(&self) -> Option<ControlSender> {
        let mut rx = self.control.subscribe();
        let slot = rx.wait_for(ControlSlot::is_settled).await.ok()?;
        match &*slot {
            ControlSlot::Adopted(sender) => Some(sender.clone()),
            _ => None,
        }
    }

    /// Stop relaying: kill the control channel and close every client.
    pub async fn shutdown(&self) {
        let previous = self.control.send_replace(ControlSlot::Dead);
        if let ControlSlot::Adopted(sender) = previous {
            sender.close().await;
        }

        let closed = self.clients.clear().await;
        if closed > 0 {
            tracing::info!("Closed {} client connection(s)", closed);
        }
    }
}
