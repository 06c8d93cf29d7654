//! Heartbeat task
//!
//! Sends `AgentHeartbeat` on a fixed interval, but only when nothing else
//! crossed the control channel since the previous tick. Failures are
//! logged; detecting a dead channel is the control loop's job.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use rhx_core::time::heartbeat_timestamp;
use rhx_core::{ActivityFlag, ControlSender, TunnelError};
use rhx_protocol::Message;

/// Run the heartbeat loop until `cancel` fires or the channel closes
pub async fn run_heartbeat(
    sender: ControlSender,
    activity: ActivityFlag,
    interval: Duration,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        tracing::error!("Heartbeat interval is zero, no heartbeats will be sent");
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if activity.take() {
            tracing::trace!("Control channel busy, skipping heartbeat");
            continue;
        }

        tracing::debug!("Agent sending heartbeat to broker {}", sender.peer());
        let heartbeat = Message::AgentHeartbeat {
            timestamp: heartbeat_timestamp(),
        };
        match sender.send(heartbeat).await {
            Ok(()) => {}
            Err(TunnelError::ChannelClosed) => {
                tracing::debug!("Control channel closed, heartbeat stopping");
                break;
            }
            Err(e) => {
                tracing::warn!("Agent heartbeat to broker {} failed: {}", sender.peer(), e);
            }
        }
    }
}
