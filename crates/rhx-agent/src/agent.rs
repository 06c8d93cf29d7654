//! Agent control loop
//!
//! The agent owns one control channel to the broker and one registry of
//! target streams keyed by client identifier. Commands from the broker are
//! processed strictly in arrival order: a `ServerConnect` dials the target
//! before the next command is read, so data that follows a connect always
//! finds its stream.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use rhx_core::config::AgentConfig;
use rhx_core::relay::{self, PumpExit};
use rhx_core::{ConnectionRegistry, ControlLoopEnd, ControlSender, Dialer, TcpDialer, TunnelError};
use rhx_protocol::{ClientId, Command, Message};

use crate::heartbeat::run_heartbeat;
use crate::state::AgentPhase;
use crate::tunnel::{ActiveTunnel, ExponentialBackoff, TunnelConnector};

/// Agent side of the tunnel
pub struct Agent {
    config: AgentConfig,
    dialer: Arc<dyn Dialer>,
    connector: TunnelConnector,
    targets: Arc<ConnectionRegistry>,
    phase: watch::Sender<AgentPhase>,
}

impl Agent {
    /// Create an agent that dials over plain TCP
    pub fn new(config: AgentConfig) -> Self {
        let dialer = Arc::new(TcpDialer::new(config.connect_timeout));
        Self::with_dialer(config, dialer)
    }

    /// Create an agent with a custom dialer for both broker and target
    pub fn with_dialer(config: AgentConfig, dialer: Arc<dyn Dialer>) -> Self {
        let connector = TunnelConnector::new(
            config.broker_address.clone(),
            config.target_address.clone(),
            Arc::clone(&dialer),
        );
        let (phase, _) = watch::channel(AgentPhase::Unregistered);

        Self {
            config,
            dialer,
            connector,
            targets: Arc::new(ConnectionRegistry::new()),
            phase,
        }
    }

    /// Current registration phase
    pub fn phase(&self) -> AgentPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe_phase(&self) -> watch::Receiver<AgentPhase> {
        self.phase.subscribe()
    }

    /// Target streams by client identifier
    pub fn targets(&self) -> &Arc<ConnectionRegistry> {
        &self.targets
    }

    /// Dial the broker and send the registration.
    ///
    /// On failure the agent stays `Unregistered`.
    pub async fn register(&self) -> Result<ActiveTunnel, TunnelError> {
        self.set_phase(AgentPhase::Registering);

        match self.connector.connect().await {
            Ok(tunnel) => {
                self.set_phase(AgentPhase::Active);
                Ok(tunnel)
            }
            Err(e) => {
                tracing::error!(
                    "Agent failed to register with broker {}: {}",
                    self.connector.broker_address(),
                    e
                );
                self.set_phase(AgentPhase::Unregistered);
                Err(e)
            }
        }
    }

    /// Serve broker commands on a registered tunnel until it ends.
    ///
    /// Only reading decides when the channel is dead: a failed heartbeat
    /// write is logged by the heartbeat task and the next read reports the
    /// loss. All target streams are closed when the loop exits.
    pub async fn serve(&self, tunnel: ActiveTunnel, cancel: &CancellationToken) -> ControlLoopEnd {
        let ActiveTunnel {
            mut reader,
            sender,
            activity,
        } = tunnel;

        let heartbeat_cancel = cancel.child_token();
        let heartbeat = tokio::spawn(run_heartbeat(
            sender.clone(),
            activity.clone(),
            self.config.heartbeat_interval,
            heartbeat_cancel.clone(),
        ));

        let end = loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break ControlLoopEnd::Cancelled,
                received = reader.recv() => received,
            };

            match received {
                Ok(Some(message)) => {
                    activity.mark();
                    self.dispatch(message, &sender).await;
                }
                Ok(None) => break ControlLoopEnd::Closed,
                Err(e) => break ControlLoopEnd::Failed(e),
            }
        };

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat.await {
            tracing::debug!("Heartbeat task ended abnormally: {}", e);
        }

        sender.close().await;
        let closed = self.targets.clear().await;
        if closed > 0 {
            tracing::info!("Closed {} target connection(s)", closed);
        }
        self.set_phase(AgentPhase::Unregistered);

        end
    }

    /// Register and serve until shutdown.
    ///
    /// Without `reconnect` the agent stops after the first control channel
    /// ends, and a failed registration is returned as an error. With it,
    /// both cases are retried with exponential backoff.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.config
            .validate()
            .context("Invalid agent configuration")?;
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);

        loop {
            let registered = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_phase(AgentPhase::Unregistered);
                    return Ok(());
                }
                registered = self.register() => registered,
            };

            match registered {
                Ok(tunnel) => {
                    backoff.reset();
                    let end = self.serve(tunnel, &cancel).await;
                    match &end {
                        ControlLoopEnd::Cancelled => return Ok(()),
                        ControlLoopEnd::Closed => {
                            tracing::warn!(
                                "Broker {} closed the control channel",
                                self.connector.broker_address()
                            );
                        }
                        ControlLoopEnd::Failed(e) => {
                            tracing::error!(
                                "Control channel to {} failed: {}",
                                self.connector.broker_address(),
                                e
                            );
                        }
                    }
                    if !self.config.reconnect {
                        return Ok(());
                    }
                }
                Err(e) if !self.config.reconnect => {
                    let broker = self.connector.broker_address();
                    return Err(e)
                        .with_context(|| format!("Failed to register with broker {}", broker));
                }
                Err(_) => {}
            }

            let delay = backoff.next_delay();
            tracing::info!(
                "Registering again in {:?} (attempt {})",
                delay,
                backoff.attempts()
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dispatch(&self, message: Message, sender: &ControlSender) {
        match message {
            Message::ServerConnect { client } => self.open_target(client, sender).await,
            Message::ServerSendData { client, data } => {
                tracing::debug!("Received {} bytes for target, client {}", data.len(), client);
                match relay::deliver(&self.targets, &client, &data).await {
                    Ok(()) => {}
                    Err(TunnelError::UnknownIdentifier(client)) => {
                        tracing::warn!("No target connection for client {}, dropping data", client);
                    }
                    Err(e) => {
                        tracing::warn!("Writing to target for client {} failed: {}", client, e);
                    }
                }
            }
            Message::ServerDisconnect { client } => {
                tracing::info!("Broker disconnected client {}", client);
                self.targets.remove(&client).await;
            }
            other => {
                tracing::warn!("Ignoring unexpected {:?} from broker", other.command());
            }
        }
    }

    async fn open_target(&self, client: ClientId, sender: &ControlSender) {
        let stream = match self.dialer.dial(&self.config.target_address).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    "Failed to dial target {} for client {}: {}",
                    self.config.target_address,
                    client,
                    e
                );
                return;
            }
        };
        tracing::info!("Opened target {} for client {}", self.config.target_address, client);

        let (read_half, write_half) = tokio::io::split(stream);
        let handle = relay::register(&self.targets, client, write_half).await;

        let targets = Arc::clone(&self.targets);
        let sender = sender.clone();
        tokio::spawn(async move {
            let exit = relay::pump(&handle, read_half, Command::ClientSendData, &sender).await;
            match &exit {
                PumpExit::Closed => {}
                _ => tracing::info!(
                    "Target connection for client {} ended: {}",
                    handle.client(),
                    exit
                ),
            }
            targets.remove_if_current(&handle).await;
        });
    }

    fn set_phase(&self, phase: AgentPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!("Agent phase {} -> {}", previous, phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context as TaskContext, Poll};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use rhx_core::{control_channel, BoxedStream};

    /// Duplex stream whose writes start failing once `broken` is set
    struct FlakyStream {
        inner: tokio::io::DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl FlakyStream {
        fn check(&self) -> io::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                Err(io::ErrorKind::BrokenPipe.into())
            } else {
                Ok(())
            }
        }
    }

    impl AsyncRead for FlakyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FlakyStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.check()?;
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            self.check()?;
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Hands out one prepared stream, then refuses
    struct OneShotDialer(tokio::sync::Mutex<Option<BoxedStream>>);

    #[async_trait]
    impl Dialer for OneShotDialer {
        async fn dial(&self, address: &str) -> Result<BoxedStream, TunnelError> {
            self.0
                .lock()
                .await
                .take()
                .ok_or_else(|| TunnelError::DialFailure {
                    address: address.to_string(),
                    source: io::ErrorKind::ConnectionRefused.into(),
                })
        }
    }

    fn config(broker: &str) -> AgentConfig {
        AgentConfig {
            broker_address: broker.to_string(),
            target_address: "127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_agent_is_unregistered() {
        let agent = Agent::new(config("127.0.0.1:17325"));
        assert_eq!(agent.phase(), AgentPhase::Unregistered);
        assert!(agent.targets().is_empty());
    }

    #[tokio::test]
    async fn test_register_failure_stays_unregistered() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let agent = Agent::new(config(&address));
        let result = agent.register().await;

        assert!(matches!(result, Err(TunnelError::DialFailure { .. })));
        assert_eq!(agent.phase(), AgentPhase::Unregistered);
    }

    #[tokio::test]
    async fn test_run_without_reconnect_returns_registration_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let agent = Agent::new(config(&address));
        let result = agent.run(CancellationToken::new()).await;

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Failed to register with broker"));
    }

    #[tokio::test]
    async fn test_run_returns_when_cancelled_during_backoff() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = config(&address);
        config.reconnect = true;
        config.backoff.initial = Duration::from_secs(3600);
        config.backoff.max = Duration::from_secs(3600);
        let agent = Agent::new(config);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), agent.run(cancel))
            .await
            .expect("run should return after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let mut config = config("127.0.0.1:1");
        config.heartbeat_interval = Duration::ZERO;
        let agent = Agent::new(config);

        let result = agent.run(CancellationToken::new()).await;

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Invalid agent configuration"), "{}", message);
        assert_eq!(agent.phase(), AgentPhase::Unregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_heartbeat_write_does_not_end_serve() {
        const INTERVAL: Duration = Duration::from_secs(10);

        let (agent_side, broker_side) = tokio::io::duplex(4096);
        let broken = Arc::new(AtomicBool::new(false));
        let stream: BoxedStream = Box::new(FlakyStream {
            inner: agent_side,
            broken: Arc::clone(&broken),
        });
        let dialer = Arc::new(OneShotDialer(tokio::sync::Mutex::new(Some(stream))));

        let agent = Agent::with_dialer(
            AgentConfig {
                broker_address: "broker.test:17325".to_string(),
                target_address: "127.0.0.1:1".to_string(),
                heartbeat_interval: INTERVAL,
                ..Default::default()
            },
            dialer,
        );
        let (mut broker, broker_sender) = control_channel(broker_side, "agent");

        let tunnel = agent.register().await.unwrap();
        assert!(matches!(
            broker.recv().await.unwrap(),
            Some(Message::AgentRegister { .. })
        ));

        broken.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let serve = agent.serve(tunnel, &cancel);
        tokio::pin!(serve);

        // Heartbeats fail to write while the broker side stays open
        let early = tokio::time::timeout(INTERVAL * 4, &mut serve).await;
        assert!(early.is_err(), "serve ended on a heartbeat write failure");
        assert_eq!(agent.phase(), AgentPhase::Active);

        // The next read sees the broker go away
        drop(broker);
        drop(broker_sender);
        let end = tokio::time::timeout(INTERVAL, &mut serve)
            .await
            .expect("serve should end once the channel reads EOF");
        assert!(matches!(end, ControlLoopEnd::Closed), "{}", end);
        assert_eq!(agent.phase(), AgentPhase::Unregistered);
    }
}
