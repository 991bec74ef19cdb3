//! Session lifecycle: establish a keyed channel, run transfers over it, and
//! on the dialing side re-establish it when the connection drops.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use skiff_core::{SkiffConfig, TransportCapability};

use crate::channel::{spawn_channel, ChannelConfig, ChannelHandle, ChannelInbound, CloseReason};
use crate::events::LifecycleEvent;
use crate::handshake::{perform_handshake, HandshakeConfig, HandshakeError, HandshakeOutcome};
use crate::orchestrator::TransferOrchestrator;
use crate::transport::{reconnect, ConnectError, Connector, ReconnectPolicy};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake: HandshakeConfig,
    pub channel: ChannelConfig,
}

impl SessionConfig {
    pub fn from_config(config: &SkiffConfig, transports: &[TransportCapability]) -> Self {
        Self {
            handshake: HandshakeConfig::from_config(config, transports),
            channel: ChannelConfig::from_config(config),
        }
    }
}

/// A channel that has completed its handshake.
pub struct Session {
    pub channel: ChannelHandle,
    pub inbound: ChannelInbound,
    pub outcome: HandshakeOutcome,
}

impl Session {
    pub fn peer_device(&self) -> &str {
        self.outcome.peer_device()
    }
}

/// Spawn a channel over `stream` and run the handshake on it. The channel
/// is shut down if the handshake fails.
pub async fn establish<S>(stream: S, config: &SessionConfig) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (channel, mut inbound) = spawn_channel(stream, config.channel.clone());
    match perform_handshake(&channel, &mut inbound.control, &config.handshake).await {
        Ok(outcome) => Ok(Session {
            channel,
            inbound,
            outcome,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "handshake failed");
            channel.shutdown();
            Err(e)
        }
    }
}

/// Attach a session to the orchestrator and process it until the
/// connection ends. Transfers still running are paused.
pub async fn run_session(orchestrator: &TransferOrchestrator, session: Session) -> CloseReason {
    drive(orchestrator, session, false).await
}

async fn drive(orchestrator: &TransferOrchestrator, session: Session, resume_paused: bool) -> CloseReason {
    let Session {
        channel,
        inbound,
        outcome,
    } = session;
    orchestrator
        .attach(channel.clone(), outcome.peer.device_id.clone())
        .await;
    // Inbound keeps draining while paused transfers restart.
    let resumer = resume_paused.then(|| {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.resume_paused().await })
    });
    orchestrator.run_inbound(inbound).await;
    if let Some(resumer) = resumer {
        if let Ok(ids) = resumer.await {
            tracing::debug!(resumed = ids.len(), "paused transfers restarted");
        }
    }
    let reason = channel.closed().await;
    orchestrator.detach().await;
    reason
}

/// Listening side: handshake an accepted connection and serve it to the end.
pub async fn serve_connection<S>(
    stream: S,
    config: &SessionConfig,
    orchestrator: &TransferOrchestrator,
) -> Result<CloseReason, SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let session = establish(stream, config).await?;
    let reason = run_session(orchestrator, session).await;
    if reason != CloseReason::Shutdown {
        orchestrator
            .events()
            .lifecycle(LifecycleEvent::ConnectionLost {
                reason: reason.to_string(),
                // the peer dials back
                permanent: false,
            })
            .await;
    }
    Ok(reason)
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Dialing side. Keeps one peer connected: on loss it pauses transfers,
/// re-dials with backoff, re-handshakes and resumes outbound transfers.
pub struct SessionSupervisor<C: Connector> {
    connector: C,
    config: SessionConfig,
    policy: ReconnectPolicy,
    orchestrator: TransferOrchestrator,
}

impl<C: Connector> SessionSupervisor<C> {
    pub fn new(
        connector: C,
        config: SessionConfig,
        policy: ReconnectPolicy,
        orchestrator: TransferOrchestrator,
    ) -> Self {
        Self {
            connector,
            config,
            policy,
            orchestrator,
        }
    }

    /// Connect once and hand supervision to a background task. The first
    /// connection is not retried; its errors are returned here.
    pub async fn start(self) -> Result<JoinHandle<Result<(), SessionError>>, SessionError> {
        let stream = self.connector.connect().await?;
        let session = establish(stream, &self.config).await?;
        tracing::info!(peer = %self.connector.describe(), device = %session.peer_device(), "connected");
        Ok(tokio::spawn(self.supervise(session)))
    }

    async fn supervise(mut self, mut session: Session) -> Result<(), SessionError> {
        let mut resume_paused = false;
        loop {
            let reason = drive(&self.orchestrator, session, resume_paused).await;
            if reason == CloseReason::Shutdown {
                tracing::info!("session shut down");
                return Ok(());
            }
            tracing::warn!(%reason, peer = %self.connector.describe(), "connection lost");
            self.lost(reason.to_string(), false).await;

            session = match self.reestablish().await {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!(error = %e, "giving up on peer");
                    self.lost(e.to_string(), true).await;
                    return Err(e);
                }
            };
            tracing::info!(device = %session.peer_device(), "reconnected");
            resume_paused = true;
        }
    }

    async fn reestablish(&mut self) -> Result<Session, SessionError> {
        let stream = reconnect(&self.connector, &mut self.policy).await?;
        Ok(establish(stream, &self.config).await?)
    }

    async fn lost(&self, reason: String, permanent: bool) {
        self.orchestrator
            .events()
            .lifecycle(LifecycleEvent::ConnectionLost { reason, permanent })
            .await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}
