//! skiffd — send and receive files over TCP with the skiff protocol.
//!
//!   skiffd listen <addr>
//!   skiffd send   <addr> <file>...
//!   skiffd resume <addr> <transfer-id>...

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use skiff_core::{SkiffConfig, TransportCapability};
use skiff_services::events::EVENT_QUEUE_DEPTH;
use skiff_services::{
    dispatch, event_channel, serve_connection, Command, CommandResponse, EventSink, LifecycleEvent,
    OrchestratorConfig, ProgressEvent, ReconnectPolicy, ResumeStore, SessionConfig,
    SessionSupervisor, TcpConnector, TransferOrchestrator, TransferRegistry, TransportProfile,
};

const TRANSPORTS: [TransportCapability; 1] = [TransportCapability::Socket];

/// How often expired resume state is swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SkiffConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SkiffConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SkiffConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, rest) = args.split_first().context(USAGE)?;
    let addr: SocketAddr = rest
        .first()
        .context(USAGE)?
        .parse()
        .context("invalid socket address")?;
    tracing::info!(device = %config.identity.device_id, mode = %mode, %addr, "skiffd starting");

    match mode.as_str() {
        "listen" => listen(config, addr).await,
        "send" => {
            let commands = rest[1..]
                .iter()
                .map(|path| Command::SendFile { path: path.into() })
                .collect();
            run_client(config, addr, commands).await
        }
        "resume" => {
            let commands = rest[1..]
                .iter()
                .map(|id| parse_transfer_id(id).map(|transfer_id| Command::ResumeTransfer { transfer_id }))
                .collect::<Result<Vec<_>>>()?;
            run_client(config, addr, commands).await
        }
        _ => bail!(USAGE),
    }
}

const USAGE: &str = "usage: skiffd listen <addr> | send <addr> <file>... | resume <addr> <transfer-id>...";

/// Decimal or `0x`-prefixed hex.
fn parse_transfer_id(s: &str) -> Result<u32> {
    let id = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    id.with_context(|| format!("invalid transfer id {s:?}"))
}

// ── Shared setup ─────────────────────────────────────────────────────────────

struct Stack {
    registry: Arc<TransferRegistry>,
    resume: ResumeStore,
    session: SessionConfig,
}

impl Stack {
    fn new(config: &SkiffConfig) -> Result<Self> {
        let resume = ResumeStore::open_dir(&config.resume.state_dir).with_context(|| {
            format!(
                "failed to open resume store at {}",
                config.resume.state_dir.display()
            )
        })?;
        tracing::info!(dir = %config.resume.state_dir.display(), "resume store ready");
        Ok(Self {
            registry: TransferRegistry::shared(config.transfer.max_concurrent_transfers),
            resume,
            session: SessionConfig::from_config(config, &TRANSPORTS),
        })
    }

    fn orchestrator(&self, config: &SkiffConfig, events: EventSink) -> TransferOrchestrator {
        TransferOrchestrator::new(
            OrchestratorConfig::from_config(
                config,
                TransportProfile::for_capability(TransportCapability::Socket),
            ),
            self.registry.clone(),
            self.resume.clone(),
            events,
        )
    }
}

fn spawn_sweeper(resume: ResumeStore, retention: Option<Duration>) {
    let Some(retention) = retention else {
        return;
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = resume.sweep_older_than(retention);
            if removed > 0 {
                tracing::info!(removed, "expired resume state swept");
            }
        }
    });
}

fn log_lifecycle(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Failed { transfer_id, reason } => {
            tracing::error!(transfer_id, %reason, "transfer failed")
        }
        LifecycleEvent::ChunkError { transfer_id, offset, reason } => {
            tracing::warn!(transfer_id, offset, %reason, "chunk error")
        }
        LifecycleEvent::ConnectionLost { reason, permanent } => {
            tracing::warn!(%reason, permanent, "connection lost")
        }
        other => tracing::info!(event = ?other, "lifecycle"),
    }
}

fn spawn_progress_logger(mut progress: mpsc::Receiver<ProgressEvent>) {
    tokio::spawn(async move {
        while let Some(p) = progress.recv().await {
            tracing::debug!(
                transfer_id = p.transfer_id,
                bytes = p.bytes_transferred,
                total = p.total_bytes,
                status = ?p.status,
                "progress"
            );
        }
    });
}

// ── listen ───────────────────────────────────────────────────────────────────

async fn listen(config: SkiffConfig, addr: SocketAddr) -> Result<()> {
    let stack = Stack::new(&config)?;
    spawn_sweeper(stack.resume.clone(), config.resume.retention());

    let (events, streams) = event_channel(EVENT_QUEUE_DEPTH);
    spawn_progress_logger(streams.progress);
    let mut lifecycle = streams.lifecycle;
    tokio::spawn(async move {
        while let Some(event) = lifecycle.recv().await {
            log_lifecycle(&event);
        }
    });

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, download_dir = %config.transfer.download_dir.display(), "listening");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = shutdown_rx.recv() => break,
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        tracing::info!(%remote, "connection accepted");

        let orchestrator = stack.orchestrator(&config, events.clone());
        let session = stack.session.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = serve_connection(stream, &session, &orchestrator) => match result {
                    Ok(reason) => tracing::info!(%remote, %reason, "connection ended"),
                    Err(e) => tracing::warn!(%remote, error = %e, "session failed"),
                },
                _ = shutdown.recv() => {
                    orchestrator.detach().await;
                }
            }
        });
    }

    tracing::info!("shutting down");
    Ok(())
}

// ── send / resume ────────────────────────────────────────────────────────────

async fn run_client(config: SkiffConfig, addr: SocketAddr, commands: Vec<Command>) -> Result<()> {
    if commands.is_empty() {
        bail!(USAGE);
    }
    let stack = Stack::new(&config)?;
    let (events, streams) = event_channel(EVENT_QUEUE_DEPTH);
    spawn_progress_logger(streams.progress);
    let mut lifecycle = streams.lifecycle;

    let orchestrator = stack.orchestrator(&config, events);
    let supervisor = SessionSupervisor::new(
        TcpConnector::new(addr),
        stack.session.clone(),
        ReconnectPolicy::from_config(&config),
        orchestrator.clone(),
    );

    let session = supervisor
        .start()
        .await
        .context("failed to establish session")?;
    if !wait_connected(&mut lifecycle).await {
        bail!("event stream closed before the session came up");
    }

    let mut pending = HashSet::new();
    for command in commands {
        match dispatch(&orchestrator, command).await {
            CommandResponse::Started { transfer_id } | CommandResponse::Resumed { transfer_id } => {
                tracing::info!(transfer_id = %format!("{transfer_id:#010x}"), "transfer running");
                pending.insert(transfer_id);
            }
            CommandResponse::Error(e) => tracing::error!(error = %e, "command failed"),
            other => tracing::debug!(response = ?other, "command response"),
        }
    }

    let mut outcome = Ok(());
    while !pending.is_empty() {
        let event = tokio::select! {
            event = lifecycle.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, transfers can be resumed later");
                break;
            }
        };
        let Some(event) = event else { break };
        log_lifecycle(&event);
        match event {
            LifecycleEvent::Completed { transfer_id, .. }
            | LifecycleEvent::Cancelled { transfer_id } => {
                pending.remove(&transfer_id);
            }
            LifecycleEvent::Failed { transfer_id, .. } => {
                pending.remove(&transfer_id);
                outcome = Err(anyhow::anyhow!("transfer {transfer_id:#010x} failed"));
            }
            LifecycleEvent::ConnectionLost { permanent: true, reason } => {
                outcome = Err(anyhow::anyhow!("connection lost: {reason}"));
                break;
            }
            _ => {}
        }
    }

    tokio::spawn(async move {
        while let Some(event) = lifecycle.recv().await {
            log_lifecycle(&event);
        }
    });
    orchestrator.detach().await;
    match session.await {
        Ok(Err(e)) => tracing::debug!(error = %e, "supervisor ended with error"),
        Err(e) => tracing::debug!(error = %e, "supervisor task failed"),
        Ok(Ok(())) => {}
    }
    outcome
}

/// Log lifecycle events until the first `Connected`. False if the stream
/// ended first.
async fn wait_connected(lifecycle: &mut mpsc::Receiver<LifecycleEvent>) -> bool {
    while let Some(event) = lifecycle.recv().await {
        log_lifecycle(&event);
        if matches!(event, LifecycleEvent::Connected { .. }) {
            return true;
        }
    }
    false
}
