//! Skiff integration test harness.
//!
//! Every test runs whole sessions in-process: two nodes, each with its own
//! registry, resume store and event streams, joined by `tokio::io::duplex`.
//! Files live under a per-test temp directory.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use skiff_core::TransportCapability;
use skiff_services::handshake::HandshakeConfig;
use skiff_services::{
    establish, event_channel, run_session, serve_connection, ChannelConfig, ChannelHandle,
    CloseReason, Connector, EventSink, EventStreams, LifecycleEvent, OrchestratorConfig,
    ResumeStore, Session, SessionConfig, TransferOrchestrator, TransferRegistry, TransportProfile,
};

mod capacity;
mod handshake;
mod reconnect;
mod resume;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait for an event.
pub const EVENT_WAIT: Duration = Duration::from_secs(30);

static DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Fresh directory under the system temp dir, unique per call.
pub fn temp_dir(tag: &str) -> PathBuf {
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("skiff-it-{tag}-{}-{n}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Write `len` bytes of deterministic, non-repeating-looking content.
pub fn write_test_file(path: &Path, len: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 9)) as u8)
        .collect();
    std::fs::write(path, &data).expect("write test file");
    data
}

pub fn session_config(device: &str) -> SessionConfig {
    SessionConfig {
        handshake: HandshakeConfig {
            timeout: Duration::from_secs(2),
            ..HandshakeConfig::new(device, &[TransportCapability::Socket])
        },
        channel: ChannelConfig::default(),
    }
}

/// One side of a test: everything a daemon would own, minus the socket.
pub struct Node {
    pub device: String,
    pub dir: PathBuf,
    pub registry: Arc<TransferRegistry>,
    pub resume: ResumeStore,
    pub events: EventSink,
    pub streams: EventStreams,
    pub session: SessionConfig,
}

impl Node {
    pub fn new(device: &str, dir: &Path) -> Self {
        Self::with_capacity(device, dir, 5)
    }

    pub fn with_capacity(device: &str, dir: &Path, capacity: usize) -> Self {
        let (events, streams) = event_channel(256);
        Self {
            device: device.to_string(),
            dir: dir.join(device),
            registry: TransferRegistry::shared(capacity),
            resume: ResumeStore::in_memory(),
            events,
            streams,
            session: session_config(device),
        }
    }

    pub fn downloads(&self) -> PathBuf {
        self.dir.join("downloads")
    }

    pub fn orchestrator(&self) -> TransferOrchestrator {
        TransferOrchestrator::new(
            OrchestratorConfig {
                device_id: self.device.clone(),
                download_dir: self.downloads(),
                transport: TransportProfile::standard(),
            },
            self.registry.clone(),
            self.resume.clone(),
            self.events.clone(),
        )
    }

    /// Wait for the next lifecycle event matching `pred`, skipping others.
    pub async fn wait_for(
        &mut self,
        what: &str,
        pred: impl Fn(&LifecycleEvent) -> bool,
    ) -> Result<LifecycleEvent> {
        wait_for(&mut self.streams.lifecycle, what, pred).await
    }

    /// Wait until every listed transfer has completed on this node, in any
    /// order. A failure of one of them ends the wait with an error.
    pub async fn wait_all_completed(&mut self, ids: &[u32]) -> Result<()> {
        let mut left: HashSet<u32> = ids.iter().copied().collect();
        while !left.is_empty() {
            let event = self
                .wait_for("completions", |e| {
                    matches!(
                        e,
                        LifecycleEvent::Completed { .. } | LifecycleEvent::Failed { .. }
                    )
                })
                .await?;
            match event {
                LifecycleEvent::Completed { transfer_id, .. } => {
                    left.remove(&transfer_id);
                }
                LifecycleEvent::Failed { transfer_id, reason } if left.contains(&transfer_id) => {
                    bail!("transfer {transfer_id:#010x} failed: {reason}")
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub async fn wait_for(
    lifecycle: &mut mpsc::Receiver<LifecycleEvent>,
    what: &str,
    pred: impl Fn(&LifecycleEvent) -> bool,
) -> Result<LifecycleEvent> {
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    loop {
        let event = tokio::time::timeout_at(deadline, lifecycle.recv())
            .await
            .with_context(|| format!("timed out waiting for {what}"))?;
        match event {
            Some(event) if pred(&event) => return Ok(event),
            Some(_) => continue,
            None => bail!("event stream closed while waiting for {what}"),
        }
    }
}

/// Handshake two nodes over an in-memory pipe without attaching either.
pub async fn establish_pair(a: &Node, b: &Node) -> Result<(Session, Session)> {
    let (sa, sb) = duplex(1 << 20);
    let (ra, rb) = tokio::join!(establish(sa, &a.session), establish(sb, &b.session));
    Ok((
        ra.context("handshake on a")?,
        rb.context("handshake on b")?,
    ))
}

/// Attach a session to an orchestrator in the background.
pub fn spawn_session(orchestrator: &TransferOrchestrator, session: Session) -> JoinHandle<CloseReason> {
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move { run_session(&orchestrator, session).await })
}

/// Two attached orchestrators and their channels.
pub struct Pair {
    pub a: TransferOrchestrator,
    pub b: TransferOrchestrator,
    pub a_channel: ChannelHandle,
    pub b_channel: ChannelHandle,
    pub a_task: JoinHandle<CloseReason>,
    pub b_task: JoinHandle<CloseReason>,
}

/// Handshake, attach both sides, and wait until both report `Connected`.
pub async fn connect(a: &mut Node, b: &mut Node) -> Result<Pair> {
    let (sa, sb) = establish_pair(a, b).await?;
    let (oa, ob) = (a.orchestrator(), b.orchestrator());
    let (a_channel, b_channel) = (sa.channel.clone(), sb.channel.clone());
    let a_task = spawn_session(&oa, sa);
    let b_task = spawn_session(&ob, sb);
    a.wait_for("a connected", is_connected).await?;
    b.wait_for("b connected", is_connected).await?;
    Ok(Pair {
        a: oa,
        b: ob,
        a_channel,
        b_channel,
        a_task,
        b_task,
    })
}

pub fn is_connected(e: &LifecycleEvent) -> bool {
    matches!(e, LifecycleEvent::Connected { .. })
}

pub fn is_completed(id: u32) -> impl Fn(&LifecycleEvent) -> bool {
    move |e| matches!(e, LifecycleEvent::Completed { transfer_id, .. } if *transfer_id == id)
}

// ── Loopback connector ────────────────────────────────────────────────────────

/// Dials an in-process listener: every `connect` makes a new pipe and serves
/// the far end with a fresh orchestrator over the listener node's shared
/// registry, resume store and event sink. Bytes pass through a relay task
/// so a connection can be left half-open.
#[derive(Clone)]
pub struct LoopbackConnector {
    inner: Arc<LoopbackInner>,
}

struct LoopbackInner {
    session: SessionConfig,
    device: String,
    downloads: PathBuf,
    registry: Arc<TransferRegistry>,
    resume: ResumeStore,
    events: EventSink,
    current: Mutex<Option<LiveConnection>>,
    /// Listener ends of stalled connections, kept open.
    held: Mutex<Vec<DuplexStream>>,
    refuse: AtomicBool,
    dials: AtomicU32,
}

struct LiveConnection {
    orchestrator: TransferOrchestrator,
    stall: Arc<Notify>,
}

impl LoopbackConnector {
    pub fn new(listener: &Node) -> Self {
        Self {
            inner: Arc::new(LoopbackInner {
                session: listener.session.clone(),
                device: listener.device.clone(),
                downloads: listener.downloads(),
                registry: listener.registry.clone(),
                resume: listener.resume.clone(),
                events: listener.events.clone(),
                current: Mutex::new(None),
                held: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
                dials: AtomicU32::new(0),
            }),
        }
    }

    /// Drop the live connection from the listener's side.
    pub async fn cut(&self) {
        let current = self
            .inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.orchestrator.clone());
        if let Some(orchestrator) = current {
            orchestrator.detach().await;
        }
    }

    /// Close the dialer's end of the live connection while the listener's
    /// end stays open and silent, like a TCP peer that vanished.
    pub fn stall(&self) {
        if let Some(live) = self.inner.current.lock().unwrap().as_ref() {
            live.stall.notify_one();
        }
    }

    pub fn stalled(&self) -> usize {
        self.inner.held.lock().unwrap().len()
    }

    /// Make every later dial fail.
    pub fn refuse(&self) {
        self.inner.refuse.store(true, Ordering::SeqCst);
    }

    pub fn dials(&self) -> u32 {
        self.inner.dials.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"));
        }
        let (local, mut near) = duplex(1 << 20);
        let (mut far, remote) = duplex(1 << 20);
        let orchestrator = TransferOrchestrator::new(
            OrchestratorConfig {
                device_id: self.inner.device.clone(),
                download_dir: self.inner.downloads.clone(),
                transport: TransportProfile::standard(),
            },
            self.inner.registry.clone(),
            self.inner.resume.clone(),
            self.inner.events.clone(),
        );
        let stall = Arc::new(Notify::new());
        *self.inner.current.lock().unwrap() = Some(LiveConnection {
            orchestrator: orchestrator.clone(),
            stall: stall.clone(),
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let stalled = tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut near, &mut far) => false,
                _ = stall.notified() => true,
            };
            if stalled {
                drop(near);
                inner.held.lock().unwrap().push(far);
            }
        });

        let session = self.inner.session.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(remote, &session, &orchestrator).await {
                eprintln!("loopback session failed: {e}");
            }
        });
        Ok(local)
    }

    fn describe(&self) -> String {
        format!("loopback:{}", self.inner.device)
    }
}
