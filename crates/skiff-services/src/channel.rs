//! Channel multiplexer — drives every frame over one ordered byte stream.
//!
//! Three tasks per connection:
//!
//!   writer  : sole owner of the write half; encodes and length-prefixes
//!             frames from an mpsc queue, one at a time, in order
//!   reader  : fills a `BytesMut` from the read half, cuts frames with
//!             `FrameDecoder`, and routes them:
//!               Ack            → reliability engine (unblocked frames → writer)
//!               Cancel         → engine (window dropped) + control stream
//!               confirmation   → records the peer's tag + control stream
//!               other control  → control stream
//!               Data           → AES-GCM open → data stream
//!   ticker  : drives the engine's ack timers
//!
//! Until the session key is installed and the peer's confirmation tag has
//! matched ours, only Discovery, KeyExchange and Handshake frames are
//! accepted; anything else is dropped. The reader records the tag itself, so
//! a frame that follows the peer's confirmation on the wire is never dropped
//! for arriving before the handshake task has caught up. A malformed or
//! oversized frame tears the whole connection down: the stream can no longer
//! be trusted to be in sync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex, Notify};

use skiff_core::crypto::{CryptoError, SessionCipher, SessionKey};
use skiff_core::message::{cancel_frame, CancelReason};
use skiff_core::wire::{
    self, ControlKind, Frame, FrameDecoder, FrameKind, WireError, HASH_LEN, SESSION_TRANSFER_ID,
};
use skiff_core::{Acknowledgement, SkiffConfig};

use crate::reliability::{AckOutcome, ChunkFailure, ReliabilityConfig, ReliabilityEngine};

/// Initial receive buffer, and the minimum free space kept before each read.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub reliability: ReliabilityConfig,
    /// Largest accepted length prefix.
    pub max_frame_size: usize,
    /// How often ack timers are checked.
    pub tick_interval: Duration,
    /// Depth of the outbound and inbound queues.
    pub queue_depth: usize,
    pub log_frames: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let reliability = ReliabilityConfig::default();
        Self {
            tick_interval: tick_for(reliability.ack_timeout),
            reliability,
            max_frame_size: wire::MAX_FRAME_SIZE,
            queue_depth: 256,
            log_frames: false,
        }
    }
}

impl ChannelConfig {
    pub fn from_config(config: &SkiffConfig) -> Self {
        let reliability = ReliabilityConfig::from(&config.transfer);
        Self {
            tick_interval: tick_for(reliability.ack_timeout),
            reliability,
            max_frame_size: config.connection.frame_limit(),
            log_frames: config.debug.log_frames,
            ..Self::default()
        }
    }
}

fn tick_for(ack_timeout: Duration) -> Duration {
    (ack_timeout / 4).clamp(Duration::from_millis(5), Duration::from_millis(250))
}

/// Engine clock. Read through tokio so paused test time applies.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Why a channel stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport error: {0}")]
    Io(String),
    #[error("protocol violation: {0}")]
    Protocol(WireError),
    #[error("shut down locally")]
    Shutdown,
}

/// A decrypted, authenticated chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub transfer_id: u32,
    pub offset: u64,
    pub plaintext: Bytes,
    /// Sender's BLAKE3 of the plaintext, still to be verified.
    pub integrity_hash: [u8; HASH_LEN],
}

/// Delivery reports from the reliability engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliabilityEvent {
    Delivered {
        transfer_id: u32,
        offset: u64,
        length: u32,
    },
    Failed(ChunkFailure),
}

/// Inbound streams, consumed by the handshake and then the orchestrator.
pub struct ChannelInbound {
    pub control: mpsc::Receiver<Frame>,
    pub data: mpsc::Receiver<DataChunk>,
    pub reliability: mpsc::Receiver<ReliabilityEvent>,
}

/// Counters since the channel was spawned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Data frames written, retransmissions included.
    pub data_frames_out: u64,
    pub retransmissions: u64,
    /// Frames dropped for arriving before the key or failing to decrypt.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    data_frames_out: AtomicU64,
    retransmissions: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            data_frames_out: self.data_frames_out.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// Key confirmation progress. Either tag may be known first: ours once the
/// key is installed, theirs once their confirmation frame is read.
#[derive(Default)]
struct Confirmation {
    expected: Option<[u8; 32]>,
    received: Option<[u8; 32]>,
    confirmed: bool,
}

impl Confirmation {
    fn settle(&mut self) {
        if let (Some(ours), Some(theirs)) = (self.expected, self.received) {
            // blake3::Hash equality is constant-time
            self.confirmed = blake3::Hash::from(ours) == blake3::Hash::from(theirs);
        }
    }
}

struct Shared {
    outbound: mpsc::Sender<Frame>,
    engine: Mutex<ReliabilityEngine>,
    /// Set once by the handshake, never replaced.
    cipher: OnceLock<SessionCipher>,
    confirmation: StdMutex<Confirmation>,
    /// Woken whenever window space may have opened (ack, cancel, failure,
    /// close).
    backlog: Notify,
    close_tx: watch::Sender<Option<CloseReason>>,
    reliability_tx: mpsc::Sender<ReliabilityEvent>,
    counters: Counters,
    log_frames: bool,
}

impl Shared {
    /// Record the first close reason and wake everyone waiting.
    fn close(&self, reason: CloseReason) {
        let first = self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if first {
            tracing::info!(%reason, "channel closed");
        }
        self.backlog.notify_waiters();
    }

    fn confirmation(&self) -> std::sync::MutexGuard<'_, Confirmation> {
        self.confirmation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_confirmed(&self) -> bool {
        self.confirmation().confirmed
    }

    /// Keep the first confirmation tag the peer sends.
    fn record_peer_tag(&self, payload: &[u8]) {
        let Ok(tag) = <[u8; 32]>::try_from(payload) else {
            return;
        };
        let mut confirmation = self.confirmation();
        if confirmation.received.is_none() {
            confirmation.received = Some(tag);
            confirmation.settle();
        }
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.close_tx.borrow().clone()
    }

    async fn send_frames(&self, frames: Vec<Frame>) -> Result<(), ChannelError> {
        for frame in frames {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| ChannelError::Closed(self.close_reason().unwrap_or(CloseReason::Shutdown)))?;
        }
        Ok(())
    }
}

async fn wait_closed(rx: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            return CloseReason::Shutdown;
        }
    }
}

// ── Spawn ─────────────────────────────────────────────────────────────────────

/// Take ownership of a connection and start its tasks.
pub fn spawn_channel<S>(stream: S, config: ChannelConfig) -> (ChannelHandle, ChannelInbound)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let depth = config.queue_depth.max(1);
    let (read_half, write_half) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel(depth);
    let (control_tx, control_rx) = mpsc::channel(depth);
    let (data_tx, data_rx) = mpsc::channel(depth);
    let (reliability_tx, reliability_rx) = mpsc::channel(depth);
    let (close_tx, _) = watch::channel(None);

    let shared = Arc::new(Shared {
        outbound: out_tx,
        engine: Mutex::new(ReliabilityEngine::new(config.reliability)),
        cipher: OnceLock::new(),
        confirmation: StdMutex::new(Confirmation::default()),
        backlog: Notify::new(),
        close_tx,
        reliability_tx,
        counters: Counters::default(),
        log_frames: config.log_frames,
    });

    tokio::spawn(writer_loop(shared.clone(), write_half, out_rx));
    tokio::spawn(reader_loop(
        shared.clone(),
        read_half,
        FrameDecoder::new(config.max_frame_size),
        control_tx,
        data_tx,
    ));
    tokio::spawn(tick_loop(shared.clone(), config.tick_interval));

    (
        ChannelHandle { inner: shared },
        ChannelInbound {
            control: control_rx,
            data: data_rx,
            reliability: reliability_rx,
        },
    )
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn writer_loop<W>(shared: Arc<Shared>, mut writer: W, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut closed = shared.close_tx.subscribe();
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
            _ = wait_closed(&mut closed) => break,
        };

        let bytes = match wire::encode_prefixed(&frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, transfer_id = frame.transfer_id, "dropping unencodable frame");
                continue;
            }
        };
        if shared.log_frames {
            tracing::trace!(
                kind = ?frame.kind,
                transfer_id = frame.transfer_id,
                offset = frame.offset,
                len = frame.payload.len(),
                "frame out"
            );
        }

        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            shared.close(CloseReason::Io(e.to_string()));
            break;
        }

        Counters::bump(&shared.counters.frames_out, 1);
        if frame.is_data() {
            Counters::bump(&shared.counters.data_frames_out, 1);
        }
    }
    let _ = writer.shutdown().await;
}

async fn reader_loop<R>(
    shared: Arc<Shared>,
    mut reader: R,
    decoder: FrameDecoder,
    control_tx: mpsc::Sender<Frame>,
    data_tx: mpsc::Sender<DataChunk>,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = shared.close_tx.subscribe();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(frame)) => {
                    if let Err(reason) = dispatch(&shared, frame, &control_tx, &data_tx).await {
                        tracing::warn!(%reason, "tearing down connection");
                        shared.close(reason);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed frame, tearing down connection");
                    shared.close(CloseReason::Protocol(e));
                    return;
                }
            }
        }

        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            r = reader.read_buf(&mut buf) => r,
            _ = wait_closed(&mut closed) => return,
        };
        match read {
            Ok(0) => {
                shared.close(CloseReason::PeerClosed);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shared.close(CloseReason::Io(e.to_string()));
                return;
            }
        }
    }
}

/// Route one inbound frame. `Err` means the connection must be torn down.
async fn dispatch(
    shared: &Shared,
    frame: Frame,
    control_tx: &mpsc::Sender<Frame>,
    data_tx: &mpsc::Sender<DataChunk>,
) -> Result<(), CloseReason> {
    Counters::bump(&shared.counters.frames_in, 1);
    if shared.log_frames {
        tracing::trace!(
            kind = ?frame.kind,
            transfer_id = frame.transfer_id,
            offset = frame.offset,
            len = frame.payload.len(),
            "frame in"
        );
    }

    let cipher = shared.cipher.get();
    let confirmed = shared.is_confirmed();
    match frame.kind {
        FrameKind::Control(ControlKind::Handshake) if frame.transfer_id == SESSION_TRANSFER_ID => {
            shared.record_peer_tag(&frame.payload);
            let _ = control_tx.send(frame).await;
        }
        FrameKind::Control(
            ControlKind::Discovery | ControlKind::KeyExchange | ControlKind::Handshake,
        ) => {
            let _ = control_tx.send(frame).await;
        }
        _ if !confirmed => {
            tracing::debug!(kind = ?frame.kind, "dropping frame received before key confirmation");
            Counters::bump(&shared.counters.dropped, 1);
        }
        FrameKind::Control(ControlKind::Ack) => {
            let ack = Acknowledgement::from_bytes(&frame.payload).map_err(CloseReason::Protocol)?;
            let outcome = shared.engine.lock().await.on_ack(&ack, now());
            match outcome {
                AckOutcome::Delivered {
                    offset,
                    length,
                    unblocked,
                    ..
                } => {
                    shared.backlog.notify_waiters();
                    if shared.send_frames(unblocked).await.is_err() {
                        return Ok(());
                    }
                    let _ = shared
                        .reliability_tx
                        .send(ReliabilityEvent::Delivered {
                            transfer_id: ack.transfer_id,
                            offset,
                            length,
                        })
                        .await;
                }
                AckOutcome::Duplicate | AckOutcome::Unmatched => {
                    tracing::trace!(transfer_id = ack.transfer_id, offset = ack.offset, "ignoring stale ack");
                }
            }
        }
        FrameKind::Control(ControlKind::Cancel) => {
            shared.engine.lock().await.remove(frame.transfer_id);
            shared.backlog.notify_waiters();
            let _ = control_tx.send(frame).await;
        }
        FrameKind::Data => {
            let Some(cipher) = cipher else {
                return Ok(());
            };
            match cipher.open(frame.transfer_id, frame.offset, &frame.iv, &frame.payload) {
                Ok(plaintext) => {
                    let _ = data_tx
                        .send(DataChunk {
                            transfer_id: frame.transfer_id,
                            offset: frame.offset,
                            plaintext: Bytes::from(plaintext),
                            integrity_hash: frame.integrity_hash,
                        })
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        transfer_id = frame.transfer_id,
                        offset = frame.offset,
                        "dropping chunk that failed authentication"
                    );
                    Counters::bump(&shared.counters.dropped, 1);
                }
            }
        }
    }
    Ok(())
}

async fn tick_loop(shared: Arc<Shared>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut closed = shared.close_tx.subscribe();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = wait_closed(&mut closed) => return,
        }

        let tick = shared.engine.lock().await.on_tick(now());
        if !tick.resend.is_empty() {
            tracing::debug!(count = tick.resend.len(), "retransmitting unacknowledged chunks");
            Counters::bump(&shared.counters.retransmissions, tick.resend.len() as u64);
            if shared.send_frames(tick.resend).await.is_err() {
                return;
            }
        }
        for failure in &tick.failed {
            tracing::warn!(
                transfer_id = failure.transfer_id,
                offset = failure.offset,
                retries = failure.retries,
                "chunk exhausted retries"
            );
            let _ = shared
                .reliability_tx
                .send(ReliabilityEvent::Failed(*failure))
                .await;
        }
        if !tick.failed.is_empty() {
            shared.backlog.notify_waiters();
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to a running channel.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<Shared>,
}

impl ChannelHandle {
    fn closed_error(&self) -> ChannelError {
        ChannelError::Closed(self.inner.close_reason().unwrap_or(CloseReason::Shutdown))
    }

    /// Queue a control frame for the writer.
    pub async fn send_control(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.inner.send_frames(vec![frame]).await
    }

    /// Install the session key and the confirmation tag the peer must
    /// echo. Allowed exactly once per channel. Frames other than the
    /// handshake's stay blocked until the peer's tag matches `tag`.
    pub fn install_key(&self, key: &SessionKey, tag: [u8; 32]) -> Result<(), ChannelError> {
        self.inner
            .cipher
            .set(SessionCipher::new(key))
            .map_err(|_| ChannelError::KeyAlreadyInstalled)?;
        let mut confirmation = self.inner.confirmation();
        confirmation.expected = Some(tag);
        confirmation.settle();
        Ok(())
    }

    pub fn has_session_key(&self) -> bool {
        self.inner.cipher.get().is_some()
    }

    /// True once the peer has proven it holds the same session key.
    pub fn is_confirmed(&self) -> bool {
        self.inner.is_confirmed()
    }

    /// Start a reliability window for a transfer. Chunks for unopened
    /// transfers are refused.
    pub async fn open_transfer(&self, transfer_id: u32) {
        self.inner.engine.lock().await.open(transfer_id);
    }

    /// Encrypt a chunk and hand it to the reliability engine, waiting while
    /// the transfer's unsent backlog is a full window deep.
    pub async fn submit_chunk(
        &self,
        transfer_id: u32,
        offset: u64,
        plaintext: &[u8],
    ) -> Result<(), ChannelError> {
        let cipher = self.inner.cipher.get().ok_or(ChannelError::NoSessionKey)?;
        let sealed = cipher.seal(transfer_id, offset, plaintext)?;
        let length = plaintext.len() as u32;
        let frame = Frame::data(
            transfer_id,
            offset,
            sealed.iv,
            sealed.ciphertext,
            sealed.integrity_hash,
        );

        loop {
            let notified = self.inner.backlog.notified();
            if self.is_closed() {
                return Err(self.closed_error());
            }
            {
                let mut engine = self.inner.engine.lock().await;
                let limit = engine.config().effective_window();
                let window = engine
                    .window(transfer_id)
                    .ok_or(ChannelError::UnknownTransfer(transfer_id))?;
                if window.failure().is_some() {
                    return Err(ChannelError::TransferFailed(transfer_id));
                }
                if window.backlog() < limit {
                    let frames = engine
                        .submit(transfer_id, offset, length, frame, now())
                        .unwrap_or_default();
                    drop(engine);
                    return self.inner.send_frames(frames).await;
                }
            }
            notified.await;
        }
    }

    /// Stop a transfer: drop its window and tell the peer why.
    pub async fn cancel_transfer(
        &self,
        transfer_id: u32,
        reason: CancelReason,
    ) -> Result<(), ChannelError> {
        self.close_transfer(transfer_id).await;
        self.send_control(cancel_frame(transfer_id, reason)).await
    }

    /// Drop a transfer's window without notifying the peer.
    pub async fn close_transfer(&self, transfer_id: u32) {
        self.inner.engine.lock().await.remove(transfer_id);
        self.inner.backlog.notify_waiters();
    }

    /// Chunks sent and not yet acknowledged.
    pub async fn in_flight(&self, transfer_id: u32) -> Option<usize> {
        self.inner
            .engine
            .lock()
            .await
            .window(transfer_id)
            .map(|w| w.in_flight())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    /// Resolves once the channel has stopped, with the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.close_tx.subscribe();
        wait_closed(&mut rx).await
    }

    /// Stop all tasks and close the write half.
    pub fn shutdown(&self) {
        self.inner.close(CloseReason::Shutdown);
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.counters.snapshot()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed: {0}")]
    Closed(CloseReason),

    #[error("no session key installed")]
    NoSessionKey,

    #[error("session key already installed")]
    KeyAlreadyInstalled,

    #[error("transfer {0} is not open on this channel")]
    UnknownTransfer(u32),

    #[error("transfer {0} failed after exhausting retries")]
    TransferFailed(u32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
