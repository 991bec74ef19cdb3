//! Transfer orchestrator — the top-level session object.
//!
//! Owns nothing per connection except the current link; everything about a
//! transfer lives in the shared `TransferRegistry` (runtime) and the
//! `ResumeStore` (durable). Sending spawns one chunk producer per transfer
//! that reads the source file and pushes chunks through the channel, which
//! paces them against the reliability window. Everything inbound arrives on
//! one loop (`run_inbound`) in arrival order.
//!
//! Terminal events (completed, cancelled, failed) release the registry slot.
//! Completion and cancellation delete the resume state; failure keeps it so
//! the transfer can be resumed later. A failing side tells the peer with a
//! Cancel frame marked `Failed`, and the peer keeps its state too.
//!
//! Orchestrators for different connections may share one registry. Each
//! only releases the entries it owns, except that a re-offered download
//! replaces an entry still held by an older connection to the same peer.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use skiff_core::crypto::{self, Hasher};
use skiff_core::message::{cancel_frame, CancelReason, TransferOffer, MAX_TOTAL_CHUNKS};
use skiff_core::wire::{ControlKind, Frame};
use skiff_core::{Acknowledgement, SkiffConfig};

use crate::channel::{ChannelError, ChannelHandle, ChannelInbound, DataChunk, ReliabilityEvent};
use crate::events::{EventSink, LifecycleEvent, ProgressEvent, TransferStatus};
use crate::negotiate::{negotiate_chunk_size, TransportProfile};
use crate::registry::{TransferEntry, TransferRegistry, TransferSnapshot};
use crate::resume::{chunk_count, Direction, ResumeError, ResumeState, ResumeStore};

/// Read size for whole-file hashing.
const HASH_BUF: usize = 256 * 1024;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Our own device id, for logs.
    pub device_id: String,
    /// Where received files are written.
    pub download_dir: PathBuf,
    /// Link characteristics, used to pick the chunk size.
    pub transport: TransportProfile,
}

impl OrchestratorConfig {
    pub fn from_config(config: &SkiffConfig, transport: TransportProfile) -> Self {
        Self {
            device_id: config.identity.device_id.clone(),
            download_dir: config.transfer.download_dir.clone(),
            transport,
        }
    }
}

/// Moves whole files over a transport that has its own file primitive.
pub trait BlobSender: Send + Sync {
    fn send_blob(
        &self,
        offer: &TransferOffer,
        data: Bytes,
    ) -> impl Future<Output = io::Result<()>> + Send;
}

/// The connection currently carrying transfers.
#[derive(Clone)]
struct Link {
    channel: ChannelHandle,
    peer: String,
}

struct Inner {
    /// Tags this orchestrator's registry entries.
    owner: u64,
    config: OrchestratorConfig,
    registry: Arc<TransferRegistry>,
    resume: ResumeStore,
    events: EventSink,
    link: RwLock<Option<Link>>,
    /// Outbound transfers paused by a lost connection, resumed on reattach.
    paused: Mutex<Vec<u32>>,
}

#[derive(Clone)]
pub struct TransferOrchestrator {
    inner: Arc<Inner>,
}

impl TransferOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<TransferRegistry>,
        resume: ResumeStore,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
                config,
                registry,
                resume,
                events,
                link: RwLock::new(None),
                paused: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.inner.registry
    }

    pub fn resume_store(&self) -> &ResumeStore {
        &self.inner.resume
    }

    pub fn events(&self) -> &EventSink {
        &self.inner.events
    }

    fn entry(&self, state: &ResumeState) -> TransferEntry {
        TransferEntry::from_state(state, self.inner.owner)
    }

    /// Release one of our own registry entries.
    fn release(&self, transfer_id: u32) -> Option<TransferEntry> {
        let owner = self.inner.owner;
        self.inner.registry.release_if(transfer_id, |e| e.owner == owner)
    }

    // ── Link ──────────────────────────────────────────────────────────────────

    /// Bind to an established, keyed channel.
    pub async fn attach(&self, channel: ChannelHandle, peer: impl Into<String>) {
        let peer = peer.into();
        info!(device = %self.inner.config.device_id, peer = %peer, "peer attached");
        *self.inner.link.write().await = Some(Link {
            channel,
            peer: peer.clone(),
        });
        self.inner
            .events
            .lifecycle(LifecycleEvent::Connected { peer })
            .await;
    }

    /// Drop the link and pause every transfer running over it. Outbound
    /// transfers are remembered for `resume_paused`; their ids are returned.
    pub async fn detach(&self) -> Vec<u32> {
        let Some(link) = self.inner.link.write().await.take() else {
            return Vec::new();
        };
        link.channel.shutdown();

        let mut outbound = Vec::new();
        for direction in [Direction::Send, Direction::Receive] {
            for id in self.inner.registry.ids_for(self.inner.owner, direction, &link.peer) {
                let Some(entry) = self.release(id) else {
                    continue;
                };
                if let Some(task) = entry.task {
                    task.abort();
                }
                self.inner.events.progress(ProgressEvent {
                    transfer_id: id,
                    bytes_transferred: entry.bytes_done,
                    total_bytes: entry.total_size,
                    status: TransferStatus::Paused,
                });
                self.inner
                    .events
                    .lifecycle(LifecycleEvent::Paused { transfer_id: id })
                    .await;
                if direction == Direction::Send {
                    outbound.push(id);
                }
            }
        }
        info!(peer = %link.peer, paused = outbound.len(), "peer detached");
        self.inner.paused.lock().await.extend(outbound.iter().copied());
        outbound
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.link.read().await.is_some()
    }

    pub async fn peer_device(&self) -> Option<String> {
        self.inner.link.read().await.as_ref().map(|l| l.peer.clone())
    }

    async fn link(&self) -> Result<Link, TransferError> {
        self.inner
            .link
            .read()
            .await
            .clone()
            .ok_or(TransferError::NotConnected)
    }

    /// Restart every transfer paused by `detach`. Failures are reported as
    /// lifecycle events; the ids that restarted are returned.
    pub async fn resume_paused(&self) -> Vec<u32> {
        let ids = std::mem::take(&mut *self.inner.paused.lock().await);
        let mut resumed = Vec::new();
        for id in ids {
            match self.resume_transfer(id).await {
                Ok(()) => resumed.push(id),
                Err(e) => {
                    warn!(transfer_id = id, error = %e, "paused transfer not resumed");
                    self.inner
                        .events
                        .lifecycle(LifecycleEvent::Failed {
                            transfer_id: id,
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        }
        resumed
    }

    // ── Local operations ──────────────────────────────────────────────────────

    /// Offer a file to the peer and start sending it. Returns the new
    /// transfer id. Fails at once if the concurrency cap is reached.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<u32, TransferError> {
        let link = self.link().await?;
        let path = path.as_ref().to_path_buf();
        let (file_name, total_size) = inspect_source(&path).await?;
        let chunk_size = negotiate_chunk_size(&self.inner.config.transport);
        if chunk_count(total_size, chunk_size) > MAX_TOTAL_CHUNKS {
            return Err(TransferError::TooLarge {
                size: total_size,
                chunk_size,
            });
        }

        let transfer_id = self.inner.registry.allocate_id();
        let mut state = ResumeState::new(
            transfer_id,
            &link.peer,
            Direction::Send,
            &path,
            file_name,
            total_size,
            chunk_size,
            None,
        );
        self.inner.registry.reserve(self.entry(&state))?;

        match hash_file(&path).await {
            Ok(hash) => state.file_hash = Some(hash),
            Err(source) => {
                self.release(transfer_id);
                return Err(TransferError::Io { path, source });
            }
        }
        self.start_sending(&link, state, false).await?;
        Ok(transfer_id)
    }

    /// Continue an interrupted outbound transfer from its resume state.
    /// Only the chunks the peer never acknowledged are sent.
    pub async fn resume_transfer(&self, transfer_id: u32) -> Result<(), TransferError> {
        let link = self.link().await?;
        let state = self
            .inner
            .resume
            .load(transfer_id, &link.peer)?
            .ok_or(TransferError::NoResumeState(transfer_id))?;
        if state.direction != Direction::Send {
            return Err(TransferError::NotResumable(transfer_id));
        }

        let (_, size) = inspect_source(&state.file_path).await?;
        if size != state.total_size {
            return Err(TransferError::SourceChanged(state.file_path));
        }
        self.inner.registry.reserve(self.entry(&state))?;

        if let Some(expected) = state.file_hash {
            let actual = hash_file(&state.file_path).await;
            if !matches!(actual, Ok(h) if h == expected) {
                self.release(transfer_id);
                return Err(TransferError::SourceChanged(state.file_path));
            }
        }
        self.start_sending(&link, state, true).await
    }

    /// Abort a transfer in either direction and forget it.
    pub async fn cancel_transfer(&self, transfer_id: u32) -> Result<(), TransferError> {
        let entry = self
            .inner
            .registry
            .release(transfer_id)
            .ok_or(TransferError::UnknownTransfer(transfer_id))?;
        if let Some(task) = entry.task {
            task.abort();
        }
        if let Ok(link) = self.link().await {
            if let Err(e) = link.channel.cancel_transfer(transfer_id, CancelReason::Aborted).await {
                debug!(transfer_id, error = %e, "cancel not delivered");
            }
        }
        self.inner.resume.delete(transfer_id, &entry.peer);
        info!(transfer_id, "transfer cancelled");
        self.report(transfer_id, entry.bytes_done, entry.total_size, TransferStatus::Cancelled);
        self.inner
            .events
            .lifecycle(LifecycleEvent::Cancelled { transfer_id })
            .await;
        Ok(())
    }

    /// Hand a whole file to a blob transport as one unit.
    pub async fn send_blob<B: BlobSender>(
        &self,
        path: impl AsRef<Path>,
        peer: &str,
        blob: &B,
    ) -> Result<u32, TransferError> {
        let path = path.as_ref().to_path_buf();
        let (file_name, total_size) = inspect_source(&path).await?;
        let unit = u32::try_from(total_size).map_err(|_| TransferError::BlobTooLarge(total_size))?;

        let transfer_id = self.inner.registry.allocate_id();
        let state = ResumeState::new(
            transfer_id,
            peer,
            Direction::Send,
            &path,
            file_name,
            total_size,
            unit,
            None,
        );
        self.inner.registry.reserve(self.entry(&state))?;
        self.deliver_blob(state, blob, false).await?;
        Ok(transfer_id)
    }

    /// Re-send a blob whose previous attempt failed. The whole unit goes
    /// again; a completed blob has no state left and is not found.
    pub async fn resume_blob<B: BlobSender>(
        &self,
        transfer_id: u32,
        peer: &str,
        blob: &B,
    ) -> Result<(), TransferError> {
        let state = self
            .inner
            .resume
            .load(transfer_id, peer)?
            .ok_or(TransferError::NoResumeState(transfer_id))?;
        if state.direction != Direction::Send || state.total_chunks != 1 {
            return Err(TransferError::NotResumable(transfer_id));
        }
        self.inner.registry.reserve(self.entry(&state))?;
        self.deliver_blob(state, blob, true).await
    }

    async fn deliver_blob<B: BlobSender>(
        &self,
        mut state: ResumeState,
        blob: &B,
        resumed: bool,
    ) -> Result<(), TransferError> {
        let transfer_id = state.transfer_id;
        let data = match tokio::fs::read(&state.file_path).await {
            Ok(data) if data.len() as u64 == state.total_size => Bytes::from(data),
            Ok(_) => {
                self.release(transfer_id);
                return Err(TransferError::SourceChanged(state.file_path));
            }
            Err(source) => {
                self.release(transfer_id);
                return Err(TransferError::Io {
                    path: state.file_path,
                    source,
                });
            }
        };
        state.file_hash = Some(crypto::hash(&data));
        self.inner.resume.save(state.clone());
        self.announce(&state, resumed).await;

        let result = blob.send_blob(&offer_for(&state, resumed), data).await;
        self.release(transfer_id);
        match result {
            Ok(()) => {
                self.inner.resume.delete(transfer_id, &state.device_id);
                info!(transfer_id, bytes = state.total_size, "blob delivered");
                self.report(transfer_id, state.total_size, state.total_size, TransferStatus::Completed);
                self.inner
                    .events
                    .lifecycle(LifecycleEvent::Completed {
                        transfer_id,
                        direction: Direction::Send,
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(transfer_id, error = %e, "blob transport failed");
                self.report(transfer_id, 0, state.total_size, TransferStatus::Failed);
                self.inner
                    .events
                    .lifecycle(LifecycleEvent::Failed {
                        transfer_id,
                        reason: e.to_string(),
                    })
                    .await;
                Err(TransferError::Blob(e))
            }
        }
    }

    /// A running transfer, or a paused one that still has resume state.
    pub fn status(&self, transfer_id: u32) -> Option<TransferSnapshot> {
        self.inner.registry.snapshot(transfer_id).or_else(|| {
            self.inner
                .resume
                .cached()
                .iter()
                .find(|s| s.transfer_id == transfer_id)
                .map(TransferSnapshot::paused)
        })
    }

    /// Running transfers plus paused ones that can still be resumed.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let mut all = self.inner.registry.list();
        for state in self.inner.resume.cached() {
            if !self.inner.registry.contains(state.transfer_id) {
                all.push(TransferSnapshot::paused(&state));
            }
        }
        all.sort_by_key(|s| s.transfer_id);
        all
    }

    /// Outbound transfers currently running over the attached link.
    pub async fn active_outbound(&self) -> Vec<u32> {
        match self.peer_device().await {
            Some(peer) => self.inner.registry.ids_for(self.inner.owner, Direction::Send, &peer),
            None => Vec::new(),
        }
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Persist the state, offer the transfer and spawn its chunk producer.
    /// The registry slot must already be held.
    async fn start_sending(
        &self,
        link: &Link,
        state: ResumeState,
        resumed: bool,
    ) -> Result<(), TransferError> {
        let transfer_id = state.transfer_id;
        self.inner.resume.save(state.clone());

        let offered = async {
            let frame = offer_for(&state, resumed).to_frame(transfer_id)?;
            link.channel.open_transfer(transfer_id).await;
            link.channel.send_control(frame).await?;
            Ok::<_, TransferError>(())
        }
        .await;
        if let Err(e) = offered {
            self.release(transfer_id);
            link.channel.close_transfer(transfer_id).await;
            return Err(e);
        }

        self.announce(&state, resumed).await;
        let missing = state.bitmap.missing();
        if missing.is_empty() {
            self.finish_send(link, transfer_id).await;
            return Ok(());
        }

        let task = tokio::spawn(self.clone().produce_chunks(link.channel.clone(), state, missing));
        // The transfer may already have finished and released its entry.
        self.inner.registry.with_entry(transfer_id, |e| e.task = Some(task));
        Ok(())
    }

    /// Read the listed chunks from disk and submit them in order.
    async fn produce_chunks(self, channel: ChannelHandle, state: ResumeState, indices: Vec<u64>) {
        let transfer_id = state.transfer_id;
        let io_err = |source: io::Error| TransferError::Io {
            path: state.file_path.clone(),
            source,
        };
        let result = async {
            let mut file = tokio::fs::File::open(&state.file_path).await.map_err(io_err)?;
            let mut buf = vec![0u8; state.chunk_size as usize];
            for index in indices {
                let (offset, len) = state.chunk_range(index);
                let chunk = &mut buf[..len as usize];
                file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
                file.read_exact(chunk).await.map_err(io_err)?;
                channel.submit_chunk(transfer_id, offset, chunk).await?;
            }
            Ok::<_, TransferError>(())
        }
        .await;

        match result {
            Ok(()) => debug!(transfer_id, "all chunks submitted"),
            // Connection loss, cancellation and retry exhaustion are reported
            // by the paths that observe them.
            Err(TransferError::Channel(
                ChannelError::Closed(_) | ChannelError::UnknownTransfer(_) | ChannelError::TransferFailed(_),
            )) => debug!(transfer_id, "chunk producer stopped"),
            Err(e) => {
                warn!(transfer_id, error = %e, "chunk producer failed");
                if let Err(e) = channel.cancel_transfer(transfer_id, CancelReason::Failed).await {
                    debug!(transfer_id, error = %e, "cancel not delivered");
                }
                self.fail(transfer_id, e.to_string(), false).await;
            }
        }
    }

    async fn finish_send(&self, link: &Link, transfer_id: u32) {
        link.channel.close_transfer(transfer_id).await;
        let Some(entry) = self.release(transfer_id) else {
            return;
        };
        self.inner.resume.delete(transfer_id, &link.peer);
        info!(
            transfer_id,
            peer = %link.peer,
            bytes = entry.total_size,
            elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
            "transfer sent"
        );
        self.report(transfer_id, entry.total_size, entry.total_size, TransferStatus::Completed);
        self.inner
            .events
            .lifecycle(LifecycleEvent::Completed {
                transfer_id,
                direction: Direction::Send,
            })
            .await;
    }

    /// Terminal failure. The resume state is kept.
    async fn fail(&self, transfer_id: u32, reason: String, abort_task: bool) {
        let Some(entry) = self.release(transfer_id) else {
            return;
        };
        if abort_task {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        warn!(transfer_id, reason = %reason, "transfer failed");
        self.report(transfer_id, entry.bytes_done, entry.total_size, TransferStatus::Failed);
        self.inner
            .events
            .lifecycle(LifecycleEvent::Failed { transfer_id, reason })
            .await;
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Process everything the channel delivers until its control stream
    /// ends. Control frames are taken first so an offer is always handled
    /// before the data that follows it.
    pub async fn run_inbound(&self, inbound: ChannelInbound) {
        let ChannelInbound {
            mut control,
            mut data,
            mut reliability,
        } = inbound;
        loop {
            tokio::select! {
                biased;
                frame = control.recv() => match frame {
                    Some(frame) => self.on_control(frame).await,
                    None => break,
                },
                Some(chunk) = data.recv() => self.on_chunk(chunk).await,
                Some(event) = reliability.recv() => self.on_reliability(event).await,
            }
        }
        debug!("inbound stream ended");
    }

    async fn on_control(&self, frame: Frame) {
        match frame.control_kind() {
            Some(ControlKind::Handshake) if frame.transfer_id != 0 => {
                self.on_offer(frame.transfer_id, &frame.payload).await
            }
            Some(ControlKind::Cancel) => {
                let reason = CancelReason::from_payload(&frame.payload);
                self.on_peer_cancel(frame.transfer_id, reason).await
            }
            other => debug!(kind = ?other, transfer_id = frame.transfer_id, "control frame ignored"),
        }
    }

    async fn on_offer(&self, transfer_id: u32, payload: &[u8]) {
        let Ok(link) = self.link().await else {
            return;
        };
        let result = match TransferOffer::from_payload(payload) {
            Ok(offer) => match offer.check() {
                Ok(()) => self.accept_offer(&link, transfer_id, &offer).await,
                Err(why) => Err(TransferError::InvalidOffer(why.into())),
            },
            Err(e) => Err(TransferError::InvalidOffer(e.to_string())),
        };
        if let Err(e) = result {
            warn!(transfer_id, peer = %link.peer, error = %e, "refusing transfer offer");
            let refusal = cancel_frame(transfer_id, CancelReason::Aborted);
            if let Err(e) = link.channel.send_control(refusal).await {
                debug!(transfer_id, error = %e, "refusal not delivered");
            }
        }
    }

    async fn accept_offer(
        &self,
        link: &Link,
        transfer_id: u32,
        offer: &TransferOffer,
    ) -> Result<(), TransferError> {
        // The peer reconnected before the old connection was noticed dead.
        let owner = self.inner.owner;
        let stale = self.inner.registry.release_if(transfer_id, |e| {
            e.owner != owner && e.direction == Direction::Receive && e.peer == link.peer
        });
        if let Some(stale) = stale {
            if let Some(task) = stale.task {
                task.abort();
            }
            info!(transfer_id, peer = %link.peer, "taking over transfer from a stale connection");
        }

        let previous = if offer.resume {
            self.inner.resume.load(transfer_id, &link.peer)?
        } else {
            None
        };
        let state = match previous {
            Some(s)
                if s.direction == Direction::Receive
                    && s.total_size == offer.total_size
                    && s.chunk_size == offer.chunk_size
                    && s.file_path.exists() =>
            {
                s
            }
            // the sender will only send what it thinks is missing
            _ if offer.resume => return Err(TransferError::NoResumeState(transfer_id)),
            _ => ResumeState::new(
                transfer_id,
                &link.peer,
                Direction::Receive,
                self.inner.config.download_dir.join(&offer.file_name),
                &offer.file_name,
                offer.total_size,
                offer.chunk_size,
                offer.file_hash,
            ),
        };
        let resumed = state.bitmap.count_set() > 0;

        self.inner.registry.reserve(self.entry(&state))?;
        let sink = match open_sink(&state.file_path, state.total_size, resumed).await {
            Ok(file) => Arc::new(Mutex::new(file)),
            Err(source) => {
                self.release(transfer_id);
                return Err(TransferError::Io {
                    path: state.file_path,
                    source,
                });
            }
        };
        self.inner
            .registry
            .with_entry(transfer_id, |e| e.sink = Some(sink));
        self.inner.resume.save(state.clone());

        info!(
            transfer_id,
            peer = %link.peer,
            file = %state.file_name,
            bytes = state.total_size,
            resumed,
            "accepted transfer"
        );
        self.announce(&state, resumed).await;
        Ok(())
    }

    async fn on_chunk(&self, chunk: DataChunk) {
        let Ok(link) = self.link().await else {
            return;
        };
        let transfer_id = chunk.transfer_id;
        let offset = chunk.offset;
        let owner = self.inner.owner;
        let target = self
            .inner
            .registry
            .with_entry(transfer_id, |e| {
                (e.owner == owner).then(|| (e.direction, e.sink.clone(), chunk_geometry(e, offset)))
            })
            .flatten();
        let Some((Direction::Receive, Some(sink), geometry)) = target else {
            debug!(transfer_id, offset, "chunk for no active download");
            return;
        };

        if crypto::hash(&chunk.plaintext) != chunk.integrity_hash {
            self.chunk_error(transfer_id, offset, "integrity hash mismatch").await;
            return;
        }
        let Some((index, expected_len)) = geometry else {
            self.chunk_error(transfer_id, offset, "offset is not a chunk boundary").await;
            return;
        };
        if chunk.plaintext.len() as u64 != expected_len as u64 {
            self.chunk_error(transfer_id, offset, "unexpected chunk length").await;
            return;
        }

        let ack = Acknowledgement {
            transfer_id,
            offset,
            length: expected_len,
        };
        if self.inner.resume.is_chunk_received(transfer_id, &link.peer, index) {
            // already on disk; the earlier ack was lost
            self.send_ack(&link, ack).await;
            return;
        }

        let written = {
            let mut file = sink.lock().await;
            write_at(&mut file, offset, &chunk.plaintext).await
        };
        if let Err(e) = written {
            self.chunk_error(transfer_id, offset, &format!("write failed: {e}")).await;
            return;
        }
        self.inner.resume.mark_chunk_received(transfer_id, &link.peer, index);
        self.send_ack(&link, ack).await;

        if let Some((done, total)) = self.inner.registry.with_entry(transfer_id, |e| {
            e.bytes_done += expected_len as u64;
            (e.bytes_done, e.total_size)
        }) {
            self.report(transfer_id, done, total, TransferStatus::InProgress);
        }
        if self.inner.resume.is_complete(transfer_id, &link.peer) {
            self.finish_receive(&link, transfer_id, sink).await;
        }
    }

    async fn send_ack(&self, link: &Link, ack: Acknowledgement) {
        if let Err(e) = link.channel.send_control(ack.into_frame()).await {
            debug!(transfer_id = ack.transfer_id, offset = ack.offset, error = %e, "ack not sent");
        }
    }

    async fn chunk_error(&self, transfer_id: u32, offset: u64, reason: &str) {
        warn!(transfer_id, offset, reason, "chunk rejected");
        self.inner
            .events
            .lifecycle(LifecycleEvent::ChunkError {
                transfer_id,
                offset,
                reason: reason.to_string(),
            })
            .await;
    }

    async fn finish_receive(&self, link: &Link, transfer_id: u32, sink: Arc<Mutex<tokio::fs::File>>) {
        {
            let mut file = sink.lock().await;
            if let Err(e) = file.flush().await {
                warn!(transfer_id, error = %e, "flush failed");
            }
            if let Err(e) = file.sync_all().await {
                warn!(transfer_id, error = %e, "fsync failed");
            }
        }
        let expected = self
            .inner
            .resume
            .load(transfer_id, &link.peer)
            .ok()
            .flatten()
            .and_then(|s| s.file_hash);
        let Some(entry) = self.release(transfer_id) else {
            return;
        };
        self.inner.resume.delete(transfer_id, &link.peer);

        let verdict = match expected {
            None => Ok(()),
            Some(expected) => match hash_file(&entry.file_path).await {
                Ok(actual) if actual == expected => Ok(()),
                Ok(_) => Err("whole-file hash mismatch".to_string()),
                Err(e) => Err(format!("could not verify file: {e}")),
            },
        };
        match verdict {
            Ok(()) => {
                info!(
                    transfer_id,
                    peer = %link.peer,
                    path = %entry.file_path.display(),
                    bytes = entry.total_size,
                    elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                    "transfer received"
                );
                self.report(transfer_id, entry.total_size, entry.total_size, TransferStatus::Completed);
                self.inner
                    .events
                    .lifecycle(LifecycleEvent::Completed {
                        transfer_id,
                        direction: Direction::Receive,
                    })
                    .await;
            }
            Err(reason) => {
                warn!(transfer_id, reason = %reason, "received file rejected");
                self.report(transfer_id, entry.bytes_done, entry.total_size, TransferStatus::Failed);
                self.inner
                    .events
                    .lifecycle(LifecycleEvent::Failed { transfer_id, reason })
                    .await;
            }
        }
    }

    async fn on_reliability(&self, event: ReliabilityEvent) {
        let Ok(link) = self.link().await else {
            return;
        };
        match event {
            ReliabilityEvent::Delivered {
                transfer_id,
                offset,
                length,
            } => {
                let Some((done, total, index)) = self.inner.registry.with_entry(transfer_id, |e| {
                    e.bytes_done += length as u64;
                    let index = offset / (e.chunk_size.max(1) as u64);
                    (e.bytes_done, e.total_size, index)
                }) else {
                    return;
                };
                self.inner.resume.mark_chunk_received(transfer_id, &link.peer, index);
                self.report(transfer_id, done, total, TransferStatus::InProgress);
                if self.inner.resume.is_complete(transfer_id, &link.peer) {
                    self.finish_send(&link, transfer_id).await;
                }
            }
            ReliabilityEvent::Failed(failure) => {
                let transfer_id = failure.transfer_id;
                if let Err(e) = link.channel.cancel_transfer(transfer_id, CancelReason::Failed).await {
                    debug!(transfer_id, error = %e, "cancel not delivered");
                }
                let reason = format!(
                    "chunk at offset {} unacknowledged after {} retries",
                    failure.offset, failure.retries
                );
                self.fail(transfer_id, reason, true).await;
            }
        }
    }

    async fn on_peer_cancel(&self, transfer_id: u32, reason: CancelReason) {
        let Some(entry) = self.release(transfer_id) else {
            debug!(transfer_id, "cancel for unknown transfer");
            return;
        };
        if let Some(task) = entry.task {
            task.abort();
        }
        if let Ok(link) = self.link().await {
            link.channel.close_transfer(transfer_id).await;
        }
        match reason {
            CancelReason::Aborted => {
                self.inner.resume.delete(transfer_id, &entry.peer);
                info!(transfer_id, peer = %entry.peer, "transfer cancelled by peer");
                self.report(transfer_id, entry.bytes_done, entry.total_size, TransferStatus::Cancelled);
                self.inner
                    .events
                    .lifecycle(LifecycleEvent::Cancelled { transfer_id })
                    .await;
            }
            CancelReason::Failed => {
                warn!(transfer_id, peer = %entry.peer, "peer gave up on transfer, keeping resume state");
                self.report(transfer_id, entry.bytes_done, entry.total_size, TransferStatus::Failed);
                self.inner
                    .events
                    .lifecycle(LifecycleEvent::Failed {
                        transfer_id,
                        reason: "peer gave up on the transfer".into(),
                    })
                    .await;
            }
        }
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    fn report(&self, transfer_id: u32, bytes: u64, total: u64, status: TransferStatus) {
        self.inner.events.progress(ProgressEvent {
            transfer_id,
            bytes_transferred: bytes,
            total_bytes: total,
            status,
        });
    }

    async fn announce(&self, state: &ResumeState, resumed: bool) {
        let event = if resumed {
            LifecycleEvent::Resumed {
                transfer_id: state.transfer_id,
                direction: state.direction,
                remaining_chunks: state.total_chunks - state.bitmap.count_set(),
            }
        } else {
            LifecycleEvent::Started {
                transfer_id: state.transfer_id,
                direction: state.direction,
                file_name: state.file_name.clone(),
                total_bytes: state.total_size,
            }
        };
        self.inner.events.lifecycle(event).await;
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn offer_for(state: &ResumeState, resume: bool) -> TransferOffer {
    TransferOffer {
        file_name: state.file_name.clone(),
        total_size: state.total_size,
        chunk_size: state.chunk_size,
        total_chunks: state.total_chunks,
        file_hash: state.file_hash,
        resume,
    }
}

/// `(index, length)` of the chunk starting at `offset`, if it starts one.
fn chunk_geometry(entry: &TransferEntry, offset: u64) -> Option<(u64, u32)> {
    let size = entry.chunk_size as u64;
    if size == 0 || offset % size != 0 {
        return None;
    }
    let index = offset / size;
    if index >= entry.total_chunks {
        return None;
    }
    let len = entry.total_size.saturating_sub(offset).min(size);
    Some((index, len as u32))
}

/// File name and size of a regular file.
async fn inspect_source(path: &Path) -> Result<(String, u64), TransferError> {
    let meta = tokio::fs::metadata(path).await.map_err(|source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let name = path.file_name().and_then(|n| n.to_str());
    match name {
        Some(name) if meta.is_file() => Ok((name.to_string(), meta.len())),
        _ => Err(TransferError::InvalidSource(path.to_path_buf())),
    }
}

/// BLAKE3 of a whole file.
pub async fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; HASH_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Open the destination at its final size. A resumed download keeps what is
/// already on disk.
async fn open_sink(path: &Path, size: u64, resumed: bool) -> io::Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(!resumed)
        .open(path)
        .await?;
    file.set_len(size).await?;
    Ok(file)
}

async fn write_at(file: &mut tokio::fs::File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer capacity reached ({active}/{limit} active)")]
    Capacity { active: usize, limit: usize },

    #[error("transfer {0} is already active")]
    DuplicateTransfer(u32),

    #[error("transfer {0} is not active")]
    UnknownTransfer(u32),

    #[error("no connected peer")]
    NotConnected,

    #[error("no resume state for transfer {0}")]
    NoResumeState(u32),

    #[error("transfer {0} cannot be resumed from this side")]
    NotResumable(u32),

    #[error("source {} changed since the transfer started", .0.display())]
    SourceChanged(PathBuf),

    #[error("{} is not a regular file with a UTF-8 name", .0.display())]
    InvalidSource(PathBuf),

    #[error("invalid transfer offer: {0}")]
    InvalidOffer(String),

    #[error("{0} bytes is too large for a single blob")]
    BlobTooLarge(u64),

    #[error("{size} bytes is too large to send in {chunk_size}-byte chunks")]
    TooLarge { size: u64, chunk_size: u32 },

    #[error("I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to encode transfer offer: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("blob transport failed: {0}")]
    Blob(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_dir(tag: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("skiff-orch-{tag}-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn orchestrator(dir: &Path) -> (TransferOrchestrator, crate::events::EventStreams) {
        let (sink, streams) = event_channel(64);
        let orch = TransferOrchestrator::new(
            OrchestratorConfig {
                device_id: "laptop".into(),
                download_dir: dir.join("downloads"),
                transport: TransportProfile::standard(),
            },
            TransferRegistry::shared(5),
            ResumeStore::in_memory(),
            sink,
        );
        (orch, streams)
    }

    struct RecordingBlob {
        sent: std::sync::Mutex<Vec<(TransferOffer, Bytes)>>,
        fail: bool,
    }

    impl BlobSender for RecordingBlob {
        async fn send_blob(&self, offer: &TransferOffer, data: Bytes) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
            }
            self.sent.lock().unwrap().push((offer.clone(), data));
            Ok(())
        }
    }

    #[test]
    fn geometry_accepts_only_chunk_boundaries() {
        let state = ResumeState::new(1, "p", Direction::Receive, "/tmp/x", "x", 10, 4, None);
        let entry = TransferEntry::from_state(&state, 1);
        assert_eq!(chunk_geometry(&entry, 0), Some((0, 4)));
        assert_eq!(chunk_geometry(&entry, 8), Some((2, 2)));
        assert_eq!(chunk_geometry(&entry, 3), None);
        assert_eq!(chunk_geometry(&entry, 12), None);
    }

    #[tokio::test]
    async fn send_without_peer_is_refused() {
        let dir = temp_dir("nopeer");
        let (orch, _streams) = orchestrator(&dir);
        let err = orch.send_file(dir.join("missing")).await.unwrap_err();
        assert!(matches!(err, TransferError::NotConnected));
        assert!(orch.list().is_empty());
    }

    #[tokio::test]
    async fn hash_file_matches_in_memory_hash() {
        let dir = temp_dir("hash");
        let path = dir.join("data.bin");
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).await.unwrap(), crypto::hash(&data));
    }

    #[tokio::test]
    async fn blob_is_one_unit_and_cleans_up() {
        let dir = temp_dir("blob");
        let path = dir.join("photo.jpg");
        std::fs::write(&path, b"not really a jpeg").unwrap();
        let (orch, mut streams) = orchestrator(&dir);
        let blob = RecordingBlob {
            sent: Default::default(),
            fail: false,
        };

        let id = orch.send_blob(&path, "phone", &blob).await.unwrap();
        let sent = blob.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.total_chunks, 1);
        assert_eq!(&sent[0].1[..], b"not really a jpeg");
        assert!(orch.list().is_empty());
        assert!(orch.resume_store().load(id, "phone").unwrap().is_none());

        assert!(matches!(
            streams.lifecycle.recv().await,
            Some(LifecycleEvent::Started { .. })
        ));
        assert!(matches!(
            streams.lifecycle.recv().await,
            Some(LifecycleEvent::Completed { transfer_id, .. }) if transfer_id == id
        ));
    }

    #[tokio::test]
    async fn failed_blob_keeps_state_for_resume() {
        let dir = temp_dir("blobfail");
        let path = dir.join("notes.txt");
        std::fs::write(&path, b"draft").unwrap();
        let (orch, mut streams) = orchestrator(&dir);
        let broken = RecordingBlob {
            sent: Default::default(),
            fail: true,
        };

        let err = orch.send_blob(&path, "phone", &broken).await.unwrap_err();
        assert!(matches!(err, TransferError::Blob(_)));
        assert_eq!(orch.registry().active_count(), 0);

        let Some(LifecycleEvent::Started { transfer_id: id, .. }) = streams.lifecycle.recv().await
        else {
            panic!("expected a started event");
        };
        assert!(matches!(
            streams.lifecycle.recv().await,
            Some(LifecycleEvent::Failed { transfer_id, .. }) if transfer_id == id
        ));
        assert!(orch.resume_store().load(id, "phone").unwrap().is_some());

        let working = RecordingBlob {
            sent: Default::default(),
            fail: false,
        };
        orch.resume_blob(id, "phone", &working).await.unwrap();
        assert_eq!(working.sent.lock().unwrap().len(), 1);
        assert!(working.sent.lock().unwrap()[0].0.resume);
        assert!(orch.resume_store().load(id, "phone").unwrap().is_none());
    }
}
