//! Reliability engine — per-transfer sliding windows of in-flight chunks.
//!
//! Chunks get increasing sequence numbers on submission. Sequence `s` may be
//! sent only while `s < base + window`, where `base` is the oldest chunk not
//! yet acknowledged. Acks are not cumulative: each one confirms exactly the
//! chunk whose `(transfer_id, offset, length)` it names.
//!
//! The engine does no I/O and reads no clock. Callers pass `Instant`s in and
//! get frames to write back out, so every transition is deterministic under
//! test. The channel multiplexer drives it from the reader task (acks) and a
//! tokio interval (timeouts).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use skiff_core::config::{TransferConfig, MAX_WINDOW_SIZE};
use skiff_core::{Acknowledgement, Frame};

/// Window, timeout and retry limits shared by every transfer on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityConfig {
    pub window: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            window: 4,
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl From<&TransferConfig> for ReliabilityConfig {
    fn from(t: &TransferConfig) -> Self {
        Self {
            window: t.window(),
            ack_timeout: t.ack_timeout(),
            max_retries: t.max_retries,
        }
    }
}

impl ReliabilityConfig {
    /// Window clamped to [1, 16].
    pub fn effective_window(&self) -> usize {
        self.window.clamp(1, MAX_WINDOW_SIZE)
    }
}

/// One submitted chunk, from submission until it slides out of the window.
#[derive(Debug, Clone)]
struct ChunkState {
    seq: u64,
    offset: u64,
    /// Plaintext length, echoed back in the ack.
    length: u32,
    frame: Frame,
    acked: bool,
    in_flight: bool,
    retries: u32,
    last_sent: Option<Instant>,
}

/// Result of applying an acknowledgement.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// First ack for this chunk. `unblocked` are frames the slide made
    /// sendable and that must go out now.
    Delivered {
        seq: u64,
        offset: u64,
        length: u32,
        unblocked: Vec<Frame>,
    },
    /// Already acknowledged.
    Duplicate,
    /// No in-window chunk matches: unknown transfer, slid-out chunk, or a
    /// length that does not match.
    Unmatched,
}

/// A chunk that ran out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFailure {
    pub transfer_id: u32,
    pub seq: u64,
    pub offset: u64,
    pub retries: u32,
}

/// What a timer tick asks the caller to do.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub resend: Vec<Frame>,
    pub failed: Vec<ChunkFailure>,
}

// ── Transfer window ───────────────────────────────────────────────────────────

/// Sliding window for one transfer.
#[derive(Debug)]
pub struct TransferWindow {
    transfer_id: u32,
    config: ReliabilityConfig,
    next_seq: u64,
    /// Sequence number of `chunks[0]`.
    base: u64,
    chunks: VecDeque<ChunkState>,
    failed: Option<ChunkFailure>,
}

impl TransferWindow {
    pub fn new(transfer_id: u32, config: ReliabilityConfig) -> Self {
        Self {
            transfer_id,
            config,
            next_seq: 0,
            base: 0,
            chunks: VecDeque::new(),
            failed: None,
        }
    }

    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    /// Queue a chunk and return its sequence number. Nothing is sent until
    /// `pump`.
    pub fn submit(&mut self, offset: u64, length: u32, frame: Frame) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.chunks.push_back(ChunkState {
            seq,
            offset,
            length,
            frame,
            acked: false,
            in_flight: false,
            retries: 0,
            last_sent: None,
        });
        seq
    }

    /// Send every queued chunk the window allows. Returns the frames to write.
    pub fn pump(&mut self, now: Instant) -> Vec<Frame> {
        if self.failed.is_some() {
            return Vec::new();
        }
        let window = self.config.effective_window();
        self.chunks
            .iter_mut()
            .take(window)
            .filter(|c| c.last_sent.is_none())
            .map(|c| {
                c.in_flight = true;
                c.last_sent = Some(now);
                c.frame.clone()
            })
            .collect()
    }

    /// Apply an acknowledgement, slide the window, and send what it unblocks.
    pub fn on_ack(&mut self, ack: &Acknowledgement, now: Instant) -> AckOutcome {
        let Some(chunk) = self
            .chunks
            .iter_mut()
            .find(|c| c.offset == ack.offset && c.length == ack.length)
        else {
            return AckOutcome::Unmatched;
        };
        if chunk.acked {
            return AckOutcome::Duplicate;
        }
        chunk.acked = true;
        chunk.in_flight = false;
        let (seq, offset, length) = (chunk.seq, chunk.offset, chunk.length);

        while self.chunks.front().is_some_and(|c| c.acked) {
            self.chunks.pop_front();
            self.base += 1;
        }

        AckOutcome::Delivered {
            seq,
            offset,
            length,
            unblocked: self.pump(now),
        }
    }

    /// Resend chunks whose ack timed out. A chunk past `max_retries` fails
    /// the whole window; a failed window never sends again.
    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        let mut out = TickOutcome::default();
        if self.failed.is_some() {
            return out;
        }
        for chunk in self.chunks.iter_mut().filter(|c| c.in_flight) {
            let Some(sent) = chunk.last_sent else { continue };
            if now.saturating_duration_since(sent) < self.config.ack_timeout {
                continue;
            }
            if chunk.retries >= self.config.max_retries {
                chunk.in_flight = false;
                let failure = ChunkFailure {
                    transfer_id: self.transfer_id,
                    seq: chunk.seq,
                    offset: chunk.offset,
                    retries: chunk.retries,
                };
                self.failed = Some(failure);
                out.failed.push(failure);
                out.resend.clear();
                return out;
            }
            chunk.retries += 1;
            chunk.last_sent = Some(now);
            out.resend.push(chunk.frame.clone());
        }
        out
    }

    /// Chunks submitted but never sent.
    pub fn backlog(&self) -> usize {
        self.chunks.iter().filter(|c| c.last_sent.is_none()).count()
    }

    pub fn in_flight(&self) -> usize {
        self.chunks.iter().filter(|c| c.in_flight).count()
    }

    /// Everything submitted has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn failure(&self) -> Option<ChunkFailure> {
        self.failed
    }

    /// Oldest unacknowledged sequence number.
    pub fn base(&self) -> u64 {
        self.base
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// All transfer windows on one channel, keyed by transfer id.
#[derive(Debug)]
pub struct ReliabilityEngine {
    config: ReliabilityConfig,
    windows: HashMap<u32, TransferWindow>,
}

impl ReliabilityEngine {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Start tracking a transfer. Reopening an existing id replaces its
    /// window.
    pub fn open(&mut self, transfer_id: u32) {
        self.windows
            .insert(transfer_id, TransferWindow::new(transfer_id, self.config));
    }

    /// Stop tracking a transfer. Pending timers go with it, and late acks
    /// for it become no-ops.
    pub fn remove(&mut self, transfer_id: u32) -> Option<TransferWindow> {
        self.windows.remove(&transfer_id)
    }

    pub fn window(&self, transfer_id: u32) -> Option<&TransferWindow> {
        self.windows.get(&transfer_id)
    }

    /// Queue a chunk and return the frames that may be sent now. `None` if
    /// the transfer is not open.
    pub fn submit(
        &mut self,
        transfer_id: u32,
        offset: u64,
        length: u32,
        frame: Frame,
        now: Instant,
    ) -> Option<Vec<Frame>> {
        let window = self.windows.get_mut(&transfer_id)?;
        window.submit(offset, length, frame);
        Some(window.pump(now))
    }

    pub fn on_ack(&mut self, ack: &Acknowledgement, now: Instant) -> AckOutcome {
        match self.windows.get_mut(&ack.transfer_id) {
            Some(window) => window.on_ack(ack, now),
            None => AckOutcome::Unmatched,
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        let mut out = TickOutcome::default();
        for window in self.windows.values_mut() {
            let tick = window.on_tick(now);
            out.resend.extend(tick.resend);
            out.failed.extend(tick.failed);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
