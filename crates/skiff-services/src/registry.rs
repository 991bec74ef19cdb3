//! Transfer registry — the one owner of per-transfer runtime state.
//!
//! Every active transfer, in either direction, has exactly one entry here.
//! The entry count is the global concurrency cap: `reserve` checks and
//! claims a slot in one atomic step, so concurrent starts can never
//! overshoot the limit.
//!
//! Several connections can share one registry. Each entry records the
//! orchestrator that owns it, so a connection that is being torn down only
//! touches its own transfers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::events::TransferStatus;
use crate::orchestrator::TransferError;
use skiff_core::message::now_millis;

use crate::resume::{Direction, ResumeState};

/// Runtime state of one active transfer.
pub struct TransferEntry {
    pub transfer_id: u32,
    /// Orchestrator driving the transfer.
    pub owner: u64,
    pub direction: Direction,
    pub peer: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub chunk_size: u32,
    pub total_size: u64,
    pub total_chunks: u64,
    pub bytes_done: u64,
    pub started_at: Instant,
    /// Open destination file (receive side).
    pub sink: Option<Arc<Mutex<tokio::fs::File>>>,
    /// Chunk producer task (send side).
    pub task: Option<JoinHandle<()>>,
}

impl TransferEntry {
    pub fn from_state(state: &ResumeState, owner: u64) -> Self {
        Self {
            transfer_id: state.transfer_id,
            owner,
            direction: state.direction,
            peer: state.device_id.clone(),
            file_name: state.file_name.clone(),
            file_path: state.file_path.clone(),
            chunk_size: state.chunk_size,
            total_size: state.total_size,
            total_chunks: state.total_chunks,
            bytes_done: state.confirmed_bytes(),
            started_at: Instant::now(),
            sink: None,
            task: None,
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            transfer_id: self.transfer_id,
            direction: self.direction,
            peer: self.peer.clone(),
            file_name: self.file_name.clone(),
            bytes_done: self.bytes_done,
            total_size: self.total_size,
            status: TransferStatus::InProgress,
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}

/// Read-only view of a transfer for status queries. Registry entries are
/// always in progress; a transfer known only from its resume state is
/// paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub transfer_id: u32,
    pub direction: Direction,
    pub peer: String,
    pub file_name: String,
    pub bytes_done: u64,
    pub total_size: u64,
    pub status: TransferStatus,
    pub elapsed_ms: u64,
}

impl TransferSnapshot {
    /// View of a transfer that has resume state but no running entry.
    pub fn paused(state: &ResumeState) -> Self {
        Self {
            transfer_id: state.transfer_id,
            direction: state.direction,
            peer: state.device_id.clone(),
            file_name: state.file_name.clone(),
            bytes_done: state.confirmed_bytes(),
            total_size: state.total_size,
            status: TransferStatus::Paused,
            elapsed_ms: now_millis().saturating_sub(state.created_at),
        }
    }
}

pub struct TransferRegistry {
    entries: DashMap<u32, TransferEntry>,
    active: AtomicUsize,
    capacity: usize,
}

impl TransferRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            active: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim a slot and insert the entry, or fail without side effects.
    pub fn reserve(&self, entry: TransferEntry) -> Result<(), TransferError> {
        let limit = self.capacity;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|active| TransferError::Capacity { active, limit })?;

        match self.entries.entry(entry.transfer_id) {
            Entry::Occupied(_) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                Err(TransferError::DuplicateTransfer(entry.transfer_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Remove an entry and free its slot.
    pub fn release(&self, transfer_id: u32) -> Option<TransferEntry> {
        self.release_if(transfer_id, |_| true)
    }

    /// Remove an entry only if `pred` accepts it; the check and the removal
    /// are one step.
    pub fn release_if(
        &self,
        transfer_id: u32,
        pred: impl FnOnce(&TransferEntry) -> bool,
    ) -> Option<TransferEntry> {
        let (_, entry) = self.entries.remove_if(&transfer_id, |_, e| pred(e))?;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Some(entry)
    }

    pub fn contains(&self, transfer_id: u32) -> bool {
        self.entries.contains_key(&transfer_id)
    }

    /// Run `f` against an entry. The entry is locked for the duration, so
    /// `f` must not block.
    pub fn with_entry<R>(&self, transfer_id: u32, f: impl FnOnce(&mut TransferEntry) -> R) -> Option<R> {
        self.entries.get_mut(&transfer_id).map(|mut e| f(&mut e))
    }

    pub fn snapshot(&self, transfer_id: u32) -> Option<TransferSnapshot> {
        self.entries.get(&transfer_id).map(|e| e.snapshot())
    }

    /// All active transfers, ordered by id.
    pub fn list(&self) -> Vec<TransferSnapshot> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.snapshot()).collect();
        all.sort_by_key(|s| s.transfer_id);
        all
    }

    /// Ids of one owner's active transfers matching a direction and peer.
    pub fn ids_for(&self, owner: u64, direction: Direction, peer: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.owner == owner && e.direction == direction && e.peer == peer)
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// A fresh non-zero transfer id not currently in use.
    pub fn allocate_id(&self) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != skiff_core::wire::SESSION_TRANSFER_ID && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}
