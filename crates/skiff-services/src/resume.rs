//! Resume store — durable per-transfer progress.
//!
//! One `ResumeState` per (transfer id, peer device id): file metadata, the
//! negotiated chunk geometry, and a bitmap with one bit per chunk. The
//! sender sets a bit when a chunk is acknowledged, the receiver when a chunk
//! is written. After an interruption the orchestrator re-derives byte ranges
//! from the stored chunk size and moves only the clear bits.
//!
//! States are cached in memory and written through to a `ResumeBackend`.
//! Saves are best-effort (logged on failure); loads surface errors because a
//! resume that cannot read its state must not silently start over.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use skiff_core::message::now_millis;

// ── Bitmap ────────────────────────────────────────────────────────────────────

/// One bit per chunk. O(1) set/test, O(n) enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    len: u64,
    set: u64,
}

impl ChunkBitmap {
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; len.div_ceil(64) as usize],
            len,
            set: 0,
        }
    }

    /// Set a bit. Returns true if it was newly set; out-of-range indices are
    /// ignored.
    pub fn set(&mut self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, mask) = Self::locate(index);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.set += 1;
        true
    }

    pub fn get(&self, index: u64) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, mask) = Self::locate(index);
        self.words[word] & mask != 0
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_set(&self) -> u64 {
        self.set
    }

    pub fn is_complete(&self) -> bool {
        self.set >= self.len
    }

    /// Clear bits in ascending order.
    pub fn missing(&self) -> Vec<u64> {
        (0..self.len).filter(|i| !self.get(*i)).collect()
    }

    /// Index of the first clear bit, or `len` when complete.
    pub fn first_missing(&self) -> u64 {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i as u64 * 64 + w.trailing_ones() as u64)
            .unwrap_or(self.len)
            .min(self.len)
    }

    #[inline]
    fn locate(index: u64) -> (usize, u64) {
        ((index / 64) as usize, 1u64 << (index % 64))
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Everything needed to continue an interrupted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub transfer_id: u32,
    /// The peer on the other end.
    pub device_id: String,
    pub direction: Direction,
    /// Source file (sender) or destination file (receiver).
    pub file_path: PathBuf,
    /// Name announced in the transfer offer.
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u64,
    pub bitmap: ChunkBitmap,
    /// End of the longest fully confirmed prefix.
    pub last_confirmed_offset: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub file_hash: Option<[u8; 32]>,
}

impl ResumeState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transfer_id: u32,
        device_id: impl Into<String>,
        direction: Direction,
        file_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        total_size: u64,
        chunk_size: u32,
        file_hash: Option<[u8; 32]>,
    ) -> Self {
        let total_chunks = chunk_count(total_size, chunk_size);
        Self {
            transfer_id,
            device_id: device_id.into(),
            direction,
            file_path: file_path.into(),
            file_name: file_name.into(),
            total_size,
            chunk_size,
            total_chunks,
            bitmap: ChunkBitmap::new(total_chunks),
            last_confirmed_offset: 0,
            created_at: now_millis(),
            file_hash,
        }
    }

    /// Byte range `(offset, length)` of a chunk. The last chunk may be short;
    /// an empty file is a single zero-length chunk.
    pub fn chunk_range(&self, index: u64) -> (u64, u32) {
        let offset = index * self.chunk_size as u64;
        let len = self
            .total_size
            .saturating_sub(offset)
            .min(self.chunk_size as u64);
        (offset, len as u32)
    }

    /// Chunk index for a byte offset, if the offset starts a chunk.
    pub fn chunk_index(&self, offset: u64) -> Option<u64> {
        if self.chunk_size == 0 || offset % self.chunk_size as u64 != 0 {
            return None;
        }
        let index = offset / self.chunk_size as u64;
        (index < self.total_chunks).then_some(index)
    }

    /// Set a chunk's bit and advance the confirmed prefix. Returns true if
    /// the chunk was new.
    pub fn mark(&mut self, index: u64) -> bool {
        let fresh = self.bitmap.set(index);
        if fresh {
            let first_missing = self.bitmap.first_missing();
            self.last_confirmed_offset = if first_missing >= self.total_chunks {
                self.total_size
            } else {
                first_missing * self.chunk_size as u64
            };
        }
        fresh
    }

    /// Bytes covered by set bits.
    pub fn confirmed_bytes(&self) -> u64 {
        (0..self.total_chunks)
            .filter(|i| self.bitmap.get(*i))
            .map(|i| self.chunk_range(i).1 as u64)
            .sum()
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.bitmap.count_set() as f64 / self.total_chunks as f64
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.is_complete()
    }
}

/// Chunks needed for a file. An empty file still takes one chunk.
pub fn chunk_count(total_size: u64, chunk_size: u32) -> u64 {
    if total_size == 0 || chunk_size == 0 {
        1
    } else {
        total_size.div_ceil(chunk_size as u64)
    }
}

// ── Backends ──────────────────────────────────────────────────────────────────

/// Key-value persistence underneath the store.
pub trait ResumeBackend: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), ResumeError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ResumeError>;
    fn remove(&self, key: &str) -> Result<(), ResumeError>;
    fn keys(&self) -> Result<Vec<String>, ResumeError>;
}

/// One JSON file per key in a directory.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ResumeError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ResumeError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl ResumeBackend for FileBackend {
    /// Atomic write: tmp file → rename.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), ResumeError> {
        let path = self.path(key);
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value).map_err(|e| ResumeError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| ResumeError::io(&path, e))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ResumeError> {
        let path = self.path(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ResumeError::io(&path, e)),
        }
    }

    fn remove(&self, key: &str) -> Result<(), ResumeError> {
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResumeError::io(&path, e)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, ResumeError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| ResumeError::io(&self.dir, e))?;
        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .collect())
    }
}

/// In-memory backend. Writes can be made to fail to exercise the
/// best-effort save path.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Vec<u8>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl ResumeBackend for MemoryBackend {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), ResumeError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(ResumeError::Io {
                path: PathBuf::from(key),
                source: std::io::Error::new(std::io::ErrorKind::Other, "writes disabled"),
            });
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ResumeError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn remove(&self, key: &str) -> Result<(), ResumeError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, ResumeError> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

type StateKey = (u32, String);

/// Cached, write-through resume state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResumeStore {
    states: Arc<DashMap<StateKey, ResumeState>>,
    backend: Arc<dyn ResumeBackend>,
}

impl ResumeStore {
    pub fn new(backend: Arc<dyn ResumeBackend>) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            backend,
        }
    }

    /// Store backed by a directory of JSON files.
    pub fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, ResumeError> {
        Ok(Self::new(Arc::new(FileBackend::new(dir)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Backend key for a state. The device id is hex-encoded so any id is a
    /// safe file name.
    pub fn storage_key(transfer_id: u32, device_id: &str) -> String {
        format!("{transfer_id:08x}-{}", hex::encode(device_id.as_bytes()))
    }

    /// Insert or replace a state. Best-effort: a failed write is logged and
    /// the in-memory copy is kept.
    pub fn save(&self, state: ResumeState) {
        let key = (state.transfer_id, state.device_id.clone());
        let entry = self.states.entry(key).insert(state);
        self.persist(entry.value());
    }

    /// Snapshot of a state, reading through to the backend on a cache miss.
    pub fn load(
        &self,
        transfer_id: u32,
        device_id: &str,
    ) -> Result<Option<ResumeState>, ResumeError> {
        let key = (transfer_id, device_id.to_string());
        if let Some(state) = self.states.get(&key) {
            return Ok(Some(state.value().clone()));
        }
        let storage_key = Self::storage_key(transfer_id, device_id);
        let Some(bytes) = self.backend.get(&storage_key)? else {
            return Ok(None);
        };
        let state: ResumeState = serde_json::from_slice(&bytes)
            .map_err(|source| ResumeError::Corrupt { key: storage_key, source })?;
        self.states.insert(key, state.clone());
        Ok(Some(state))
    }

    /// Record a chunk. Returns `Some(true)` if newly recorded, `Some(false)`
    /// for a duplicate, `None` if no state exists. The map entry stays locked
    /// across mutate-and-persist so writes for one key never interleave.
    pub fn mark_chunk_received(
        &self,
        transfer_id: u32,
        device_id: &str,
        index: u64,
    ) -> Option<bool> {
        let mut state = self.states.get_mut(&(transfer_id, device_id.to_string()))?;
        let fresh = state.mark(index);
        if fresh {
            self.persist(&state);
        }
        Some(fresh)
    }

    pub fn is_chunk_received(&self, transfer_id: u32, device_id: &str, index: u64) -> bool {
        self.states
            .get(&(transfer_id, device_id.to_string()))
            .map(|s| s.bitmap.get(index))
            .unwrap_or(false)
    }

    /// Missing chunk indices, ascending.
    pub fn missing_chunks(&self, transfer_id: u32, device_id: &str) -> Option<Vec<u64>> {
        self.states
            .get(&(transfer_id, device_id.to_string()))
            .map(|s| s.bitmap.missing())
    }

    /// Fraction of chunks recorded, in [0, 1].
    pub fn progress(&self, transfer_id: u32, device_id: &str) -> Option<f64> {
        self.states
            .get(&(transfer_id, device_id.to_string()))
            .map(|s| s.progress())
    }

    /// Every state held in memory, ordered by transfer id.
    pub fn cached(&self) -> Vec<ResumeState> {
        let mut all: Vec<ResumeState> = self.states.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| (a.transfer_id, &a.device_id).cmp(&(b.transfer_id, &b.device_id)));
        all
    }

    pub fn is_complete(&self, transfer_id: u32, device_id: &str) -> bool {
        self.states
            .get(&(transfer_id, device_id.to_string()))
            .map(|s| s.is_complete())
            .unwrap_or(false)
    }

    pub fn delete(&self, transfer_id: u32, device_id: &str) {
        self.states.remove(&(transfer_id, device_id.to_string()));
        let key = Self::storage_key(transfer_id, device_id);
        if let Err(e) = self.backend.remove(&key) {
            tracing::warn!(error = %e, transfer_id, "failed to delete resume state");
        }
    }

    /// Delete every state created more than `age` ago. Returns how many
    /// were removed.
    pub fn sweep_older_than(&self, age: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(age.as_millis() as u64);
        self.sweep_created_before(cutoff)
    }

    fn sweep_created_before(&self, cutoff_ms: u64) -> usize {
        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list resume states for sweep");
                Vec::new()
            }
        };

        let mut stale: Vec<StateKey> = self
            .states
            .iter()
            .filter(|e| e.value().created_at < cutoff_ms)
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            let bytes = match self.backend.get(&key) {
                Ok(Some(bytes)) => bytes,
                _ => continue,
            };
            match serde_json::from_slice::<ResumeState>(&bytes) {
                Ok(state) if state.created_at < cutoff_ms => {
                    stale.push((state.transfer_id, state.device_id));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "removing unreadable resume state");
                    let _ = self.backend.remove(&key);
                }
            }
        }

        stale.sort();
        stale.dedup();
        for (transfer_id, device_id) in &stale {
            self.delete(*transfer_id, device_id);
        }
        if !stale.is_empty() {
            tracing::info!(removed = stale.len(), "swept expired resume states");
        }
        stale.len()
    }

    fn persist(&self, state: &ResumeState) {
        let key = Self::storage_key(state.transfer_id, &state.device_id);
        let result = serde_json::to_vec(state)
            .map_err(|source| ResumeError::Corrupt {
                key: key.clone(),
                source,
            })
            .and_then(|json| self.backend.put(&key, &json));
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                transfer_id = state.transfer_id,
                "failed to persist resume state"
            );
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("resume storage I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resume state {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ResumeError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
