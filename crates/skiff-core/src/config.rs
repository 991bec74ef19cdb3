//! Configuration system for Skiff.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SKIFF_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/skiff/config.toml
//!   3. ~/.config/skiff/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::MAX_FRAME_SIZE;

/// Largest sliding window the reliability engine accepts.
pub const MAX_WINDOW_SIZE: usize = 16;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkiffConfig {
    pub identity: IdentityConfig,
    pub transfer: TransferConfig,
    pub resume: ResumeConfig,
    pub connection: ConnectionConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Device id announced in discovery. Empty = hostname-derived.
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunks in flight per transfer. Clamped to [1, 16].
    pub window_size: usize,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub max_concurrent_transfers: usize,
    /// Where received files land.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub state_dir: PathBuf,
    /// Sweep resume entries older than N days. 0 = never.
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub handshake_timeout_secs: u64,
    pub reconnect_base_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Largest accepted length-prefixed frame. Capped at the codec maximum.
    pub max_frame_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Trace every frame in and out of the multiplexer.
    pub log_frames: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            window_size: 4,
            ack_timeout_ms: 5_000,
            max_retries: 3,
            max_concurrent_transfers: 5,
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            state_dir: data_dir().join("resume"),
            retention_days: 7,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            reconnect_base_ms: 1_000,
            max_reconnect_attempts: 5,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl TransferConfig {
    pub fn window(&self) -> usize {
        self.window_size.clamp(1, MAX_WINDOW_SIZE)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl ResumeConfig {
    pub fn retention(&self) -> Option<Duration> {
        match self.retention_days {
            0 => None,
            days => Some(Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
        }
    }
}

impl ConnectionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn frame_limit(&self) -> usize {
        self.max_frame_size.clamp(1, MAX_FRAME_SIZE)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("skiff")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("skiff")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn default_device_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "skiff-device".to_string())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SkiffConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            SkiffConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file without consulting the environment.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SKIFF_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SkiffConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SKIFF_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any `SKIFF_<SECTION>__<KEY>` lookup. Unparseable
    /// values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn flag(v: &str) -> bool {
            v == "true" || v == "1"
        }

        if let Some(v) = lookup("SKIFF_IDENTITY__DEVICE_ID") {
            self.identity.device_id = v;
        }
        if let Some(n) = lookup("SKIFF_TRANSFER__WINDOW_SIZE").and_then(|v| v.parse().ok()) {
            self.transfer.window_size = n;
        }
        if let Some(n) = lookup("SKIFF_TRANSFER__ACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.transfer.ack_timeout_ms = n;
        }
        if let Some(n) = lookup("SKIFF_TRANSFER__MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.transfer.max_retries = n;
        }
        if let Some(n) =
            lookup("SKIFF_TRANSFER__MAX_CONCURRENT_TRANSFERS").and_then(|v| v.parse().ok())
        {
            self.transfer.max_concurrent_transfers = n;
        }
        if let Some(v) = lookup("SKIFF_TRANSFER__DOWNLOAD_DIR") {
            self.transfer.download_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SKIFF_RESUME__STATE_DIR") {
            self.resume.state_dir = PathBuf::from(v);
        }
        if let Some(n) = lookup("SKIFF_RESUME__RETENTION_DAYS").and_then(|v| v.parse().ok()) {
            self.resume.retention_days = n;
        }
        if let Some(n) =
            lookup("SKIFF_CONNECTION__HANDSHAKE_TIMEOUT_SECS").and_then(|v| v.parse().ok())
        {
            self.connection.handshake_timeout_secs = n;
        }
        if let Some(n) = lookup("SKIFF_CONNECTION__RECONNECT_BASE_MS").and_then(|v| v.parse().ok())
        {
            self.connection.reconnect_base_ms = n;
        }
        if let Some(n) =
            lookup("SKIFF_CONNECTION__MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok())
        {
            self.connection.max_reconnect_attempts = n;
        }
        if let Some(n) = lookup("SKIFF_CONNECTION__MAX_FRAME_SIZE").and_then(|v| v.parse().ok()) {
            self.connection.max_frame_size = n;
        }
        if let Some(v) = lookup("SKIFF_DEBUG__LOG_FRAMES") {
            self.debug.log_frames = flag(&v);
        }
    }
}
