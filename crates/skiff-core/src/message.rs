//! Control payloads — what travels inside control frames.
//!
//! Acknowledgements use a fixed binary layout (see `wire::AckPayload`).
//! Discovery and transfer offers are JSON: they are small, sent once per
//! session or transfer, and need to stay extensible.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::{U32, U64};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{AckPayload, ControlKind, Frame, WireError, ACK_LEN, PROTOCOL_VERSION};

/// Maximum tolerated clock skew on a discovery timestamp.
pub const MAX_DISCOVERY_SKEW_MS: u64 = 30_000;

/// Capability key that must be present and true.
pub const CAP_ENCRYPTION: &str = "encryption";

/// Smallest chunk any transport uses: one BLE characteristic payload.
pub const MIN_CHUNK_SIZE: u32 = 244;
pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;
/// Largest chunk count an offer may announce. Keeps a receiver's bitmap
/// at 2 MiB or less.
pub const MAX_TOTAL_CHUNKS: u64 = 1 << 24;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Acknowledgement ───────────────────────────────────────────────────────────

/// Confirms exactly one previously sent chunk, by byte range.
///
/// Not cumulative: an ack says nothing about any other chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Acknowledgement {
    pub transfer_id: u32,
    pub offset: u64,
    pub length: u32,
}

impl Acknowledgement {
    pub fn to_bytes(&self) -> [u8; ACK_LEN] {
        let payload = AckPayload {
            transfer_id: U32::new(self.transfer_id),
            offset: U64::new(self.offset),
            length: U32::new(self.length),
        };
        let mut out = [0u8; ACK_LEN];
        out.copy_from_slice(payload.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let payload = AckPayload::read_from(bytes).ok_or(WireError::BadAck(bytes.len()))?;
        Ok(Self {
            transfer_id: payload.transfer_id.get(),
            offset: payload.offset.get(),
            length: payload.length.get(),
        })
    }

    /// Wrap in a Control/Ack frame.
    pub fn into_frame(self) -> Frame {
        Frame::control(
            ControlKind::Ack,
            self.transfer_id,
            Bytes::copy_from_slice(&self.to_bytes()),
        )
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Transports a device can carry a session over. Advertised as
/// `transport.<name> = true` in the capability map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportCapability {
    /// Low-MTU radio link (BLE characteristic writes).
    Ble,
    /// Direct ordered socket.
    Socket,
    /// Platform resource-transfer API that moves whole files.
    Resource,
}

impl TransportCapability {
    pub const ALL: [TransportCapability; 3] = [
        TransportCapability::Ble,
        TransportCapability::Socket,
        TransportCapability::Resource,
    ];

    pub fn key(self) -> &'static str {
        match self {
            TransportCapability::Ble => "transport.ble",
            TransportCapability::Socket => "transport.socket",
            TransportCapability::Resource => "transport.resource",
        }
    }
}

/// First message of the handshake. Sent by both sides, unencrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPayload {
    pub device_id: String,
    pub capabilities: BTreeMap<String, serde_json::Value>,
    pub protocol_version: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl DiscoveryPayload {
    /// Advertise encryption plus the given transports, stamped now.
    pub fn new(device_id: impl Into<String>, transports: &[TransportCapability]) -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(CAP_ENCRYPTION.to_string(), serde_json::Value::Bool(true));
        for t in transports {
            capabilities.insert(t.key().to_string(), serde_json::Value::Bool(true));
        }
        Self {
            device_id: device_id.into(),
            capabilities,
            protocol_version: PROTOCOL_VERSION,
            timestamp: now_millis(),
        }
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.capabilities.get(key), Some(serde_json::Value::Bool(true)))
    }

    /// Transports the peer has flagged.
    pub fn transports(&self) -> Vec<TransportCapability> {
        TransportCapability::ALL
            .into_iter()
            .filter(|t| self.flag(t.key()))
            .collect()
    }

    /// Check a received payload against our protocol rules.
    pub fn validate(&self, now_ms: u64) -> Result<(), DiscoveryRejection> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(DiscoveryRejection::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: self.protocol_version,
            });
        }
        if !self.flag(CAP_ENCRYPTION) {
            return Err(DiscoveryRejection::EncryptionUnsupported);
        }
        if self.transports().is_empty() {
            return Err(DiscoveryRejection::NoTransport);
        }
        let skew = now_ms.abs_diff(self.timestamp);
        if skew > MAX_DISCOVERY_SKEW_MS {
            return Err(DiscoveryRejection::Stale { skew_ms: skew });
        }
        if self.device_id.is_empty() {
            return Err(DiscoveryRejection::MissingDeviceId);
        }
        Ok(())
    }

    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        let payload = serde_json::to_vec(self)?;
        Ok(Frame::control(
            ControlKind::Discovery,
            crate::wire::SESSION_TRANSFER_ID,
            payload,
        ))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, DiscoveryRejection> {
        serde_json::from_slice(payload).map_err(|e| DiscoveryRejection::Malformed(e.to_string()))
    }
}

/// Why a discovery payload was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryRejection {
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("peer does not advertise encryption=true")]
    EncryptionUnsupported,

    #[error("peer advertises no transport capability")]
    NoTransport,

    #[error("discovery timestamp skew {skew_ms}ms exceeds {}ms", MAX_DISCOVERY_SKEW_MS)]
    Stale { skew_ms: u64 },

    #[error("discovery payload has an empty device id")]
    MissingDeviceId,

    #[error("malformed discovery payload: {0}")]
    Malformed(String),
}

// ── Transfer offer ────────────────────────────────────────────────────────────

/// Announces a transfer to the receiver ahead of its first data frame.
///
/// Carried in a Control/Handshake frame whose transfer id is the transfer
/// being offered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOffer {
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u64,
    /// BLAKE3 of the whole file, checked by the receiver on completion.
    pub file_hash: Option<[u8; 32]>,
    /// True when continuing a previously interrupted transfer.
    pub resume: bool,
}

impl TransferOffer {
    pub fn to_frame(&self, transfer_id: u32) -> Result<Frame, serde_json::Error> {
        let payload = serde_json::to_vec(self)?;
        Ok(Frame::control(ControlKind::Handshake, transfer_id, payload))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Reject offers the receiver must not act on. The chunk count sizes the
    /// receiver's bitmap, so it is bounded before anything is allocated.
    pub fn check(&self) -> Result<(), &'static str> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err("chunk size out of range");
        }
        if self.total_chunks > MAX_TOTAL_CHUNKS {
            return Err("too many chunks");
        }
        let expected = if self.total_size == 0 {
            1
        } else {
            self.total_size.div_ceil(self.chunk_size as u64)
        };
        if expected != self.total_chunks {
            return Err("inconsistent chunk geometry");
        }
        if self.file_name.is_empty()
            || self.file_name.contains(['/', '\\'])
            || self.file_name == ".."
        {
            return Err("unsafe file name");
        }
        Ok(())
    }
}

/// Why a transfer was cancelled, carried as the Cancel frame's payload.
/// An empty payload is `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled or refused. Both sides forget the transfer.
    Aborted,
    /// Given up after an error. Both sides keep their resume state.
    Failed,
}

impl CancelReason {
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload.first() {
            Some(1) => CancelReason::Failed,
            _ => CancelReason::Aborted,
        }
    }
}

/// Build a Control/Cancel frame for a transfer.
pub fn cancel_frame(transfer_id: u32, reason: CancelReason) -> Frame {
    let payload = match reason {
        CancelReason::Aborted => Bytes::new(),
        CancelReason::Failed => Bytes::from_static(&[1]),
    };
    Frame::control(ControlKind::Cancel, transfer_id, payload)
}
