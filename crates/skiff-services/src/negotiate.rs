//! Chunk size negotiation per transport.
//!
//! | transport        | chunk size                               |
//! |------------------|------------------------------------------|
//! | constrained      | link MTU payload (244 bytes), no floor   |
//! | high-throughput  | reported max, else 1 MiB                 |
//! | everything else  | 256 KiB                                  |
//!
//! The 1 MiB ceiling always applies; the 64 KiB floor applies to every
//! transport except the constrained one.

use skiff_core::message::{self, TransportCapability};

/// BLE characteristic payload after ATT overhead.
pub const CONSTRAINED_CHUNK_SIZE: u32 = message::MIN_CHUNK_SIZE;
pub const MIN_CHUNK_SIZE: u32 = 64 * 1024;
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;
pub const MAX_CHUNK_SIZE: u32 = message::MAX_CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportClass {
    /// Low-MTU radio link.
    Constrained,
    Standard,
    HighThroughput,
}

/// What the transport tells us about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportProfile {
    pub class: TransportClass,
    /// Largest chunk the transport says it can carry, if it reports one.
    pub max_chunk_size: Option<u32>,
}

impl TransportProfile {
    pub fn constrained() -> Self {
        Self {
            class: TransportClass::Constrained,
            max_chunk_size: None,
        }
    }

    pub fn standard() -> Self {
        Self {
            class: TransportClass::Standard,
            max_chunk_size: None,
        }
    }

    pub fn high_throughput(max_chunk_size: Option<u32>) -> Self {
        Self {
            class: TransportClass::HighThroughput,
            max_chunk_size,
        }
    }

    /// Profile for a transport both peers advertised.
    pub fn for_capability(cap: TransportCapability) -> Self {
        match cap {
            TransportCapability::Ble => Self::constrained(),
            TransportCapability::Socket => Self::high_throughput(None),
            TransportCapability::Resource => Self::standard(),
        }
    }
}

pub fn negotiate_chunk_size(profile: &TransportProfile) -> u32 {
    match profile.class {
        TransportClass::Constrained => profile
            .max_chunk_size
            .unwrap_or(CONSTRAINED_CHUNK_SIZE)
            .clamp(CONSTRAINED_CHUNK_SIZE, MAX_CHUNK_SIZE),
        TransportClass::Standard => profile
            .max_chunk_size
            .map_or(DEFAULT_CHUNK_SIZE, |max| max.min(DEFAULT_CHUNK_SIZE))
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
        TransportClass::HighThroughput => profile
            .max_chunk_size
            .unwrap_or(MAX_CHUNK_SIZE)
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
    }
}
