//! skiff-core — wire format, control payloads, and cryptographic primitives.
//! All other Skiff crates depend on this one.

pub mod config;
pub mod crypto;
pub mod message;
pub mod wire;

pub use config::SkiffConfig;
pub use message::{Acknowledgement, DiscoveryPayload, TransferOffer, TransportCapability};
pub use wire::{ControlKind, Frame, FrameDecoder, FrameKind, WireError};
