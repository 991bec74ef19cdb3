//! Session handshake — discovery, key exchange, key confirmation.
//!
//! Symmetric: both peers run the same steps and neither is the initiator.
//!
//!   1. send Discovery, await the peer's, validate it
//!   2. send a fresh ephemeral x25519 public key (KeyExchange), await the peer's
//!   3. derive the session key, install it on the channel with the tag the
//!      peer must echo
//!   4. send a key confirmation tag (Handshake, transfer id 0), await the
//!      peer's; the channel compares it and only then lets transfer frames
//!      through
//!
//! Each wait is bounded by the handshake timeout. A failed handshake is
//! fatal to that attempt and is not retried here.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use skiff_core::crypto::{self, CryptoError, EphemeralKeypair};
use skiff_core::message::{now_millis, DiscoveryPayload, DiscoveryRejection};
use skiff_core::wire::{ControlKind, Frame, SESSION_TRANSFER_ID};
use skiff_core::{SkiffConfig, TransportCapability};

use crate::channel::{ChannelError, ChannelHandle};

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub device_id: String,
    pub transports: Vec<TransportCapability>,
    /// Bound on each wait for a peer message.
    pub timeout: Duration,
}

impl HandshakeConfig {
    pub fn new(device_id: impl Into<String>, transports: &[TransportCapability]) -> Self {
        Self {
            device_id: device_id.into(),
            transports: transports.to_vec(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &SkiffConfig, transports: &[TransportCapability]) -> Self {
        Self {
            timeout: config.connection.handshake_timeout(),
            ..Self::new(config.identity.device_id.clone(), transports)
        }
    }
}

/// What a completed handshake established.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub peer: DiscoveryPayload,
    pub session_id: [u8; 32],
}

impl HandshakeOutcome {
    pub fn peer_device(&self) -> &str {
        &self.peer.device_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Discovery,
    KeyExchange,
    Confirmation,
}

impl Step {
    fn expects(self) -> ControlKind {
        match self {
            Step::Discovery => ControlKind::Discovery,
            Step::KeyExchange => ControlKind::KeyExchange,
            Step::Confirmation => ControlKind::Handshake,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Discovery => f.write_str("discovery"),
            Step::KeyExchange => f.write_str("key exchange"),
            Step::Confirmation => f.write_str("key confirmation"),
        }
    }
}

/// Run the handshake on a freshly spawned channel.
///
/// `control` is the channel's control stream; the handshake consumes it
/// until done and hands it back untouched afterwards.
pub async fn perform_handshake(
    channel: &ChannelHandle,
    control: &mut mpsc::Receiver<Frame>,
    config: &HandshakeConfig,
) -> Result<HandshakeOutcome, HandshakeError> {
    // ── Discovery ──
    let hello = DiscoveryPayload::new(config.device_id.clone(), &config.transports);
    let frame = hello
        .to_frame()
        .map_err(|e| HandshakeError::Encode(e.to_string()))?;
    channel.send_control(frame).await?;

    let frame = expect(control, Step::Discovery, config.timeout).await?;
    let peer = DiscoveryPayload::from_payload(&frame.payload)?;
    peer.validate(now_millis())?;
    if peer.device_id == config.device_id {
        return Err(HandshakeError::SelfConnection);
    }
    tracing::debug!(peer = %peer.device_id, "discovery accepted");

    // ── Key exchange ──
    let keypair = EphemeralKeypair::generate();
    channel
        .send_control(Frame::control(
            ControlKind::KeyExchange,
            SESSION_TRANSFER_ID,
            Bytes::copy_from_slice(keypair.public()),
        ))
        .await?;

    let frame = expect(control, Step::KeyExchange, config.timeout).await?;
    let session_id = crypto::derive_session_id(&config.device_id, &peer.device_id);
    let key = keypair.derive_session_key(&frame.payload, &session_id)?;
    let tag = key.confirmation_tag(&session_id);
    channel.install_key(&key, tag)?;

    // ── Confirmation ──
    channel
        .send_control(Frame::control(
            ControlKind::Handshake,
            SESSION_TRANSFER_ID,
            Bytes::copy_from_slice(&tag),
        ))
        .await?;

    // The reader records the peer's tag before forwarding the frame.
    expect(control, Step::Confirmation, config.timeout).await?;
    if !channel.is_confirmed() {
        return Err(HandshakeError::ConfirmationMismatch);
    }

    tracing::info!(
        peer = %peer.device_id,
        session = hex::encode(&session_id[..8]),
        "session established"
    );
    Ok(HandshakeOutcome { peer, session_id })
}

/// Wait for the next control frame and check it is the one this step needs.
async fn expect(
    control: &mut mpsc::Receiver<Frame>,
    step: Step,
    timeout: Duration,
) -> Result<Frame, HandshakeError> {
    let frame = tokio::time::timeout(timeout, control.recv())
        .await
        .map_err(|_| HandshakeError::Timeout(step.to_string()))?
        .ok_or(HandshakeError::ChannelClosed)?;

    if frame.control_kind() != Some(step.expects()) || frame.transfer_id != SESSION_TRANSFER_ID {
        return Err(HandshakeError::Unexpected {
            step: step.to_string(),
            kind: frame.kind,
            transfer_id: frame.transfer_id,
        });
    }
    Ok(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("peer rejected: {0}")]
    Rejected(#[from] DiscoveryRejection),

    #[error("peer announced our own device id")]
    SelfConnection,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("key confirmation mismatch")]
    ConfirmationMismatch,

    #[error("unexpected {kind:?} frame (transfer {transfer_id}) during {step}")]
    Unexpected {
        step: String,
        kind: skiff_core::FrameKind,
        transfer_id: u32,
    },

    #[error("connection closed during handshake")]
    ChannelClosed,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to encode handshake message: {0}")]
    Encode(String),
}
