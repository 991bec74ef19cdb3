//! Skiff wire format — the two frame shapes and their codec.
//!
//! These types ARE the protocol. Every field, every size, every byte
//! position is part of the wire format. Two shapes share one header:
//!
//!   Control: [kind=0][subtype][header:28][payload][integrity_hash:32]
//!   Data:    [kind=1]         [header:28][payload][integrity_hash:32]
//!
//! header = [transfer_id:4][offset:8][payload_length:4][iv:12], big-endian.
//!
//! On a byte stream every encoded frame is additionally preceded by a 4-byte
//! big-endian length prefix. `FrameDecoder` isolates those frames from a
//! growing receive buffer; `decode` only ever sees a complete frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Leading byte of a control frame.
pub const KIND_CONTROL: u8 = 0x00;

/// Leading byte of a data frame.
pub const KIND_DATA: u8 = 0x01;

/// AEAD nonce length carried in every frame.
pub const IV_LEN: usize = 12;

/// Plaintext content hash length carried in every frame.
pub const HASH_LEN: usize = 32;

/// Size of the header shared by both frame shapes.
pub const HEADER_LEN: usize = 28;

/// Hard ceiling on a single frame's payload. A peer declaring more than this
/// is either broken or hostile.
pub const MAX_PAYLOAD: usize = 10 * 1024 * 1024;

/// Length of the stream framing prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest encoded frame (control shape, maximum payload).
pub const MAX_FRAME_SIZE: usize = 2 + HEADER_LEN + MAX_PAYLOAD + HASH_LEN;

/// Transfer id reserved for session-level messages (discovery, key exchange,
/// key confirmation).
pub const SESSION_TRANSFER_ID: u32 = 0;

/// Current protocol version, exchanged during discovery.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of an acknowledgement payload.
pub const ACK_LEN: usize = 16;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Fields common to control and data frames, in wire order.
///
/// Wire size: 28 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Transfer this frame belongs to. 0 for session-level messages.
    pub transfer_id: U32<BigEndian>,

    /// Byte offset of the chunk within the file. 0 for control frames.
    pub offset: U64<BigEndian>,

    /// Length of the payload that follows the header.
    pub payload_length: U32<BigEndian>,

    /// AEAD nonce. Zero-filled when the payload is not encrypted.
    pub iv: [u8; IV_LEN],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; HEADER_LEN]);

/// Acknowledgement payload, carried inside a Control/Ack frame.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct AckPayload {
    pub transfer_id: U32<BigEndian>,
    pub offset: U64<BigEndian>,
    pub length: U32<BigEndian>,
}

assert_eq_size!(AckPayload, [u8; ACK_LEN]);

// ── Kinds ─────────────────────────────────────────────────────────────────────

/// Control frame subtype. Only present on the wire when kind = Control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlKind {
    /// Identity, capabilities, protocol version.
    Discovery = 0x00,
    /// Ephemeral x25519 public key.
    KeyExchange = 0x01,
    /// Confirms exactly one chunk.
    Ack = 0x02,
    /// Key confirmation (transfer id 0) or transfer offer (transfer id != 0).
    Handshake = 0x03,
    /// Abort a transfer.
    Cancel = 0x04,
}

impl TryFrom<u8> for ControlKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlKind::Discovery),
            0x01 => Ok(ControlKind::KeyExchange),
            0x02 => Ok(ControlKind::Ack),
            0x03 => Ok(ControlKind::Handshake),
            0x04 => Ok(ControlKind::Cancel),
            other => Err(WireError::UnknownControlKind(other)),
        }
    }
}

impl From<ControlKind> for u8 {
    fn from(k: ControlKind) -> u8 {
        k as u8
    }
}

/// Which of the two frame shapes a frame has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Control(ControlKind),
    Data,
}

impl FrameKind {
    /// The leading wire byte for this kind.
    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Control(_) => KIND_CONTROL,
            FrameKind::Data => KIND_DATA,
        }
    }

    /// Bytes occupied by the kind (and subtype) prefix.
    fn prefix_len(self) -> usize {
        match self {
            FrameKind::Control(_) => 2,
            FrameKind::Data => 1,
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One discrete protocol message.
///
/// `payload_length` is not stored: it is always `payload.len()`, so the
/// length/payload invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub transfer_id: u32,
    pub offset: u64,
    pub iv: [u8; IV_LEN],
    pub payload: Bytes,
    pub integrity_hash: [u8; HASH_LEN],
}

impl Frame {
    /// A control frame with a plaintext payload, zero iv and zero hash.
    pub fn control(subtype: ControlKind, transfer_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Control(subtype),
            transfer_id,
            offset: 0,
            iv: [0u8; IV_LEN],
            payload: payload.into(),
            integrity_hash: [0u8; HASH_LEN],
        }
    }

    /// A data frame carrying AEAD ciphertext.
    pub fn data(
        transfer_id: u32,
        offset: u64,
        iv: [u8; IV_LEN],
        ciphertext: impl Into<Bytes>,
        integrity_hash: [u8; HASH_LEN],
    ) -> Self {
        Self {
            kind: FrameKind::Data,
            transfer_id,
            offset,
            iv,
            payload: ciphertext.into(),
            integrity_hash,
        }
    }

    pub fn payload_length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Subtype if this is a control frame.
    pub fn control_kind(&self) -> Option<ControlKind> {
        match self.kind {
            FrameKind::Control(k) => Some(k),
            FrameKind::Data => None,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self.kind, FrameKind::Data)
    }

    /// Size of this frame once encoded, without the stream length prefix.
    pub fn encoded_len(&self) -> usize {
        self.kind.prefix_len() + HEADER_LEN + self.payload.len() + HASH_LEN
    }

    fn header(&self) -> FrameHeader {
        FrameHeader {
            transfer_id: U32::new(self.transfer_id),
            offset: U64::new(self.offset),
            payload_length: U32::new(self.payload_length()),
            iv: self.iv,
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Append the encoded frame to `out`.
pub fn encode_into(frame: &Frame, out: &mut BytesMut) -> Result<(), WireError> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(frame.payload.len()));
    }
    out.reserve(frame.encoded_len());
    out.put_u8(frame.kind.tag());
    if let FrameKind::Control(subtype) = frame.kind {
        out.put_u8(subtype.into());
    }
    out.put_slice(frame.header().as_bytes());
    out.put_slice(&frame.payload);
    out.put_slice(&frame.integrity_hash);
    Ok(())
}

/// Serialize a frame. Fails only if the payload exceeds `MAX_PAYLOAD`.
pub fn encode(frame: &Frame) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(frame.encoded_len());
    encode_into(frame, &mut out)?;
    Ok(out.freeze())
}

/// Serialize a frame with its 4-byte big-endian stream length prefix.
pub fn encode_prefixed(frame: &Frame) -> Result<Bytes, WireError> {
    let len = frame.encoded_len();
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + len);
    out.put_u32(len as u32);
    encode_into(frame, &mut out)?;
    Ok(out.freeze())
}

/// Deserialize exactly one complete frame.
///
/// `bytes` must hold the whole frame and nothing else: a buffer shorter or
/// longer than the declared payload length is rejected, never read past.
pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
    let (&tag, rest) = bytes.split_first().ok_or(WireError::Truncated {
        needed: 1,
        available: 0,
    })?;

    let (kind, rest) = match tag {
        KIND_CONTROL => {
            let (&subtype, rest) = rest.split_first().ok_or(WireError::Truncated {
                needed: 2,
                available: bytes.len(),
            })?;
            (FrameKind::Control(ControlKind::try_from(subtype)?), rest)
        }
        KIND_DATA => (FrameKind::Data, rest),
        other => return Err(WireError::UnknownKind(other)),
    };

    let header = FrameHeader::read_from_prefix(rest).ok_or(WireError::Truncated {
        needed: kind.prefix_len() + HEADER_LEN,
        available: bytes.len(),
    })?;

    let declared = header.payload_length.get() as usize;
    if declared > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(declared));
    }

    let body = &rest[HEADER_LEN..];
    if body.len() != declared + HASH_LEN {
        return Err(WireError::LengthMismatch {
            declared,
            available: body.len().saturating_sub(HASH_LEN),
        });
    }

    let (payload, hash) = body.split_at(declared);
    let mut integrity_hash = [0u8; HASH_LEN];
    integrity_hash.copy_from_slice(hash);

    Ok(Frame {
        kind,
        transfer_id: header.transfer_id.get(),
        offset: header.offset.get(),
        iv: header.iv,
        payload: Bytes::copy_from_slice(payload),
        integrity_hash,
    })
}

// ── Stream framing ────────────────────────────────────────────────────────────

/// Splits a length-prefixed byte stream into frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    /// `max_frame_size` is capped at `MAX_FRAME_SIZE`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Pull the next frame out of `buf`.
    ///
    /// - `Ok(Some(frame))`: a frame was decoded and consumed from `buf`
    /// - `Ok(None)`: more bytes are needed, `buf` is untouched
    /// - `Err`: the prefix is out of range or the frame is malformed; the
    ///   stream can no longer be trusted and must be torn down
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len == 0 || len > self.max_frame_size {
            return Err(WireError::FrameLength {
                length: len,
                max: self.max_frame_size,
            });
        }

        if buf.len() < LENGTH_PREFIX_LEN + len {
            buf.reserve(LENGTH_PREFIX_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_LEN);
        let body = buf.split_to(len);
        decode(&body).map(Some)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame kind byte: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown control subtype byte: 0x{0:02x}")]
    UnknownControlKind(u8),

    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("declared payload length {declared} does not match {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("frame length {length} outside (0, {max}]")]
    FrameLength { length: usize, max: usize },

    #[error("acknowledgement payload must be {} bytes, got {0}", ACK_LEN)]
    BadAck(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
