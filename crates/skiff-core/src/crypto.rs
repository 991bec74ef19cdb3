//! Cryptographic primitives for Skiff.
//!
//! Provides three things:
//!   1. BLAKE3 hashing: chunk integrity hashes, whole-file hashes, session ids
//!   2. Ephemeral x25519 key agreement with HKDF-SHA256 session key derivation
//!   3. AES-256-GCM sealing of data chunks, bound to (transfer id, offset)
//!
//! Ephemeral secrets and derived keys are zeroized when dropped. No key
//! material is ever serialized. There is no unsafe code in this module.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::wire::{HASH_LEN, IV_LEN};

/// Length of a session key and of an x25519 public key.
pub const KEY_LEN: usize = 32;

/// AES-GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// HKDF info string. Changing it changes every derived key.
const SESSION_KEY_INFO: &[u8] = b"skiff session key v1";

/// Domain separator for the key confirmation tag.
const CONFIRMATION_CONTEXT: &[u8] = b"skiff key confirmation";

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for chunk integrity hashes, whole-file hashes, key salts and
/// session ids.
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for data read in pieces (whole-file hashes).
///
/// # Example
/// ```
/// use skiff_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, skiff_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; HASH_LEN] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the session id both peers agree on.
///
/// The two device ids are ordered before hashing so neither side's role
/// (who dialled whom) affects the result.
///
///   session_id = BLAKE3(min(a, b) || 0x00 || max(a, b))
pub fn derive_session_id(device_a: &str, device_b: &str) -> [u8; 32] {
    let (lo, hi) = if device_a <= device_b {
        (device_a, device_b)
    } else {
        (device_b, device_a)
    };
    let mut h = Hasher::new();
    h.update(lo.as_bytes());
    h.update(&[0x00]);
    h.update(hi.as_bytes());
    h.finalize()
}

// ── Key agreement ─────────────────────────────────────────────────────────────

/// Generate a random AEAD nonce. Never derived from counters: chunks are
/// re-encrypted on resume and a counter would repeat under the same key.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Validate a peer's public key bytes.
///
/// Must be exactly 32 bytes and not all zero. An all-zero key would pin the
/// shared secret to a known value.
pub fn validate_public_key(bytes: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let key: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| CryptoError::PublicKeyLength(bytes.len()))?;
    if key.iter().all(|b| *b == 0) {
        return Err(CryptoError::ZeroPublicKey);
    }
    Ok(key)
}

/// HKDF salt: BLAKE3 over both public keys in canonical order plus the
/// session id. Both peers compute the same salt whichever side initiated.
pub fn key_salt(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN], session_id: &[u8; 32]) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut h = Hasher::new();
    h.update(lo);
    h.update(hi);
    h.update(session_id);
    h.finalize()
}

/// An ephemeral x25519 key pair, valid for exactly one handshake attempt.
///
/// Consumed by `derive_session_key`, so the private half cannot outlive the
/// derivation. The secret is zeroized on drop by x25519-dalek.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public: [u8; KEY_LEN],
}

impl EphemeralKeypair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    /// Run Diffie-Hellman against the peer key and derive the session key.
    ///
    ///   shared = X25519(local_secret, remote_public)
    ///   key    = HKDF-SHA256(ikm = shared, salt = key_salt(..), info)
    ///
    /// Fails on an invalid peer key, a non-contributory exchange (low-order
    /// peer point), or an all-zero derived key.
    pub fn derive_session_key(
        self,
        remote_public: &[u8],
        session_id: &[u8; 32],
    ) -> Result<SessionKey, CryptoError> {
        let remote = validate_public_key(remote_public)?;
        let salt = key_salt(&self.public, &remote, session_id);

        let shared = self.secret.diffie_hellman(&PublicKey::from(remote));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        expand_session_key(shared.as_bytes(), &salt)
    }
}

/// HKDF-SHA256 expansion of a shared secret into a 32-byte session key.
pub fn expand_session_key(
    shared_secret: &[u8; 32],
    salt: &[u8; 32],
) -> Result<SessionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(SESSION_KEY_INFO, okm.as_mut())
        .map_err(|_| CryptoError::KeyDerivation)?;
    if okm.iter().all(|b| *b == 0) {
        return Err(CryptoError::ZeroSessionKey);
    }
    Ok(SessionKey(*okm))
}

/// The derived symmetric key for one session. Immutable once derived.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Tag each side sends after installing the key. Equal tags prove both
    /// sides derived the same key for the same session.
    pub fn confirmation_tag(&self, session_id: &[u8; 32]) -> [u8; 32] {
        let mut input = Vec::with_capacity(CONFIRMATION_CONTEXT.len() + session_id.len());
        input.extend_from_slice(CONFIRMATION_CONTEXT);
        input.extend_from_slice(session_id);
        *blake3::keyed_hash(&self.0, &input).as_bytes()
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

// ── Chunk sealing ─────────────────────────────────────────────────────────────

/// Additional authenticated data for a chunk:
///
///   BE32(transfer_id) || BE32(offset as u32)
///
/// Binds the ciphertext to its transfer and position so it cannot be
/// replayed into another transfer or another slot of the same file.
pub fn chunk_aad(transfer_id: u32, offset: u64) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&transfer_id.to_be_bytes());
    aad[4..].copy_from_slice(&(offset as u32).to_be_bytes());
    aad
}

/// A chunk ready to hand to the reliability engine.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub iv: [u8; IV_LEN],
    /// Ciphertext followed by the 16-byte tag.
    pub ciphertext: Vec<u8>,
    /// BLAKE3 of the plaintext.
    pub integrity_hash: [u8; HASH_LEN],
}

/// AES-256-GCM keyed with the session key.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt a plaintext chunk under a fresh random nonce.
    pub fn seal(
        &self,
        transfer_id: u32,
        offset: u64,
        plaintext: &[u8],
    ) -> Result<SealedChunk, CryptoError> {
        let iv = generate_iv();
        let aad = chunk_aad(transfer_id, offset);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Seal)?;
        Ok(SealedChunk {
            iv,
            ciphertext,
            integrity_hash: hash(plaintext),
        })
    }

    /// Decrypt and authenticate a chunk. Returns Err on truncation or tag
    /// mismatch, which includes any change to transfer id or offset.
    pub fn open(
        &self,
        transfer_id: u32,
        offset: u64,
        iv: &[u8; IV_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let aad = chunk_aad(transfer_id, offset);
        self.cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::Open)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(aes-256-gcm)")
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("peer public key must be 32 bytes, got {0}")]
    PublicKeyLength(usize),

    #[error("peer public key is all zeros")]
    ZeroPublicKey,

    #[error("key exchange was not contributory (low-order peer key)")]
    NonContributory,

    #[error("HKDF expansion failed")]
    KeyDerivation,

    #[error("derived session key is all zeros")]
    ZeroSessionKey,

    #[error("chunk encryption failed")]
    Seal,

    #[error("ciphertext too short (need at least 16 bytes for the tag)")]
    TooShort,

    #[error("chunk authentication failed")]
    Open,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
