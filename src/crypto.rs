//! Key material and the embedder-supplied cryptography interface.
//!
//! The engine implements no cryptography of its own. The embedder's TLS
//! stack derives key material and installs it per encryption level; packet
//! sealing, opening, and header-protection mask computation are delegated
//! to a [`CryptoBackend`]. The engine owns what remains: nonce
//! construction, sample placement, and key-update staging.

use std::fmt;

use bytes::BytesMut;
use thiserror::Error;
use tinyvec::ArrayVec;

use crate::packet::SpaceId;

/// Encryption level of a packet or of handshake data
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl Level {
    pub(crate) fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::OneRtt => SpaceId::Data,
        }
    }

    pub(crate) fn from_space(space: SpaceId) -> Self {
        match space {
            SpaceId::Initial => Self::Initial,
            SpaceId::Handshake => Self::Handshake,
            SpaceId::Data => Self::OneRtt,
        }
    }
}

/// AEAD key and IV protecting packet payloads in one direction
#[derive(Clone)]
pub struct PacketKey {
    /// Key for the embedder's AEAD
    pub key: Vec<u8>,
    /// Static IV; the per-packet nonce is this IV XOR the packet number
    pub iv: Vec<u8>,
}

impl fmt::Debug for PacketKey {
    // Key material stays out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketKey")
            .field("key_len", &self.key.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// Key for deriving header-protection masks in one direction
#[derive(Clone)]
pub struct HeaderKey(Vec<u8>);

impl HeaderKey {
    pub fn new(key: Vec<u8>) -> Self {
        Self(key)
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderKey")
            .field("key_len", &self.0.len())
            .finish()
    }
}

impl std::ops::Deref for HeaderKey {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// A pair of keys for bidirectional communication
///
/// `local` protects data we send; `remote` opens data the peer sent.
#[derive(Debug, Clone)]
pub struct KeyPair<T> {
    pub local: T,
    pub remote: T,
}

/// Key material protecting one direction of one encryption level
#[derive(Debug, Clone)]
pub struct DirectionalKeys {
    pub header: HeaderKey,
    pub packet: PacketKey,
}

/// Complete key material for one encryption level
#[derive(Debug, Clone)]
pub(crate) struct Keys {
    pub(crate) header: KeyPair<HeaderKey>,
    pub(crate) packet: KeyPair<PacketKey>,
}

impl Keys {
    pub(crate) fn new(tx: DirectionalKeys, rx: DirectionalKeys) -> Self {
        Self {
            header: KeyPair {
                local: tx.header,
                remote: rx.header,
            },
            packet: KeyPair {
                local: tx.packet,
                remote: rx.packet,
            },
        }
    }
}

/// Error returned by a [`CryptoBackend`] primitive
///
/// An `open` failure is routine (reordered, spoofed, or key-phase-skewed
/// packets); the engine discards the packet. A `seal` failure is treated
/// as a fatal callback failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("cryptographic operation failed")]
pub struct CryptoError;

/// AEAD and header-protection primitives supplied by the embedder
///
/// Implementations must be deterministic and stateless with respect to the
/// connection: all state (keys) is passed in per call. The `level`
/// parameter lets an embedder that uses distinct algorithms for Initial
/// packets dispatch accordingly.
pub trait CryptoBackend {
    /// Seal `packet[header_len..len - tag_len]` in place
    ///
    /// `packet[..header_len]` is the associated data. On entry the tail of
    /// `packet` reserves `tag_len()` bytes for the authentication tag; on
    /// success the payload is replaced by ciphertext and the tag filled in.
    fn seal(
        &self,
        level: Level,
        key: &PacketKey,
        nonce: &[u8],
        packet: &mut [u8],
        header_len: usize,
    ) -> Result<(), CryptoError>;

    /// Open `payload` in place, verifying the tag
    ///
    /// `header` is the associated data. On success `payload` is truncated
    /// to the plaintext.
    fn open(
        &self,
        level: Level,
        key: &PacketKey,
        nonce: &[u8],
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;

    /// Compute the 5-byte header-protection mask for a ciphertext sample
    fn header_mask(&self, level: Level, key: &HeaderKey, sample: &[u8]) -> [u8; 5];

    /// Length of the authentication tag the AEAD appends
    fn tag_len(&self, level: Level) -> usize;
}

/// Per-packet AEAD nonce: the static IV XOR the big-endian packet number,
/// zero-padded on the left
pub(crate) fn packet_nonce(iv: &[u8], number: u64) -> ArrayVec<[u8; 16]> {
    debug_assert!(iv.len() >= 8 && iv.len() <= 16);
    let mut nonce = ArrayVec::new();
    nonce.extend_from_slice(iv);
    let count = number.to_be_bytes();
    let offset = iv.len() - count.len();
    for (i, b) in count.iter().enumerate() {
        nonce[offset + i] ^= *b;
    }
    nonce
}
