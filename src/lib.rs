//! Transport-independent implementation of the QUIC connection protocol.
//!
//! This crate contains no I/O: the embedder owns the UDP socket, the TLS
//! stack, and the clock. A [`Connection`] is driven by feeding received
//! datagrams into [`Connection::recv`] and polling outgoing datagrams out of
//! [`Connection::poll_transmit`]; timestamps are passed in on every call and
//! [`Connection::next_expiry`] tells the embedder when to call
//! [`Connection::handle_timeout`]. Cryptographic primitives (AEAD and header
//! protection) are supplied through the [`CryptoBackend`] trait, and all
//! events (stream data, handshake bytes, lifecycle notifications) are
//! delivered through the [`ConnectionHandler`] trait.

use std::{fmt, ops};

mod cid;
mod cid_queue;
mod coding;
mod config;
mod congestion;
mod connection;
mod crypto;
mod frame;
mod handler;
mod packet;
mod range_set;
#[cfg(test)]
mod tests;
mod transport_error;
mod transport_parameters;
mod varint;

pub use crate::cid::{ConnectionId, ResetToken};
pub use crate::config::TransportConfig;
pub use crate::congestion::{Controller, ControllerFactory, NewReno, NewRenoConfig};
pub use crate::connection::{Close, Connection, Error, Transmit};
pub use crate::crypto::{
    CryptoBackend, CryptoError, DirectionalKeys, HeaderKey, KeyPair, Level, PacketKey,
};
pub use crate::frame::{ApplicationClose, ConnectionClose};
pub use crate::handler::{CallbackError, ConnectionHandler, KeyUpdate, PathOutcome};
pub use crate::transport_error::{TransportError, TransportErrorCode};
pub use crate::transport_parameters::{PreferredAddress, TransportParameters};
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().copied()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Bi => "bidirectional",
            Self::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The low two bits encode the initiating side and the directionality.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl StreamId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(f, "{} {} stream {}", initiator, self.dir(), self.index())
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        // Stream ids are 62-bit by construction
        unsafe { Self::from_u64_unchecked(x.0) }
    }
}

impl From<StreamId> for u64 {
    fn from(x: StreamId) -> Self {
        x.0
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::from(*self).encode(buf)
    }
}

//
// Useful internal constants
//

/// The maximum connection ID length QUIC permits on the wire
const MAX_CID_SIZE: usize = 20;
/// Shortest non-empty connection ID we will issue or accept locally
const MIN_CID_SIZE: usize = 4;
/// Smallest datagram a client may send to initiate a connection
const MIN_INITIAL_SIZE: usize = 1200;
/// Stateless reset tokens are always 16 bytes
const RESET_TOKEN_SIZE: usize = 16;
/// Length of the ciphertext sample used for header protection
const HP_SAMPLE_SIZE: usize = 16;
/// Coarsest granularity at which timers fire
const TIMER_GRANULARITY: std::time::Duration = std::time::Duration::from_millis(1);
/// Bound on buffered out-of-order CRYPTO data per encryption level
const MAX_CRYPTO_BUFFER: usize = 256 * 1024;
/// Number of local connection IDs kept issued to the peer
const LOCAL_CID_COUNT: usize = 8;

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn side_negation() {
        assert_eq!(!Side::Client, Side::Server);
        assert_eq!(!Side::Server, Side::Client);
    }

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Client, Dir::Bi, 3);
        assert_eq!(id.0, 12);
        assert_eq!(id.initiator(), Side::Client);
        assert_eq!(id.dir(), Dir::Bi);
        assert_eq!(id.index(), 3);

        let id = StreamId::new(Side::Server, Dir::Uni, 1);
        assert_eq!(id.0, 7);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
    }
}
