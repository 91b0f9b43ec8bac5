//! The embedder callback table.
//!
//! A C-style function table becomes a single capability trait: required
//! operations are abstract methods, optional notifications carry no-op
//! default implementations. Callbacks receive only the parameters they
//! need and must not re-enter the [`Connection`](crate::Connection) that
//! invoked them; the borrow checker enforces this as long as the handler
//! does not own the connection.

use std::net::SocketAddr;

use thiserror::Error;

use crate::cid::{ConnectionId, ResetToken};
use crate::crypto::{Level, PacketKey};
use crate::transport_parameters::PreferredAddress;
use crate::{Dir, StreamId, VarInt};

/// Error returned from a fallible embedder callback
///
/// Any callback failure is fatal to the connection; the driver call that
/// triggered it returns [`Error::CallbackFailure`](crate::Error).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("embedder callback failed")]
pub struct CallbackError;

/// Outcome of a path validation attempt
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathOutcome {
    Success,
    Failure,
}

/// Next-generation keys produced by the embedder for a key update
#[derive(Debug, Clone)]
pub struct KeyUpdate {
    /// Protects packets we will send in the new phase
    pub local: PacketKey,
    /// Opens packets the peer sends in the new phase
    pub remote: PacketKey,
}

/// Embedder-supplied event sinks and services
///
/// Methods that report data or lifecycle events have no-op defaults so an
/// embedder only implements what it consumes. The handful of abstract
/// methods are services the engine cannot run without.
#[allow(unused_variables)]
pub trait ConnectionHandler {
    /// Contiguous handshake bytes arrived at the given encryption level
    ///
    /// The embedder feeds these to its TLS stack.
    fn recv_crypto_data(
        &mut self,
        level: Level,
        offset: u64,
        data: &[u8],
    ) -> Result<(), CallbackError>;

    /// Contiguous stream bytes arrived; `fin` marks the final delivery
    fn recv_stream_data(
        &mut self,
        id: StreamId,
        fin: bool,
        offset: u64,
        data: &[u8],
    ) -> Result<(), CallbackError>;

    /// Produce a fresh local connection ID and its stateless reset token
    fn new_connection_id(&mut self) -> Result<(ConnectionId, ResetToken), CallbackError>;

    /// Derive the next-generation packet keys for a key update
    fn update_keys(&mut self) -> Result<KeyUpdate, CallbackError>;

    /// Fill `dest` with cryptographically secure random bytes
    fn rand(&mut self, dest: &mut [u8]);

    /// A server received its first Initial packet, carrying `dcid`
    ///
    /// The embedder derives and installs Initial keys from it.
    fn recv_client_initial(&mut self, dcid: &ConnectionId) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The handshake completed and the peer is verified
    fn handshake_completed(&mut self) {}

    /// The peer opened a stream
    fn stream_opened(&mut self, id: StreamId) {}

    /// A stream was fully closed and its state discarded
    fn stream_closed(&mut self, id: StreamId, error: Option<VarInt>) {}

    /// The peer abruptly terminated its sending side of a stream
    fn stream_reset(&mut self, id: StreamId, final_size: u64, error: VarInt) {}

    /// The peer raised the number of streams we may open
    fn max_streams_extended(&mut self, dir: Dir, max: u64) {}

    /// The peer raised a stream's flow control limit
    fn max_stream_data_extended(&mut self, id: StreamId, max: u64) {}

    /// A local connection ID finished retirement and left the routing table
    fn retire_connection_id(&mut self, cid: &ConnectionId) {}

    /// Path validation concluded
    fn path_validated(&mut self, remote: SocketAddr, outcome: PathOutcome) {}

    /// The server offered a preferred address; return `Some` to migrate to
    /// it after the handshake
    fn select_preferred_address(&mut self, preferred: &PreferredAddress) -> Option<SocketAddr> {
        None
    }

    /// A Version Negotiation packet listed the peer's supported versions
    fn recv_version_negotiation(&mut self, versions: &[u32]) {}

    /// A Retry packet arrived; the engine already updated its state
    ///
    /// The embedder must re-derive Initial keys from `new_dcid`.
    fn recv_retry(&mut self, new_dcid: &ConnectionId) -> Result<(), CallbackError> {
        Ok(())
    }

    /// A stateless reset for this connection was detected
    fn recv_stateless_reset(&mut self) {}
}
