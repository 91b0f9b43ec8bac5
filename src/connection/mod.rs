use std::{
    cmp,
    collections::VecDeque,
    mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error as ThisError;
use tracing::{debug, trace, warn};

use crate::cid::{ConnectionId, ResetToken};
use crate::cid_queue::{CidQueue, InsertError, IssuedCid};
use crate::coding::BufMutExt;
use crate::config::TransportConfig;
use crate::crypto::{
    packet_nonce, CryptoBackend, DirectionalKeys, KeyPair, Keys, Level, PacketKey,
};
use crate::frame::{self, Frame, FrameStruct, FrameType};
use crate::handler::{CallbackError, ConnectionHandler, PathOutcome};
use crate::packet::{
    Header, LongType, Packet, PacketDecodeError, PacketNumber, PartialDecode, SpaceId,
};
use crate::range_set::ArrayRangeSet;
use crate::transport_error::{TransportError, TransportErrorCode};
use crate::transport_parameters::TransportParameters;
use crate::{
    Dir, Side, StreamId, VarInt, LOCAL_CID_COUNT, MAX_CRYPTO_BUFFER, MIN_INITIAL_SIZE,
    RESET_TOKEN_SIZE, TIMER_GRANULARITY,
};

mod assembler;
mod cid_state;
mod packet_builder;
mod paths;
mod send_buffer;
mod spaces;
mod streams;
mod timer;

use cid_state::CidState;
use packet_builder::PacketBuilder;
use paths::{PathData, PathValidator};
use spaces::{PacketSpace, SentPacket, ThinRetransmits};
use streams::{StreamsState, WriteError};
use timer::{Timer, TimerTable};

pub use crate::frame::Close;

/// A datagram ready to be handed to the socket
#[derive(Debug)]
pub struct Transmit {
    /// Address the datagram must be sent to
    pub destination: SocketAddr,
    /// Number of bytes written into the caller's buffer
    pub size: usize,
}

/// Errors surfaced by the driver API
#[derive(Debug, Clone, Eq, PartialEq, ThisError)]
pub enum Error {
    /// The peer violated the protocol; the connection is now closing
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The connection is closing; only the drain period remains
    #[error("connection is closing")]
    Closing,
    /// The peer closed the connection
    #[error("connection is draining")]
    Draining,
    /// The operation is not valid in the connection's current state
    #[error("operation not valid in the current state")]
    InvalidState,
    /// Flow control forbids sending more data; retry after the peer
    /// extends credit
    #[error("blocked by flow control")]
    Blocked,
    /// No more streams of this type may currently be opened
    #[error("stream id space exhausted")]
    StreamIdExhausted,
    /// The stream does not exist or the operation targets a missing half
    #[error("unknown stream")]
    UnknownStream,
    /// FIN or a reset was already queued on this stream
    #[error("stream already finished")]
    StreamFinished,
    /// The peer asked us to stop sending on this stream
    #[error("stream stopped by peer")]
    StreamStopped,
    /// No connection ID is available for the operation
    #[error("connection ids exhausted")]
    ConnectionIdsExhausted,
    /// The packet number space is exhausted; the connection must end
    #[error("packet number space exhausted")]
    PacketNumberExhausted,
    /// An embedder callback reported failure
    #[error("embedder callback failed")]
    CallbackFailure,
}

impl From<CallbackError> for Error {
    fn from(_: CallbackError) -> Self {
        Self::CallbackFailure
    }
}

/// Top-level connection state
#[derive(Debug, Clone)]
enum State {
    /// Waiting for the first Initial packet to be sent or received
    Initial,
    /// The handshake is in progress
    WaitHandshake,
    /// The handshake completed; application data flows
    Established,
    /// We sent CONNECTION_CLOSE and linger briefly for the peer
    Closing { reason: Close },
    /// The peer closed; we wait out the drain period silently
    Draining,
    /// Fully terminated
    Drained,
}

impl State {
    fn is_established(&self) -> bool {
        matches!(*self, Self::Established)
    }

    fn is_closed(&self) -> bool {
        matches!(*self, Self::Closing { .. } | Self::Draining | Self::Drained)
    }
}

/// Previous-generation 1-RTT keys retained across a key update
struct PrevCrypto {
    packet: KeyPair<PacketKey>,
    /// The incoming packet that ends the interval for which these keys are
    /// applicable, and the time of its receipt
    ///
    /// `None` means the peer has not been observed on the new phase yet,
    /// which is the case right after a locally initiated update.
    end_packet: Option<(u64, Instant)>,
}

/// Protocol state machine for a single QUIC connection
///
/// Owns no sockets, no TLS state, and no clock: datagrams are fed in with
/// [`Connection::recv`], polled out with [`Connection::poll_transmit`], and
/// every call that can advance time-dependent state takes `now`.
pub struct Connection {
    side: Side,
    config: Arc<TransportConfig>,
    state: State,
    /// Whether the close packet for `State::Closing` still needs to be sent
    close_pending: bool,

    spaces: [PacketSpace; 3],
    highest_space: SpaceId,
    zero_rtt_crypto: Option<Keys>,
    /// 1-RTT key phase bit currently in use for sending
    key_phase: bool,
    prev_crypto: Option<PrevCrypto>,

    path: PathData,
    /// The previous path, kept as a fallback while a migration validates
    prev_path: Option<PathData>,
    path_validator: Option<PathValidator>,
    /// PATH_RESPONSE payloads owed, with the address they must go to
    path_responses: VecDeque<(u64, SocketAddr)>,

    /// The destination CID of the very first Initial packet
    orig_dcid: ConnectionId,
    /// Token to include in Initial packets, from a Retry
    initial_token: Bytes,
    /// Connection IDs issued by the peer
    rem_cids: CidQueue,
    /// Connection IDs we issued
    local_cids: CidState,
    local_cid_len: usize,
    /// Stateless reset token for the CID the peer used in the handshake
    peer_reset_token: Option<ResetToken>,

    streams: StreamsState,
    /// Bytes of stream data received, counted against `max_data_local`
    rx_data: u64,
    /// Connection-level receive credit we have advertised
    max_data_local: u64,
    /// Receive credit granted by the application but not yet advertised
    unsent_max_data: u64,
    /// Bytes of stream data the application has queued
    tx_data: u64,
    /// Connection-level send credit granted by the peer
    max_data_remote: u64,

    peer_params: TransportParameters,
    peer_params_set: bool,

    timers: TimerTable,
    /// Exponential backoff for probe timeouts
    pto_count: u32,
    /// Exponential backoff for handshake retransmits
    crypto_count: u32,
    /// Datagrams that arrived before their keys; replayed once keys land
    undecryptable: Vec<(SocketAddr, BytesMut)>,
    /// First Initial from the client has been seen (server)
    initial_received: bool,
    /// The handshake is confirmed at both peers
    handshake_confirmed: bool,
    error: Option<TransportError>,
}

impl Connection {
    /// Create the client end of a connection
    ///
    /// `initial_dcid` is the random destination CID the Initial packets are
    /// keyed on; `local_cid` is the source CID we route on. The embedder
    /// derives and installs Initial keys from `initial_dcid`, queues the
    /// ClientHello with [`Connection::submit_crypto_data`], and then polls.
    pub fn new_client(
        config: Arc<TransportConfig>,
        remote: SocketAddr,
        initial_dcid: ConnectionId,
        local_cid: ConnectionId,
        now: Instant,
    ) -> Self {
        let mut this = Self::new(config, Side::Client, remote, initial_dcid, local_cid, now);
        this.path.validated = true;
        this
    }

    /// Create the server end of a connection
    ///
    /// `client_dcid` is the destination CID of the client's first Initial
    /// (used for Initial keys and transport parameter authentication);
    /// `client_scid` is the client's chosen source CID, which becomes our
    /// destination; `local_cid` is the fresh CID we will ask the client to
    /// switch to.
    pub fn new_server(
        config: Arc<TransportConfig>,
        remote: SocketAddr,
        client_dcid: ConnectionId,
        client_scid: ConnectionId,
        local_cid: ConnectionId,
        now: Instant,
    ) -> Self {
        let mut this = Self::new(config, Side::Server, remote, client_scid, local_cid, now);
        this.orig_dcid = client_dcid;
        this
    }

    fn new(
        config: Arc<TransportConfig>,
        side: Side,
        remote: SocketAddr,
        remote_cid: ConnectionId,
        local_cid: ConnectionId,
        now: Instant,
    ) -> Self {
        let path = PathData::new(remote, now, &config);
        let streams = StreamsState::new(
            side,
            config.stream_receive_window.into_inner(),
            config.max_concurrent_bidi_streams.into_inner(),
            config.max_concurrent_uni_streams.into_inner(),
        );
        let receive_window = config.receive_window.into_inner();
        Self {
            side,
            state: State::Initial,
            close_pending: false,
            spaces: [PacketSpace::new(), PacketSpace::new(), PacketSpace::new()],
            highest_space: SpaceId::Initial,
            zero_rtt_crypto: None,
            key_phase: false,
            prev_crypto: None,
            path,
            prev_path: None,
            path_validator: None,
            path_responses: VecDeque::new(),
            orig_dcid: remote_cid,
            initial_token: Bytes::new(),
            rem_cids: CidQueue::new(remote_cid),
            local_cid_len: local_cid.len(),
            local_cids: CidState::new(local_cid),
            peer_reset_token: None,
            streams,
            rx_data: 0,
            max_data_local: receive_window,
            unsent_max_data: receive_window,
            tx_data: 0,
            max_data_remote: 0,
            peer_params: TransportParameters::default(),
            peer_params_set: false,
            timers: TimerTable::default(),
            pto_count: 0,
            crypto_count: 0,
            undecryptable: Vec::new(),
            initial_received: false,
            handshake_confirmed: false,
            error: None,
            config,
        }
    }

    /// Which side of the connection we are
    pub fn side(&self) -> Side {
        self.side
    }

    /// Address of the peer on the current path
    pub fn remote_address(&self) -> SocketAddr {
        self.path.remote
    }

    /// Whether the handshake has completed
    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    /// Whether the connection is closing, draining, or fully terminated
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Current best RTT estimate
    pub fn rtt(&self) -> Duration {
        self.path.rtt.get()
    }

    /// Congestion-controlled bytes currently in flight
    pub fn bytes_in_flight(&self) -> u64 {
        self.spaces.iter().map(|x| x.in_flight).sum()
    }

    /// The protocol violation that closed the connection, if any
    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    //
    // Keys and transport parameters
    //

    /// Install packet protection for the Initial encryption level
    pub fn install_initial_keys(&mut self, tx: DirectionalKeys, rx: DirectionalKeys) {
        self.spaces[SpaceId::Initial].crypto = Some(Keys::new(tx, rx));
    }

    /// Install packet protection for the Handshake encryption level
    pub fn install_handshake_keys(&mut self, tx: DirectionalKeys, rx: DirectionalKeys) {
        self.spaces[SpaceId::Handshake].crypto = Some(Keys::new(tx, rx));
        self.highest_space = cmp::max(self.highest_space, SpaceId::Handshake);
    }

    /// Install 0-RTT packet protection
    ///
    /// Clients protect early data with these keys; servers open it.
    pub fn install_early_keys(&mut self, keys: DirectionalKeys) {
        self.zero_rtt_crypto = Some(Keys::new(keys.clone(), keys));
    }

    /// Install packet protection for the 1-RTT encryption level
    pub fn install_1rtt_keys(&mut self, tx: DirectionalKeys, rx: DirectionalKeys) {
        self.spaces[SpaceId::Data].crypto = Some(Keys::new(tx, rx));
        self.highest_space = SpaceId::Data;
    }

    /// Record the transport parameters negotiated by TLS
    pub fn set_peer_params(&mut self, params: TransportParameters) -> Result<(), Error> {
        if self.side.is_client() {
            // Authenticate the CIDs used during the handshake
            if params.initial_src_cid != Some(self.rem_cids.active()) {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "initial_source_connection_id mismatch",
                )
                .into());
            }
            if params.original_dst_cid != Some(self.orig_dcid) {
                return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                    "original_destination_connection_id mismatch",
                )
                .into());
            }
            if let Some(token) = params.stateless_reset_token {
                self.peer_reset_token = Some(token);
            }
        }
        self.streams.set_params(&params);
        self.max_data_remote = params.initial_max_data.into_inner();
        self.peer_params = params;
        self.peer_params_set = true;
        Ok(())
    }

    /// The transport parameters the embedder's TLS stack should carry
    pub fn local_transport_params(&self) -> TransportParameters {
        let mut params = TransportParameters {
            initial_max_data: self.config.receive_window,
            initial_max_stream_data_bidi_local: self.config.stream_receive_window,
            initial_max_stream_data_bidi_remote: self.config.stream_receive_window,
            initial_max_stream_data_uni: self.config.stream_receive_window,
            initial_max_streams_bidi: self.config.max_concurrent_bidi_streams,
            initial_max_streams_uni: self.config.max_concurrent_uni_streams,
            max_udp_payload_size: VarInt::from_u32(65527),
            ack_delay_exponent: VarInt::from_u32(self.config.ack_delay_exponent as u32),
            max_ack_delay: VarInt::from_u64(self.config.max_ack_delay.as_millis() as u64)
                .unwrap_or(VarInt::from_u32(25)),
            max_idle_timeout: self
                .config
                .max_idle_timeout
                .and_then(|x| VarInt::from_u64(x.as_millis() as u64).ok())
                .unwrap_or(VarInt::from_u32(0)),
            active_connection_id_limit: VarInt::from_u32(CidQueue::LEN as u32),
            initial_src_cid: Some(self.local_cids.initial_cid()),
            ..TransportParameters::default()
        };
        if self.side.is_server() {
            params.original_dst_cid = Some(self.orig_dcid);
        }
        params
    }

    //
    // Handshake plumbing
    //

    /// Queue handshake bytes produced by the embedder's TLS stack
    pub fn submit_crypto_data(&mut self, level: Level, data: Bytes) -> Result<(), Error> {
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        if level == Level::ZeroRtt {
            return Err(Error::InvalidState);
        }
        self.spaces[level.space()].queue_crypto(data);
        Ok(())
    }

    /// Signal that the embedder's TLS stack finished the handshake
    ///
    /// The peer's transport parameters must have been supplied first.
    pub fn handshake_completed(&mut self) -> Result<(), Error> {
        if self.state.is_closed() || self.state.is_established() {
            return Err(Error::InvalidState);
        }
        if !self.peer_params_set || self.spaces[SpaceId::Data].crypto.is_none() {
            return Err(Error::InvalidState);
        }
        self.state = State::Established;
        trace!("handshake complete");
        self.discard_space(SpaceId::Initial);
        if self.side.is_server() {
            // Completion also confirms the handshake for the server
            self.spaces[SpaceId::Data].pending.handshake_done = true;
            self.handshake_confirmed = true;
            self.discard_space(SpaceId::Handshake);
        }
        Ok(())
    }

    fn closed_error(&self) -> Error {
        match self.state {
            State::Closing { .. } => Error::Closing,
            State::Draining => Error::Draining,
            _ => Error::InvalidState,
        }
    }

    fn discard_space(&mut self, space: SpaceId) {
        debug_assert_ne!(space, SpaceId::Data, "1-RTT state is never discarded");
        trace!(?space, "discarding space");
        self.spaces[space] = PacketSpace::new();
        self.set_loss_detection_timer();
    }
}

impl Connection {
    //
    // Stream operations
    //

    /// Open a locally initiated stream, attaching an opaque `user` handle
    pub fn open_stream(&mut self, dir: Dir, user: u64) -> Result<StreamId, Error> {
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        match self.streams.open(dir, user) {
            Some(id) => Ok(id),
            None => {
                let limit = self.streams.local_limit(dir);
                self.spaces[SpaceId::Data].pending.streams_blocked[dir as usize] = Some(limit);
                Err(Error::StreamIdExhausted)
            }
        }
    }

    /// Queue stream data, returning the number of bytes accepted
    ///
    /// Bytes are accepted up to the stream's and the connection's flow
    /// control limits; [`Error::Blocked`] means nothing could be accepted
    /// and a *_BLOCKED frame has been queued to prod the peer.
    pub fn write_stream(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, Error> {
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        let conn_credit = self.max_data_remote.saturating_sub(self.tx_data);
        match self.streams.write(id, data, fin, conn_credit) {
            Ok(outcome) => {
                self.tx_data += outcome.written as u64;
                Ok(outcome.written)
            }
            Err(WriteError::Blocked { conn, stream_at }) => {
                let pending = &mut self.spaces[SpaceId::Data].pending;
                if conn {
                    pending.data_blocked = true;
                } else {
                    pending.stream_data_blocked.push((id, stream_at));
                }
                Err(Error::Blocked)
            }
            Err(WriteError::Stopped) => Err(Error::StreamStopped),
            Err(WriteError::Finished) => Err(Error::StreamFinished),
            Err(WriteError::UnknownStream) => Err(Error::UnknownStream),
        }
    }

    /// Vectored variant of [`Connection::write_stream`]
    ///
    /// `fin` applies after the final buffer; a partial write never queues
    /// it.
    pub fn writev_stream(&mut self, id: StreamId, iovs: &[&[u8]], fin: bool) -> Result<usize, Error> {
        let mut written = 0;
        for (i, iov) in iovs.iter().enumerate() {
            let last = i == iovs.len() - 1;
            match self.write_stream(id, iov, fin && last) {
                Ok(n) => {
                    written += n;
                    if n < iov.len() {
                        return Ok(written);
                    }
                }
                Err(Error::Blocked) if written > 0 => return Ok(written),
                Err(e) => return Err(e),
            }
        }
        if iovs.is_empty() && fin {
            self.write_stream(id, &[], true)?;
        }
        Ok(written)
    }

    /// Abruptly terminate our sending side of a stream
    pub fn reset_stream(&mut self, id: StreamId, error_code: VarInt) -> Result<(), Error> {
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        self.streams
            .reset(id, error_code, &mut self.spaces[SpaceId::Data].pending)
            .map_err(|_| Error::UnknownStream)
    }

    /// Ask the peer to stop sending on a stream
    pub fn stop_sending(&mut self, id: StreamId, error_code: VarInt) -> Result<(), Error> {
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        self.streams
            .stop_sending(id, error_code, &mut self.spaces[SpaceId::Data].pending)
            .map_err(|_| Error::UnknownStream)
    }

    /// Terminate both directions of a stream
    pub fn shutdown_stream(&mut self, id: StreamId, error_code: VarInt) -> Result<(), Error> {
        let reset = self.reset_stream(id, error_code);
        let stop = self.stop_sending(id, error_code);
        // Either half sufficing is fine for uni streams
        if reset.is_err() && stop.is_err() {
            return reset;
        }
        Ok(())
    }

    /// Return connection-level receive credit to the peer
    ///
    /// Called as the application consumes delivered data. A MAX_DATA frame
    /// goes out once half the receive window has been returned.
    pub fn extend_max_data(&mut self, bytes: u64) {
        self.unsent_max_data = self.unsent_max_data.saturating_add(bytes);
        if self.unsent_max_data - self.max_data_local > self.config.receive_window.into_inner() / 2
        {
            self.spaces[SpaceId::Data].pending.max_data = true;
        }
    }

    /// Return stream-level receive credit to the peer
    pub fn extend_max_stream_data(&mut self, id: StreamId, bytes: u64) -> Result<(), Error> {
        let stream = self
            .streams
            .streams
            .get_mut(&id)
            .ok_or(Error::UnknownStream)?;
        let rx = stream.recv.as_mut().ok_or(Error::UnknownStream)?;
        rx.unsent_max_data = rx.unsent_max_data.saturating_add(bytes);
        if rx.unsent_max_data - rx.max_data > self.config.stream_receive_window.into_inner() / 2 {
            self.spaces[SpaceId::Data].pending.max_stream_data.insert(id);
        }
        Ok(())
    }

    /// The application handle attached to a stream
    pub fn stream_user(&self, id: StreamId) -> Option<u64> {
        self.streams.streams.get(&id).map(|x| x.user)
    }

    /// Attach an application handle to a stream
    pub fn set_stream_user(&mut self, id: StreamId, user: u64) -> Result<(), Error> {
        let stream = self
            .streams
            .streams
            .get_mut(&id)
            .ok_or(Error::UnknownStream)?;
        stream.user = user;
        Ok(())
    }

    //
    // Termination and timers
    //

    /// Close the connection, producing the CONNECTION_CLOSE datagram
    ///
    /// Returns the datagram to send; the connection enters the closing
    /// state and rejects further traffic.
    pub fn close(
        &mut self,
        backend: &dyn CryptoBackend,
        buf: &mut Vec<u8>,
        reason: Close,
        now: Instant,
    ) -> Result<Transmit, Error> {
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        // Application errors can't be expressed before 1-RTT keys exist
        let reason = match (&reason, self.highest_space) {
            (Close::Application(_), SpaceId::Initial | SpaceId::Handshake) => {
                Close::Connection(TransportError::APPLICATION_ERROR("").into())
            }
            _ => reason,
        };
        self.state = State::Closing { reason };
        self.close_pending = true;
        self.timers.set(Timer::Close, now + 3 * self.pto());
        buf.clear();
        let size = self.write_close_packet(backend, buf)?;
        Ok(Transmit {
            destination: self.path.remote,
            size,
        })
    }

    fn write_close_packet(
        &mut self,
        backend: &dyn CryptoBackend,
        buf: &mut Vec<u8>,
    ) -> Result<usize, Error> {
        let State::Closing { reason } = self.state.clone() else {
            return Err(Error::InvalidState);
        };
        self.close_pending = false;
        let space_id = self.highest_space;
        let Some(keys) = self.spaces[space_id].crypto.clone() else {
            return Err(Error::InvalidState);
        };
        let level = Level::from_space(space_id);
        let number = self.spaces[space_id].get_tx_number();
        let pn = PacketNumber::new(number, self.spaces[space_id].largest_acked_packet);
        let header = self.header_for(space_id, pn);
        let tag_len = backend.tag_len(level);
        let mut builder = PacketBuilder::new(
            buf,
            &header,
            number,
            tag_len,
            0,
            self.config.max_udp_payload_size as usize,
        );
        // Close frames in handshake spaces must not leak application state
        let reason = match (space_id, &reason) {
            (SpaceId::Data, _) => reason,
            (_, Close::Connection(_)) => reason,
            _ => Close::Connection(TransportError::APPLICATION_ERROR("").into()),
        };
        reason.encode(buf, builder.left(buf));
        if space_id == SpaceId::Initial && self.side.is_client() {
            builder.pad_to(MIN_INITIAL_SIZE);
        }
        let size = builder
            .finish(buf, backend, level, &keys)
            .map_err(|_| Error::CallbackFailure)?;
        self.path.total_sent += size as u64;
        Ok(size)
    }

    /// The earliest time at which [`Connection::handle_timeout`] should run
    pub fn next_expiry(&mut self) -> Option<Instant> {
        self.timers.peek().map(|entry| entry.time)
    }

    /// Run every timer that has expired by `now`
    pub fn handle_timeout<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        now: Instant,
    ) -> Result<(), Error> {
        while let Some(timer) = self.timers.expire_before(now) {
            trace!(?timer, "timeout");
            match timer {
                Timer::Idle => {
                    // Idle connections vanish without a close packet
                    self.state = State::Drained;
                }
                Timer::Close => {
                    self.state = State::Drained;
                }
                Timer::KeyDiscard => {
                    self.prev_crypto = None;
                }
                Timer::AckDelay => {
                    // Wakes the embedder; the pending ACK is now due and
                    // the next poll_transmit will carry it
                }
                Timer::LossDetection => {
                    self.on_loss_detection_timeout(now);
                }
                Timer::PathValidation => {
                    self.on_path_validation_timeout(handler, now);
                }
                Timer::CidRetirement => {
                    for cid in self.local_cids.expire(now) {
                        handler.retire_connection_id(&cid);
                    }
                    if let Some(next) = self.local_cids.next_expiry() {
                        self.timers.set(Timer::CidRetirement, next);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_path_validation_timeout<H: ConnectionHandler>(&mut self, handler: &mut H, now: Instant) {
        let pto = self.pto();
        let initial_rtt = self.config.initial_rtt;
        let Some(validator) = self.path_validator.as_mut() else {
            return;
        };
        validator.loss_count += 1;
        if validator.exhausted() {
            let remote = validator.remote;
            debug!(%remote, "path validation failed");
            self.path_validator = None;
            if let Some(prev) = self.prev_path.take() {
                self.path = prev;
            }
            handler.path_validated(remote, PathOutcome::Failure);
            return;
        }
        let mut token = [0; 8];
        handler.rand(&mut token);
        validator.token = u64::from_be_bytes(token);
        validator.challenge_pending = true;
        let deadline = now + PathValidator::timeout(pto, initial_rtt, validator.loss_count);
        validator.deadline = deadline;
        self.timers.set(Timer::PathValidation, deadline);
    }

    /// Probe timeout, before backoff
    fn pto(&self) -> Duration {
        self.path.rtt.pto_base() + self.peer_max_ack_delay()
    }

    fn peer_max_ack_delay(&self) -> Duration {
        if !self.peer_params_set || !self.handshake_confirmed {
            return Duration::ZERO;
        }
        Duration::from_millis(self.peer_params.max_ack_delay.into_inner())
    }

    fn reset_idle_timer(&mut self, now: Instant) {
        let local = self.config.max_idle_timeout;
        let peer = match self.peer_params.max_idle_timeout.into_inner() {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let timeout = match (local, peer) {
            (Some(a), Some(b)) => Some(cmp::min(a, b)),
            (a, b) => a.or(b),
        };
        if let Some(timeout) = timeout {
            self.timers.set(Timer::Idle, now + timeout);
        }
    }

    /// Arm a locally initiated key update
    ///
    /// The embedder supplies next-generation keys; the next short-header
    /// packet sent uses the new phase.
    pub fn initiate_key_update<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), Error> {
        if !self.state.is_established() || !self.handshake_confirmed {
            return Err(Error::InvalidState);
        }
        if self
            .prev_crypto
            .as_ref()
            .is_some_and(|prev| prev.end_packet.is_none())
        {
            // The previous update hasn't been confirmed by the peer yet
            return Err(Error::InvalidState);
        }
        let update = handler.update_keys()?;
        let keys = self.spaces[SpaceId::Data]
            .crypto
            .as_mut()
            .ok_or(Error::InvalidState)?;
        let old = mem::replace(
            &mut keys.packet,
            KeyPair {
                local: update.local,
                remote: update.remote,
            },
        );
        self.prev_crypto = Some(PrevCrypto {
            packet: old,
            end_packet: None,
        });
        self.key_phase = !self.key_phase;
        trace!(phase = self.key_phase, "initiated key update");
        Ok(())
    }

    /// Probe and switch to a different remote address (client side)
    pub fn initiate_migration<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        if !self.state.is_established() || self.side.is_server() {
            return Err(Error::InvalidState);
        }
        self.begin_path_validation(handler, remote, now, true)
    }

    fn begin_path_validation<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        remote: SocketAddr,
        now: Instant,
        keep_fallback: bool,
    ) -> Result<(), Error> {
        let (dcid_sequence, dcid) = match self.rem_cids.peek_next() {
            Some(x) => x,
            None if self.rem_cids.active().is_empty() => (self.rem_cids.active_seq(), self.rem_cids.active()),
            None => return Err(Error::ConnectionIdsExhausted),
        };
        let mut token = [0; 8];
        handler.rand(&mut token);
        let timeout = PathValidator::timeout(self.pto(), self.config.initial_rtt, 0);
        let deadline = now + timeout;
        self.path_validator = Some(PathValidator::new(
            remote,
            dcid,
            dcid_sequence,
            u64::from_be_bytes(token),
            deadline,
        ));
        self.timers.set(Timer::PathValidation, deadline);
        if keep_fallback {
            let new_path = PathData::from_previous(remote, &self.path);
            let old = mem::replace(&mut self.path, new_path);
            self.prev_path = Some(old);
            self.path.reset(now, &self.config);
        }
        trace!(%remote, "starting path validation");
        Ok(())
    }
}

/// Bound on datagrams buffered while waiting for their keys
const MAX_UNDECRYPTABLE: usize = 10;
/// Bound on queued PATH_RESPONSE payloads
const MAX_PATH_RESPONSES: usize = 8;

/// How the AEAD stage disposed of a packet
enum BodyError {
    /// Silently drop the packet; the connection is unaffected
    Discard,
    /// The packet was authenticated and carries a protocol violation
    Violation(TransportError),
    /// An embedder callback failed
    Callback,
}

impl Connection {
    //
    // Ingress
    //

    /// Process one received datagram
    pub fn recv<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        backend: &dyn CryptoBackend,
        remote: SocketAddr,
        data: BytesMut,
        now: Instant,
    ) -> Result<(), Error> {
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        self.reset_idle_timer(now);
        if remote == self.path.remote {
            self.path.total_recvd += data.len() as u64;
        }
        // Replay packets that arrived before their keys
        if !self.undecryptable.is_empty()
            && (self.spaces[SpaceId::Handshake].crypto.is_some()
                || self.spaces[SpaceId::Data].crypto.is_some())
        {
            for (addr, datagram) in mem::take(&mut self.undecryptable) {
                self.handle_datagram(handler, backend, addr, datagram, now)?;
            }
        }
        self.handle_datagram(handler, backend, remote, data, now)
    }

    fn handle_datagram<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        backend: &dyn CryptoBackend,
        remote: SocketAddr,
        data: BytesMut,
        now: Instant,
    ) -> Result<(), Error> {
        let mut remaining = Some(data);
        while let Some(data) = remaining.take() {
            let (partial, rest) = match PartialDecode::new(data, self.local_cid_len) {
                Ok(x) => x,
                Err(PacketDecodeError::UnsupportedVersion { version }) => {
                    debug!(version, "dropping packet with unsupported version");
                    return Ok(());
                }
                Err(PacketDecodeError::InvalidHeader(reason)) => {
                    trace!(reason, "dropping malformed packet");
                    return Ok(());
                }
            };
            remaining = rest;
            self.handle_packet(handler, backend, remote, partial, now)?;
        }
        Ok(())
    }

    fn handle_packet<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        backend: &dyn CryptoBackend,
        remote: SocketAddr,
        partial: PartialDecode,
        now: Instant,
    ) -> Result<(), Error> {
        let dst_cid = partial.dst_cid();
        let packet_len = partial.len() as u64;
        if !partial.is_initial() && !self.local_cids.is_local(&dst_cid) {
            if !partial.has_long_header() && self.is_stateless_reset(partial.data()) {
                debug!("stateless reset detected");
                handler.recv_stateless_reset();
                self.state = State::Draining;
                self.timers.set(Timer::Close, now + 3 * self.pto());
            } else {
                trace!("dropping packet for unknown connection ID");
            }
            return Ok(());
        }

        let Some(space_id) = partial.space() else {
            return self.handle_unprotected(handler, partial);
        };

        let is_0rtt = partial.is_0rtt();
        let keys_installed = if is_0rtt {
            self.zero_rtt_crypto.is_some()
        } else {
            self.spaces[space_id].crypto.is_some()
        };
        if !keys_installed {
            if space_id != SpaceId::Initial
                && partial.has_long_header()
                && self.undecryptable.len() < MAX_UNDECRYPTABLE
            {
                trace!(?space_id, "buffering packet until keys are installed");
                self.undecryptable
                    .push((remote, BytesMut::from(partial.data())));
            } else {
                debug!(?space_id, len = partial.len(), "dropping packet without keys");
            }
            return Ok(());
        }
        let level = if is_0rtt {
            Level::ZeroRtt
        } else {
            Level::from_space(space_id)
        };

        let header_key = if is_0rtt {
            self.zero_rtt_crypto.as_ref().unwrap().header.remote.clone()
        } else {
            self.spaces[space_id]
                .crypto
                .as_ref()
                .unwrap()
                .header
                .remote
                .clone()
        };
        let datagram_is_short = !partial.has_long_header();
        let mut packet = match partial.finish(Some((backend, level, &header_key))) {
            Ok(x) => x,
            Err(e) => {
                // Could still be a stateless reset wearing a garbled header
                trace!(%e, "failed to unprotect header");
                return Ok(());
            }
        };
        let number = packet
            .header
            .number()
            .expect("protected packets carry a number")
            .expand(self.spaces[space_id].rx_packet + 1);

        match self.decrypt_packet_body(handler, backend, &mut packet, space_id, level, number, now)
        {
            Ok(()) => {}
            Err(BodyError::Discard) => {
                // Short-header packets that fail authentication are expected
                // chaff: reordered keys, stateless resets, or spoofing
                if datagram_is_short {
                    trace!(number, "failed to authenticate packet");
                } else {
                    debug!(number, "failed to authenticate packet");
                }
                return Ok(());
            }
            Err(BodyError::Violation(e)) => return Err(self.fail(e, now)),
            Err(BodyError::Callback) => return Err(Error::CallbackFailure),
        }

        if self.spaces[space_id].dedup.insert(number) {
            trace!(number, "dropping duplicate packet");
            return Ok(());
        }

        // The peer's first packet pins down CIDs and advances the handshake
        if !self.initial_received && space_id != SpaceId::Data {
            match (self.side, &packet.header) {
                (Side::Server, Header::Initial { src_cid, .. }) => {
                    self.initial_received = true;
                    handler
                        .recv_client_initial(&dst_cid)
                        .map_err(|_| Error::CallbackFailure)?;
                    self.rem_cids.update_cid(*src_cid);
                    self.state = State::WaitHandshake;
                }
                (Side::Client, Header::Initial { src_cid, .. })
                | (Side::Client, Header::Long { src_cid, .. }) => {
                    self.initial_received = true;
                    self.rem_cids.update_cid(*src_cid);
                    if matches!(self.state, State::Initial) {
                        self.state = State::WaitHandshake;
                    }
                }
                _ => {}
            }
        }
        if self.side.is_server() && space_id == SpaceId::Handshake && !self.path.validated {
            // A Handshake packet proves the client can read our replies
            self.path.validated = true;
        }

        let payload = packet.payload.freeze();
        let (ack_eliciting, non_probing) = self.process_payload(
            handler, remote, space_id, is_0rtt, dst_cid, payload, now,
        )?;

        // Established connections keep a pool of CIDs on offer so the peer
        // can rotate or migrate at will
        if self.state.is_established() {
            self.replenish_local_cids(handler)?;
        }

        let space = &mut self.spaces[space_id];
        space.rx_packet = cmp::max(space.rx_packet, number);
        space.pending_acks.packet_received(number, now, ack_eliciting);
        if let Some(t) = space
            .pending_acks
            .next_ack_time(self.config.max_ack_delay)
        {
            self.timers.set(Timer::AckDelay, t);
        }

        // Server-side migration: a non-probing packet from a new address at
        // the leading edge of the packet number space moves the connection
        if self.side.is_server()
            && space_id == SpaceId::Data
            && self.state.is_established()
            && non_probing
            && remote != self.path.remote
            && number == self.spaces[SpaceId::Data].rx_packet
            && self.path_validator.as_ref().map_or(true, |v| v.remote != remote)
        {
            debug!(%remote, "peer migrated");
            self.begin_path_validation(handler, remote, now, true)?;
            // The packet that revealed the new path counts toward its
            // anti-amplification budget
            self.path.total_recvd += packet_len;
        }
        Ok(())
    }

    fn handle_unprotected<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        partial: PartialDecode,
    ) -> Result<(), Error> {
        let packet = match partial.finish(None) {
            Ok(x) => x,
            Err(_) => return Ok(()),
        };
        let header = packet.header.clone();
        match header {
            Header::VersionNegotiate { .. } => {
                if self.side.is_server() || self.initial_received {
                    return Ok(());
                }
                let mut versions = Vec::new();
                let mut rest = &packet.payload[..];
                while rest.len() >= 4 {
                    versions.push(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]));
                    rest = &rest[4..];
                }
                if versions.contains(&crate::VERSION) {
                    // Spurious; our version is fine
                    return Ok(());
                }
                debug!(?versions, "version negotiation received");
                handler.recv_version_negotiation(&versions);
            }
            Header::Retry { src_cid, .. } => {
                if self.side.is_server() || self.initial_received || !self.initial_token.is_empty()
                {
                    return Ok(());
                }
                // The last 16 bytes are the integrity tag, which only the
                // embedder's crypto can verify
                if packet.payload.len() <= 16 {
                    return Ok(());
                }
                let mut payload = packet.payload.freeze();
                let token = payload.split_to(payload.len() - 16);
                debug!(new_dcid = %src_cid, "retry received");
                self.initial_token = token;
                self.rem_cids.update_cid(src_cid);
                self.retry_rewind();
                handler
                    .recv_retry(&src_cid)
                    .map_err(|_| Error::CallbackFailure)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Put everything the Initial space had in flight back on the send
    /// queue; a Retry means the server threw it away
    fn retry_rewind(&mut self) {
        let space = &mut self.spaces[SpaceId::Initial];
        let mut infos = Vec::new();
        loop {
            let Some(&pn) = space.sent_packets.keys().next() else {
                break;
            };
            infos.push(space.take(pn).unwrap());
        }
        for info in infos {
            for c in info.crypto_frames {
                space.requeue_crypto(c);
            }
        }
        space.crypto_acked = Default::default();
    }

    fn is_stateless_reset(&self, datagram: &[u8]) -> bool {
        if datagram.len() < RESET_TOKEN_SIZE + 5 {
            return false;
        }
        let tail = &datagram[datagram.len() - RESET_TOKEN_SIZE..];
        self.peer_reset_token
            .as_ref()
            .is_some_and(|t| &t[..] == tail)
            || self.rem_cids.reset_tokens().any(|t| &t[..] == tail)
    }

    /// AEAD-open `packet`'s payload in place, handling key updates
    fn decrypt_packet_body<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        backend: &dyn CryptoBackend,
        packet: &mut Packet,
        space_id: SpaceId,
        level: Level,
        number: u64,
        now: Instant,
    ) -> Result<(), BodyError> {
        let is_short = packet.header.is_short();
        let phase = packet.header.key_phase();

        if !is_short || phase == self.key_phase {
            let keys = if level == Level::ZeroRtt {
                self.zero_rtt_crypto.as_ref()
            } else {
                self.spaces[space_id].crypto.as_ref()
            }
            .expect("keys checked before decrypt");
            let key = &keys.packet.remote;
            let nonce = packet_nonce(&key.iv, number);
            backend
                .open(level, key, &nonce, &packet.header_data, &mut packet.payload)
                .map_err(|_| BodyError::Discard)?;
        } else if let Some(prev) = self
            .prev_crypto
            .as_ref()
            .filter(|prev| prev.end_packet.map_or(true, |(pn, _)| number < pn))
        {
            // Packet from before the key update
            let key = &prev.packet.remote;
            let nonce = packet_nonce(&key.iv, number);
            backend
                .open(level, key, &nonce, &packet.header_data, &mut packet.payload)
                .map_err(|_| BodyError::Discard)?;
        } else {
            // Phase mismatch at a fresh packet number: a remotely initiated
            // key update. Trial-decrypt with next-generation keys.
            if number <= self.spaces[space_id].rx_packet {
                return Err(BodyError::Discard);
            }
            let update = handler.update_keys().map_err(|_| BodyError::Callback)?;
            let key = &update.remote;
            let nonce = packet_nonce(&key.iv, number);
            backend
                .open(level, key, &nonce, &packet.header_data, &mut packet.payload)
                .map_err(|_| BodyError::Discard)?;
            trace!(number, "remote key update");
            let keys = self.spaces[space_id]
                .crypto
                .as_mut()
                .expect("keys checked before decrypt");
            let old = mem::replace(
                &mut keys.packet,
                KeyPair {
                    local: update.local,
                    remote: update.remote,
                },
            );
            self.prev_crypto = Some(PrevCrypto {
                packet: old,
                end_packet: Some((number, now)),
            });
            self.key_phase = !self.key_phase;
            self.timers.set(Timer::KeyDiscard, now + 3 * self.pto());
        }

        if !packet.reserved_bits_valid() {
            return Err(BodyError::Violation(TransportError::PROTOCOL_VIOLATION(
                "reserved bits set",
            )));
        }

        // A locally initiated update is confirmed once the peer speaks the
        // new phase at a fresh packet number
        if is_short && phase == self.key_phase && number > self.spaces[space_id].rx_packet {
            if let Some(prev) = self.prev_crypto.as_mut() {
                if prev.end_packet.is_none() {
                    prev.end_packet = Some((number, now));
                    self.timers.set(Timer::KeyDiscard, now + 3 * self.pto());
                }
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: TransportError, now: Instant) -> Error {
        warn!(%error, "connection failed");
        self.error = Some(error.clone());
        self.state = State::Closing {
            reason: Close::from(error.clone()),
        };
        self.close_pending = true;
        self.timers.set(Timer::Close, now + 3 * self.pto());
        Error::Transport(error)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_payload<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        remote: SocketAddr,
        space_id: SpaceId,
        is_0rtt: bool,
        packet_dcid: ConnectionId,
        payload: Bytes,
        now: Instant,
    ) -> Result<(bool, bool), Error> {
        let mut iter = match frame::Iter::new(payload) {
            Ok(x) => x,
            Err(e) => return Err(self.fail(e, now)),
        };
        let mut ack_eliciting = false;
        let mut non_probing = false;
        while let Some(result) = iter.next() {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => return Err(self.fail(e.into(), now)),
            };
            trace!(ty = %frame.ty(), "got frame");
            ack_eliciting |= frame.is_ack_eliciting();
            non_probing |= !matches!(
                frame,
                Frame::Padding
                    | Frame::PathChallenge(_)
                    | Frame::PathResponse(_)
                    | Frame::NewConnectionId(_)
            );
            if let Err(e) = frame_allowed(space_id, is_0rtt, &frame) {
                return Err(self.fail(e, now));
            }

            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ack) => {
                    if let Err(e) = self.on_ack_received(handler, space_id, ack, now) {
                        return Err(self.fail(e, now));
                    }
                }
                Frame::Crypto(c) => {
                    let space = &mut self.spaces[space_id];
                    let end = c.offset + c.data.len() as u64;
                    if end > space.crypto_stream.bytes_read() + MAX_CRYPTO_BUFFER as u64 {
                        return Err(self.fail(
                            TransportError::CRYPTO_BUFFER_EXCEEDED("out-of-order limit"),
                            now,
                        ));
                    }
                    space.crypto_stream.insert(c.offset, c.data);
                    while let Some(chunk) = self.spaces[space_id].crypto_stream.read() {
                        handler
                            .recv_crypto_data(Level::from_space(space_id), chunk.offset, &chunk.bytes)
                            .map_err(|_| Error::CallbackFailure)?;
                    }
                }
                Frame::NewToken(_) => {
                    if self.side.is_server() {
                        return Err(self.fail(
                            TransportError::PROTOCOL_VIOLATION("client sent NEW_TOKEN"),
                            now,
                        ));
                    }
                    // Token storage for future connections is out of scope
                }
                Frame::Stream(s) => {
                    let id = s.id;
                    let credit = self.max_data_local.saturating_sub(self.rx_data);
                    let outcome = match self.streams.recv_stream(s, credit) {
                        Ok(x) => x,
                        Err(e) => return Err(self.fail(e, now)),
                    };
                    self.rx_data += outcome.new_bytes;
                    for opened in &outcome.opened {
                        handler.stream_opened(*opened);
                    }
                    for (offset, data, fin) in &outcome.deliveries {
                        handler
                            .recv_stream_data(id, *fin, *offset, data)
                            .map_err(|_| Error::CallbackFailure)?;
                    }
                    if let Some(closed) = outcome.closed {
                        handler.stream_closed(closed.id, closed.error);
                    }
                }
                Frame::MaxData(x) => {
                    self.max_data_remote = cmp::max(self.max_data_remote, x.into_inner());
                }
                Frame::MaxStreamData { id, offset } => {
                    if let Some(new) = self.streams.recv_max_stream_data(id, offset) {
                        handler.max_stream_data_extended(id, new);
                    }
                }
                Frame::MaxStreams { dir, count } => {
                    if count > 1 << 60 {
                        return Err(self.fail(
                            TransportError::FRAME_ENCODING_ERROR("MAX_STREAMS limit too large"),
                            now,
                        ));
                    }
                    if self.streams.recv_max_streams(dir, count) {
                        handler.max_streams_extended(dir, count);
                    }
                }
                Frame::DataBlocked { offset } => {
                    trace!(offset, "peer claims to be blocked at connection level");
                }
                Frame::StreamDataBlocked { id, offset } => {
                    trace!(%id, offset, "peer claims to be blocked at stream level");
                }
                Frame::StreamsBlocked { dir, limit } => {
                    trace!(%dir, limit, "peer claims to be blocked on stream count");
                }
                Frame::ResetStream(r) => {
                    let credit = self.max_data_local.saturating_sub(self.rx_data);
                    let outcome = match self.streams.recv_reset(r, credit) {
                        Ok(x) => x,
                        Err(e) => return Err(self.fail(e, now)),
                    };
                    self.rx_data += outcome.new_bytes;
                    for opened in &outcome.opened {
                        handler.stream_opened(*opened);
                    }
                    if let Some((id, final_size, code)) = outcome.reset {
                        handler.stream_reset(id, final_size, code);
                    }
                    if let Some(closed) = outcome.closed {
                        handler.stream_closed(closed.id, closed.error);
                    }
                }
                Frame::StopSending(ss) => {
                    let id = match self.streams.recv_stop_sending(ss.id, ss.error_code) {
                        Ok(x) => x,
                        Err(e) => return Err(self.fail(e, now)),
                    };
                    if let Some(id) = id {
                        // Stopping obliges us to reset with the same code
                        let _ = self.streams.reset(
                            id,
                            ss.error_code,
                            &mut self.spaces[SpaceId::Data].pending,
                        );
                    }
                }
                Frame::NewConnectionId(ncid) => {
                    if let Err(e) = self.handle_new_cid(ncid) {
                        return Err(self.fail(e, now));
                    }
                }
                Frame::RetireConnectionId { sequence } => {
                    let grace = cmp::max(self.pto(), 6 * self.config.initial_rtt);
                    if let Err(e) = self.local_cids.retire(sequence, &packet_dcid, now + grace) {
                        return Err(self.fail(e, now));
                    }
                    if let Some(next) = self.local_cids.next_expiry() {
                        self.timers.set(Timer::CidRetirement, next);
                    }
                    self.replenish_local_cids(handler)?;
                }
                Frame::PathChallenge(token) => {
                    if self.path_responses.len() >= MAX_PATH_RESPONSES {
                        self.path_responses.pop_front();
                    }
                    self.path_responses.push_back((token, remote));
                }
                Frame::PathResponse(token) => {
                    self.handle_path_response(handler, token, remote);
                }
                Frame::Close(close) => {
                    trace!("peer closed: {close:?}");
                    self.state = State::Draining;
                    self.timers.set(Timer::Close, now + 3 * self.pto());
                    return Ok((ack_eliciting, non_probing));
                }
                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(self.fail(
                            TransportError::PROTOCOL_VIOLATION("client sent HANDSHAKE_DONE"),
                            now,
                        ));
                    }
                    if !self.handshake_confirmed {
                        self.handshake_confirmed = true;
                        self.discard_space(SpaceId::Handshake);
                        handler.handshake_completed();
                        self.maybe_use_preferred_address(handler, now)?;
                    }
                }
            }
        }

        // The peer has started using a CID we issued; keep the pool full
        if self.local_cids.on_used(&packet_dcid) {
            self.replenish_local_cids(handler)?;
        }

        Ok((ack_eliciting, non_probing))
    }

    fn maybe_use_preferred_address<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        now: Instant,
    ) -> Result<(), Error> {
        let Some(preferred) = self.peer_params.preferred_address else {
            return Ok(());
        };
        let Some(remote) = handler.select_preferred_address(&preferred) else {
            return Ok(());
        };
        // The preferred-address CID implicitly has sequence number 1
        let _ = self.rem_cids.insert(IssuedCid {
            sequence: 1,
            id: preferred.connection_id,
            reset_token: preferred.stateless_reset_token,
        });
        self.begin_path_validation(handler, remote, now, true)
    }

    fn handle_path_response<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        token: u64,
        remote: SocketAddr,
    ) {
        let matches = self
            .path_validator
            .as_ref()
            .is_some_and(|v| v.token == token && v.remote == remote);
        if !matches {
            trace!("ignoring stray PATH_RESPONSE");
            return;
        }
        let validator = self.path_validator.take().unwrap();
        self.timers.stop(Timer::PathValidation);
        self.path.validated = true;
        self.prev_path = None;
        let pending = &mut self.spaces[SpaceId::Data].pending;
        if validator.retire_on_finish {
            pending.retire_cids.push(validator.dcid_sequence);
        } else {
            // Adopt the reserved CID, retiring everything before it
            while self.rem_cids.active_seq() < validator.dcid_sequence {
                match self.rem_cids.next() {
                    Some((_, retired)) => {
                        self.spaces[SpaceId::Data].pending.retire_cids.extend(retired);
                    }
                    None => break,
                }
            }
        }
        debug!(%remote, "path validated");
        handler.path_validated(remote, PathOutcome::Success);
    }

    fn handle_new_cid(&mut self, ncid: frame::NewConnectionId) -> Result<(), TransportError> {
        if self.rem_cids.active().is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "NEW_CONNECTION_ID for a peer using zero-length CIDs",
            ));
        }
        match self.rem_cids.insert(IssuedCid {
            sequence: ncid.sequence,
            id: ncid.id,
            reset_token: ncid.reset_token,
        }) {
            Ok(()) => {}
            Err(InsertError::Conflict) => {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "NEW_CONNECTION_ID reuses a sequence number",
                ));
            }
            Err(InsertError::ExceedsLimit) => {
                return Err(TransportError::from(
                    TransportErrorCode::CONNECTION_ID_LIMIT_ERROR,
                ));
            }
            Err(InsertError::Retired) => {
                // Already retired; tell the peer so it can forget it
                self.spaces[SpaceId::Data]
                    .pending
                    .retire_cids
                    .push(ncid.sequence);
                return Ok(());
            }
        }
        if ncid.retire_prior_to > 0 {
            let retired = self.rem_cids.retire_prior_to(ncid.retire_prior_to);
            self.spaces[SpaceId::Data]
                .pending
                .retire_cids
                .extend(retired);
            if !self.rem_cids.active_available() {
                if let Some((_, retired)) = self.rem_cids.next() {
                    self.spaces[SpaceId::Data]
                        .pending
                        .retire_cids
                        .extend(retired);
                }
            }
        }
        Ok(())
    }

    fn replenish_local_cids<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), Error> {
        if self.local_cid_len == 0 {
            return Ok(());
        }
        // The peer's active_connection_id_limit caps how many it will store
        let target = cmp::min(
            LOCAL_CID_COUNT as u64,
            self.peer_params.active_connection_id_limit.into_inner(),
        ) as usize;
        while self.local_cids.active_count() < target {
            let (cid, reset_token) = handler
                .new_connection_id()
                .map_err(|_| Error::CallbackFailure)?;
            // Verify what the callback actually produced, not our inputs
            if cid.len() != self.local_cid_len {
                return Err(Error::CallbackFailure);
            }
            let sequence = self.local_cids.issue(cid);
            self.spaces[SpaceId::Data]
                .pending
                .new_cids
                .push(frame::NewConnectionId {
                    sequence,
                    retire_prior_to: 0,
                    id: cid,
                    reset_token,
                });
            trace!(sequence, %cid, "issued new connection ID");
        }
        Ok(())
    }

    fn on_ack_received<H: ConnectionHandler>(
        &mut self,
        handler: &mut H,
        space_id: SpaceId,
        ack: frame::Ack,
        now: Instant,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space_id].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "acknowledgement of an unsent packet",
            ));
        }
        let space = &mut self.spaces[space_id];
        let new_largest = space.largest_acked_packet.map_or(true, |x| ack.largest > x);
        if new_largest {
            space.largest_acked_packet = Some(ack.largest);
        }

        let mut newly_acked = Vec::new();
        for range in ack.iter() {
            let in_range: Vec<u64> = self.spaces[space_id]
                .sent_packets
                .range(range)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in in_range {
                let info = self.spaces[space_id].take(pn).unwrap();
                newly_acked.push((pn, info));
            }
        }
        if newly_acked.is_empty() {
            return Ok(());
        }

        // The newest acked packet provides an RTT sample
        if let Some((_, info)) = newly_acked
            .iter()
            .find(|(pn, info)| *pn == ack.largest && info.ack_eliciting)
        {
            let exponent = self.peer_params.ack_delay_exponent.into_inner() as u32;
            let mut ack_delay =
                Duration::from_micros(ack.delay.saturating_mul(1u64 << exponent.min(20)));
            if space_id != SpaceId::Data {
                ack_delay = Duration::ZERO;
            } else {
                ack_delay = cmp::min(ack_delay, self.peer_max_ack_delay());
            }
            let rtt = now.saturating_duration_since(info.time_sent);
            self.path.rtt.update(ack_delay, rtt);
        }

        for (_, info) in newly_acked {
            self.spaces[space_id].pending_acks.subtract(&info.acks);
            for meta in info.stream_frames {
                if let Some(closed) = self.streams.ack_stream_frame(&meta) {
                    handler.stream_closed(closed.id, closed.error);
                }
            }
            for c in info.crypto_frames {
                self.spaces[space_id]
                    .crypto_acked
                    .insert(c.offset..c.offset + c.data.len() as u64);
            }
            if let Some(r) = info.retransmits.get() {
                for (id, _) in &r.reset_stream {
                    if let Some(closed) = self.streams.ack_reset(*id) {
                        handler.stream_closed(closed.id, closed.error);
                    }
                }
            }
            self.path
                .congestion
                .on_ack(now, info.time_sent, u64::from(info.size), false);
        }
        self.pto_count = 0;
        self.crypto_count = 0;

        self.detect_lost(space_id, now);
        self.set_loss_detection_timer();
        Ok(())
    }
}

/// Which frames may appear at which encryption level
fn frame_allowed(space_id: SpaceId, is_0rtt: bool, frame: &Frame) -> Result<(), TransportError> {
    let ok = match space_id {
        SpaceId::Initial | SpaceId::Handshake => matches!(
            frame,
            Frame::Padding
                | Frame::Ping
                | Frame::Ack(_)
                | Frame::Crypto(_)
                | Frame::Close(Close::Connection(_))
        ),
        SpaceId::Data if is_0rtt => !matches!(
            frame,
            Frame::Ack(_)
                | Frame::Crypto(_)
                | Frame::NewToken(_)
                | Frame::PathResponse(_)
                | Frame::HandshakeDone
        ),
        SpaceId::Data => true,
    };
    if ok {
        Ok(())
    } else {
        let mut err = TransportError::PROTOCOL_VIOLATION("illegal frame type for encryption level");
        err.frame = Some(frame.ty());
        Err(err)
    }
}

/// Frames accumulated into a packet under construction
#[derive(Default)]
struct SentFrames {
    ack_eliciting: bool,
    is_crypto: bool,
    acks: ArrayRangeSet,
    retransmits: ThinRetransmits,
    stream_frames: frame::StreamMetaVec,
    crypto_frames: frame::CryptoVec,
}

impl Connection {
    //
    // Egress
    //

    /// Fill `buf` with at most one datagram to send
    ///
    /// `Ok(None)` means there is nothing to send right now; the embedder
    /// waits for [`Connection::next_expiry`] or further received packets.
    pub fn poll_transmit(
        &mut self,
        backend: &dyn CryptoBackend,
        buf: &mut Vec<u8>,
        now: Instant,
    ) -> Result<Option<Transmit>, Error> {
        match self.state {
            State::Closing { .. } if self.close_pending => {
                buf.clear();
                let size = self.write_close_packet(backend, buf)?;
                return Ok(Some(Transmit {
                    destination: self.path.remote,
                    size,
                }));
            }
            State::Closing { .. } => return Err(Error::Closing),
            State::Draining => return Err(Error::Draining),
            State::Drained => return Err(Error::InvalidState),
            _ => {}
        }
        buf.clear();

        // Path probes go out on their own datagrams, to their own address
        if let Some(transmit) = self.poll_path_probe(backend, buf)? {
            return Ok(Some(transmit));
        }

        let credit = self.path.anti_amplification_credit();
        if credit == 0 {
            trace!("blocked by anti-amplification");
            return Ok(None);
        }
        let datagram_budget =
            cmp::min(self.config.max_udp_payload_size as u64, credit) as usize;

        let cwnd_left = self
            .path
            .congestion
            .window()
            .saturating_sub(self.bytes_in_flight());

        let mut pad_datagram = false;
        for space_id in SpaceId::iter() {
            if self.spaces[space_id].crypto.is_none() {
                continue;
            }
            let probe = self.spaces[space_id].loss_probes > 0;
            let (want_acks, want_other) = self.space_can_send(space_id, now);
            if !probe && !want_acks && !want_other {
                continue;
            }
            // Congestion control gates everything but ACKs and probes
            let congestion_blocked = !probe && (cwnd_left as usize) < datagram_budget;
            if congestion_blocked && !want_acks {
                continue;
            }
            // Leave room for another packet's worth of header and sample
            if datagram_budget.saturating_sub(buf.len()) < 64 {
                break;
            }

            if self.spaces[space_id].next_packet_number >= (1 << 62) - 1 {
                return Err(Error::PacketNumberExhausted);
            }
            let space = &mut self.spaces[space_id];
            let number = space.get_tx_number();
            let pn = PacketNumber::new(number, space.largest_acked_packet);
            let header = self.header_for(space_id, pn);
            let level = Level::from_space(space_id);
            let tag_len = backend.tag_len(level);
            let mut builder =
                PacketBuilder::new(buf, &header, number, tag_len, 0, datagram_budget);

            let mut sent = SentFrames::default();
            self.populate_packet(
                space_id,
                &builder,
                buf,
                &mut sent,
                congestion_blocked,
                probe,
                now,
            );

            if builder.is_empty(buf) {
                // Nothing to say after all; roll the packet back
                buf.truncate(builder.partial_encode.start());
                self.spaces[space_id].next_packet_number -= 1;
                continue;
            }

            // Datagrams with a client Initial, or any ack-eliciting server
            // Initial, are padded to defeat amplification attacks
            if space_id == SpaceId::Initial && (self.side.is_client() || sent.ack_eliciting) {
                pad_datagram = true;
            }
            if pad_datagram && !self.coalesce_more(space_id, now) {
                builder.pad_to(MIN_INITIAL_SIZE);
            }

            let keys = self.spaces[space_id].crypto.clone().unwrap();
            let size = builder
                .finish(buf, backend, level, &keys)
                .map_err(|_| Error::CallbackFailure)?;
            trace!(?space_id, number, size, "sent packet");

            if sent.ack_eliciting {
                let space = &mut self.spaces[space_id];
                space.sent(
                    number,
                    SentPacket {
                        time_sent: now,
                        size: size as u16,
                        ack_eliciting: true,
                        is_crypto: sent.is_crypto,
                        is_probe: probe,
                        acks: sent.acks,
                        retransmits: sent.retransmits,
                        stream_frames: sent.stream_frames,
                        crypto_frames: sent.crypto_frames,
                    },
                );
                space.time_of_last_ack_eliciting_packet = Some(now);
                if probe {
                    space.loss_probes -= 1;
                }
                self.path.congestion.on_sent(now, size as u64);
            }
        }

        if buf.is_empty() {
            return Ok(None);
        }
        self.path.total_sent += buf.len() as u64;
        self.set_loss_detection_timer();
        self.reset_idle_timer(now);
        Ok(Some(Transmit {
            destination: self.path.remote,
            size: buf.len(),
        }))
    }

    /// Produce a datagram serving path validation, if one is owed
    ///
    /// Challenges go to the address under validation with its reserved
    /// CID; responses go back where the challenge came from.
    fn poll_path_probe(
        &mut self,
        backend: &dyn CryptoBackend,
        buf: &mut Vec<u8>,
    ) -> Result<Option<Transmit>, Error> {
        if self.spaces[SpaceId::Data].crypto.is_none() {
            return Ok(None);
        }

        let challenge = self
            .path_validator
            .as_mut()
            .filter(|v| v.challenge_pending)
            .map(|v| {
                v.challenge_pending = false;
                (v.token, v.remote, v.dcid)
            });
        let (frame_ty, token, destination, dcid) = match challenge {
            Some((token, remote, dcid)) => (FrameType::PATH_CHALLENGE, token, remote, dcid),
            None => {
                let Some(pos) = self
                    .path_responses
                    .iter()
                    .position(|&(_, addr)| addr != self.path.remote)
                else {
                    return Ok(None);
                };
                let (token, remote) = self.path_responses.remove(pos).unwrap();
                (FrameType::PATH_RESPONSE, token, remote, self.rem_cids.active())
            }
        };

        let space = &mut self.spaces[SpaceId::Data];
        if space.next_packet_number >= (1 << 62) - 1 {
            return Err(Error::PacketNumberExhausted);
        }
        let number = space.get_tx_number();
        let pn = PacketNumber::new(number, space.largest_acked_packet);
        let header = Header::Short {
            spin: false,
            key_phase: self.key_phase,
            dst_cid: dcid,
            number: pn,
        };
        let tag_len = backend.tag_len(Level::OneRtt);
        let mut builder = PacketBuilder::new(
            buf,
            &header,
            number,
            tag_len,
            0,
            self.config.max_udp_payload_size as usize,
        );
        buf.write(frame_ty);
        buf.write(token);
        // Probing packets are padded so the path is validated for full-size
        // datagrams
        builder.pad_to(MIN_INITIAL_SIZE);
        let keys = self.spaces[SpaceId::Data].crypto.clone().unwrap();
        let size = builder
            .finish(buf, backend, Level::OneRtt, &keys)
            .map_err(|_| Error::CallbackFailure)?;
        trace!(%destination, "sent path probe");
        Ok(Some(Transmit { destination, size }))
    }

    /// Whether anything is waiting that a packet in `space_id` could carry
    fn space_can_send(&self, space_id: SpaceId, now: Instant) -> (bool, bool) {
        let space = &self.spaces[space_id];
        let acks = space.pending_acks.can_send()
            && space.pending_acks.ack_due(now, self.config.max_ack_delay);
        let mut other = space.has_pending_crypto();
        if space_id == SpaceId::Data {
            other |= !space.pending.is_empty();
            other |= self.state.is_established() && self.streams.can_send();
            other |= self
                .path_responses
                .iter()
                .any(|&(_, addr)| addr == self.path.remote);
        }
        (acks, other)
    }

    /// Whether a later space will add a packet to this datagram
    fn coalesce_more(&self, after: SpaceId, now: Instant) -> bool {
        SpaceId::iter()
            .filter(|&s| s > after)
            .any(|s| {
                self.spaces[s].crypto.is_some() && {
                    let (acks, other) = self.space_can_send(s, now);
                    acks || other || self.spaces[s].loss_probes > 0
                }
            })
    }

    fn header_for(&self, space_id: SpaceId, number: PacketNumber) -> Header {
        let dst_cid = self.rem_cids.active();
        match space_id {
            SpaceId::Initial => Header::Initial {
                dst_cid,
                src_cid: self.local_cids.initial_cid(),
                token: self.initial_token.clone(),
                number,
            },
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                dst_cid,
                src_cid: self.local_cids.initial_cid(),
                number,
            },
            SpaceId::Data => Header::Short {
                spin: false,
                key_phase: self.key_phase,
                dst_cid,
                number,
            },
        }
    }

    /// Write frames for one packet, in priority order
    #[allow(clippy::too_many_arguments)]
    fn populate_packet(
        &mut self,
        space_id: SpaceId,
        builder: &PacketBuilder,
        buf: &mut Vec<u8>,
        sent: &mut SentFrames,
        congestion_blocked: bool,
        probe: bool,
        now: Instant,
    ) {
        // PATH_RESPONSE has the highest priority and is not congestion
        // controlled
        if space_id == SpaceId::Data {
            while builder.left(buf) >= 9 {
                let Some(pos) = self
                    .path_responses
                    .iter()
                    .position(|&(_, addr)| addr == self.path.remote)
                else {
                    break;
                };
                let (token, _) = self.path_responses.remove(pos).unwrap();
                trace!("PATH_RESPONSE {token:08x}");
                buf.write(FrameType::PATH_RESPONSE);
                buf.write(token);
                sent.ack_eliciting = true;
            }
        }

        // ACK
        let space = &mut self.spaces[space_id];
        if space.pending_acks.can_send() {
            let delay_micros = space.pending_acks.delay(now).as_micros() as u64;
            let delay = delay_micros >> self.config.ack_delay_exponent;
            let mut tmp = Vec::new();
            frame::Ack::encode(delay, space.pending_acks.ranges(), None, &mut tmp);
            if tmp.len() <= builder.left(buf) {
                trace!("ACK");
                buf.extend_from_slice(&tmp);
                sent.acks = space.pending_acks.ranges().clone();
                space.pending_acks.acks_sent();
            }
        }

        if congestion_blocked {
            return;
        }

        // Control frames
        if space_id == SpaceId::Data {
            self.populate_control(builder, buf, sent);
        }

        // CRYPTO
        while builder.left(buf) > frame::Crypto::SIZE_BOUND {
            let max_chunk = builder.left(buf) - frame::Crypto::SIZE_BOUND;
            let Some(chunk) = self.spaces[space_id].next_crypto_chunk(max_chunk) else {
                break;
            };
            trace!(offset = chunk.offset, len = chunk.data.len(), "CRYPTO");
            chunk.encode(buf);
            sent.ack_eliciting = true;
            sent.is_crypto = true;
            sent.crypto_frames.push(chunk);
        }

        // STREAM
        if space_id == SpaceId::Data && self.state.is_established() {
            let metas = self
                .streams
                .write_stream_frames(buf, builder.frame_space_limit());
            if !metas.is_empty() {
                sent.ack_eliciting = true;
                sent.stream_frames = metas;
            }
        }

        // A probe with nothing else to carry asks for an ACK the simple way
        if probe && !sent.ack_eliciting && builder.left(buf) >= 1 {
            trace!("PING");
            buf.write(FrameType::PING);
            sent.ack_eliciting = true;
        }
    }

    fn populate_control(&mut self, builder: &PacketBuilder, buf: &mut Vec<u8>, sent: &mut SentFrames) {
        // HANDSHAKE_DONE
        if self.spaces[SpaceId::Data].pending.handshake_done && builder.left(buf) >= 1 {
            trace!("HANDSHAKE_DONE");
            buf.write(FrameType::HANDSHAKE_DONE);
            self.spaces[SpaceId::Data].pending.handshake_done = false;
            sent.retransmits.get_or_create().handshake_done = true;
            sent.ack_eliciting = true;
        }

        // MAX_DATA
        if self.spaces[SpaceId::Data].pending.max_data && builder.left(buf) >= 9 {
            self.spaces[SpaceId::Data].pending.max_data = false;
            self.max_data_local = self.unsent_max_data;
            trace!(max = self.max_data_local, "MAX_DATA");
            buf.write(FrameType::MAX_DATA);
            buf.write_var(self.max_data_local);
            sent.retransmits.get_or_create().max_data = true;
            sent.ack_eliciting = true;
        }

        // MAX_STREAM_DATA
        while builder.left(buf) >= 17 {
            let Some(&id) = self.spaces[SpaceId::Data]
                .pending
                .max_stream_data
                .iter()
                .next()
            else {
                break;
            };
            self.spaces[SpaceId::Data].pending.max_stream_data.remove(&id);
            let Some(rx) = self
                .streams
                .streams
                .get_mut(&id)
                .and_then(|s| s.recv.as_mut())
            else {
                continue;
            };
            if rx.reset_received || rx.stopped.is_some() {
                continue;
            }
            rx.max_data = rx.unsent_max_data;
            trace!(stream = %id, max = rx.max_data, "MAX_STREAM_DATA");
            buf.write(FrameType::MAX_STREAM_DATA);
            buf.write(id);
            buf.write_var(rx.max_data);
            sent.retransmits.get_or_create().max_stream_data.insert(id);
            sent.ack_eliciting = true;
        }

        // MAX_STREAMS
        for dir in Dir::iter() {
            if builder.left(buf) < 9 {
                break;
            }
            let pending_flag = match dir {
                Dir::Bi => &mut self.spaces[SpaceId::Data].pending.max_stream_id_bidi,
                Dir::Uni => &mut self.spaces[SpaceId::Data].pending.max_stream_id_uni,
            };
            let rescheduled = mem::take(pending_flag);
            let announced = self.streams.take_max_streams_update(dir);
            if !rescheduled && announced.is_none() {
                continue;
            }
            let count = self.streams.max_remote[dir as usize];
            trace!(%dir, count, "MAX_STREAMS");
            buf.write(match dir {
                Dir::Bi => FrameType::MAX_STREAMS_BIDI,
                Dir::Uni => FrameType::MAX_STREAMS_UNI,
            });
            buf.write_var(count);
            let retransmits = sent.retransmits.get_or_create();
            match dir {
                Dir::Bi => retransmits.max_stream_id_bidi = true,
                Dir::Uni => retransmits.max_stream_id_uni = true,
            }
            sent.ack_eliciting = true;
        }

        // RESET_STREAM
        while builder.left(buf) >= frame::ResetStream::SIZE_BOUND {
            let Some((id, error_code)) = self.spaces[SpaceId::Data].pending.reset_stream.pop()
            else {
                break;
            };
            let Some((_, final_offset)) = self.streams.reset_final_size(id) else {
                continue;
            };
            trace!(stream = %id, "RESET_STREAM");
            frame::ResetStream {
                id,
                error_code,
                final_offset: VarInt::from_u64(final_offset).expect("final size fits varint"),
            }
            .encode(buf);
            sent.retransmits
                .get_or_create()
                .reset_stream
                .push((id, error_code));
            sent.ack_eliciting = true;
        }

        // STOP_SENDING
        while builder.left(buf) >= frame::StopSending::SIZE_BOUND {
            let Some(frame) = self.spaces[SpaceId::Data].pending.stop_sending.pop() else {
                break;
            };
            if !self.streams.streams.contains_key(&frame.id) {
                continue;
            }
            trace!(stream = %frame.id, "STOP_SENDING");
            frame.encode(buf);
            sent.retransmits.get_or_create().stop_sending.push(frame);
            sent.ack_eliciting = true;
        }

        // NEW_CONNECTION_ID
        while builder.left(buf) >= frame::NewConnectionId::SIZE_BOUND {
            let Some(ncid) = self.spaces[SpaceId::Data].pending.new_cids.pop() else {
                break;
            };
            trace!(sequence = ncid.sequence, "NEW_CONNECTION_ID");
            ncid.encode(buf);
            sent.retransmits.get_or_create().new_cids.push(ncid);
            sent.ack_eliciting = true;
        }

        // RETIRE_CONNECTION_ID
        while builder.left(buf) >= 9 {
            let Some(sequence) = self.spaces[SpaceId::Data].pending.retire_cids.pop() else {
                break;
            };
            trace!(sequence, "RETIRE_CONNECTION_ID");
            buf.write(FrameType::RETIRE_CONNECTION_ID);
            buf.write_var(sequence);
            sent.retransmits.get_or_create().retire_cids.push(sequence);
            sent.ack_eliciting = true;
        }

        // Blocked hints are best-effort and never rescheduled
        if self.spaces[SpaceId::Data].pending.data_blocked && builder.left(buf) >= 9 {
            self.spaces[SpaceId::Data].pending.data_blocked = false;
            trace!("DATA_BLOCKED");
            buf.write(FrameType::DATA_BLOCKED);
            buf.write_var(self.max_data_remote);
            sent.ack_eliciting = true;
        }
        while builder.left(buf) >= 17 {
            let Some((id, limit)) = self.spaces[SpaceId::Data]
                .pending
                .stream_data_blocked
                .pop()
            else {
                break;
            };
            trace!(stream = %id, "STREAM_DATA_BLOCKED");
            buf.write(FrameType::STREAM_DATA_BLOCKED);
            buf.write(id);
            buf.write_var(limit);
            sent.ack_eliciting = true;
        }
        for dir in Dir::iter() {
            if builder.left(buf) < 9 {
                break;
            }
            let Some(limit) = self.spaces[SpaceId::Data].pending.streams_blocked[dir as usize].take()
            else {
                continue;
            };
            trace!(%dir, limit, "STREAMS_BLOCKED");
            buf.write(match dir {
                Dir::Bi => FrameType::STREAMS_BLOCKED_BIDI,
                Dir::Uni => FrameType::STREAMS_BLOCKED_UNI,
            });
            buf.write_var(limit);
            sent.ack_eliciting = true;
        }
    }

    //
    // Loss detection
    //

    fn detect_lost(&mut self, space_id: SpaceId, now: Instant) {
        let Some(largest_acked) = self.spaces[space_id].largest_acked_packet else {
            return;
        };
        let rtt = cmp::max(self.path.rtt.get(), self.path.rtt.latest());
        let loss_delay = cmp::max(rtt + rtt / 8, TIMER_GRANULARITY);

        let mut lost = Vec::new();
        let mut loss_time = None;
        for (&pn, info) in self.spaces[space_id].sent_packets.range(..largest_acked) {
            if largest_acked - pn >= REORDER_THRESHOLD || info.time_sent + loss_delay <= now {
                lost.push(pn);
            } else {
                let when = info.time_sent + loss_delay;
                loss_time = Some(loss_time.map_or(when, |t: Instant| cmp::min(t, when)));
            }
        }
        self.spaces[space_id].loss_time = loss_time;
        if lost.is_empty() {
            return;
        }
        debug!(count = lost.len(), ?space_id, "packets lost");
        // Lost probes don't signal congestion; they were sent to provoke
        // exactly this kind of discovery
        let mut newest_sent: Option<Instant> = None;
        for pn in lost {
            let info = self.spaces[space_id].take(pn).unwrap();
            if !info.is_probe {
                newest_sent =
                    Some(newest_sent.map_or(info.time_sent, |t| cmp::max(t, info.time_sent)));
            }
            self.resched_frames(space_id, info);
        }
        if let Some(newest_sent) = newest_sent {
            self.path
                .congestion
                .on_congestion_event(now, newest_sent, false);
        }
    }

    /// Reattach a lost packet's frames to their current owners
    fn resched_frames(&mut self, space_id: SpaceId, info: SentPacket) {
        for meta in info.stream_frames {
            self.streams.retransmit(meta);
        }
        for c in info.crypto_frames {
            self.spaces[space_id].requeue_crypto(c);
        }
        self.spaces[space_id].pending |= info.retransmits;
        // ACK, PATH_CHALLENGE, PATH_RESPONSE, and PADDING are never
        // retransmitted
    }

    fn set_loss_detection_timer(&mut self) {
        // A pending time-threshold loss wins
        if let Some(time) = SpaceId::iter()
            .filter_map(|s| self.spaces[s].loss_time)
            .min()
        {
            self.timers.set(Timer::LossDetection, time);
            return;
        }

        // Handshake data in flight is retransmitted on its own clock
        let crypto_spaces = [SpaceId::Initial, SpaceId::Handshake];
        if crypto_spaces.iter().any(|&s| self.spaces[s].crypto_in_flight()) {
            let last = crypto_spaces
                .iter()
                .filter_map(|&s| self.spaces[s].time_of_last_ack_eliciting_packet)
                .max()
                .expect("crypto in flight implies a send time");
            let timeout = 2 * cmp::max(self.path.rtt.get(), self.config.initial_rtt)
                * 2u32.saturating_pow(self.crypto_count);
            self.timers.set(Timer::LossDetection, last + timeout);
            return;
        }

        // Otherwise the probe timeout drives retransmission
        if self.spaces.iter().any(|s| s.in_flight > 0) {
            let last = SpaceId::iter()
                .filter_map(|s| self.spaces[s].time_of_last_ack_eliciting_packet)
                .max()
                .expect("in-flight data implies a send time");
            let timeout = self.pto() * 2u32.saturating_pow(self.pto_count);
            self.timers.set(Timer::LossDetection, last + timeout);
        } else {
            self.timers.stop(Timer::LossDetection);
        }
    }

    fn on_loss_detection_timeout(&mut self, now: Instant) {
        // Threshold-based loss first
        if let Some(space_id) = SpaceId::iter()
            .filter(|&s| self.spaces[s].loss_time.is_some_and(|t| t <= now))
            .min_by_key(|&s| self.spaces[s].loss_time)
        {
            self.detect_lost(space_id, now);
            self.set_loss_detection_timer();
            return;
        }

        let crypto_spaces = [SpaceId::Initial, SpaceId::Handshake];
        if crypto_spaces.iter().any(|&s| self.spaces[s].crypto_in_flight()) {
            // Retransmit all handshake data rather than waiting for acks
            debug!("handshake retransmission timeout");
            for &space_id in &crypto_spaces {
                let crypto_packets: Vec<u64> = self.spaces[space_id]
                    .sent_packets
                    .iter()
                    .filter(|(_, info)| info.is_crypto)
                    .map(|(&pn, _)| pn)
                    .collect();
                for pn in crypto_packets {
                    let info = self.spaces[space_id].take(pn).unwrap();
                    self.resched_frames(space_id, info);
                }
            }
            self.crypto_count += 1;
            self.set_loss_detection_timer();
            return;
        }

        // Probe timeout: solicit an ACK with up to two probe packets
        debug!(count = self.pto_count, "probe timeout");
        let space_id = self.highest_space;
        self.spaces[space_id].loss_probes = 2;
        self.pto_count += 1;
        self.set_loss_detection_timer();
    }
}

/// Number of in-order packets that must be acknowledged past a packet
/// before it is declared lost
const REORDER_THRESHOLD: u64 = 3;
