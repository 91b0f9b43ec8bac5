use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::info_span;

use crate::cid::{ConnectionId, ResetToken};
use crate::crypto::{
    CryptoBackend, CryptoError, DirectionalKeys, HeaderKey, Level, PacketKey,
};
use crate::handler::{CallbackError, ConnectionHandler, KeyUpdate, PathOutcome};
use crate::{Connection, Side, StreamId, TransportConfig, VarInt};

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trace".into()),
        )
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .finish();
    tracing::subscriber::set_default(sub)
}

/// Tag length of the [`NullCrypto`] pseudo-AEAD
const TAG_LEN: usize = 16;

/// Deterministic stand-in for the embedder's real cryptography
///
/// The payload is carried in the clear; the tag binds key and nonce so key
/// or phase mismatches fail authentication the way a real AEAD would, and
/// the header mask is derived from key and sample so protection is
/// removable only with the right key.
pub(super) struct NullCrypto;

impl NullCrypto {
    fn tag(key: &PacketKey, nonce: &[u8]) -> [u8; TAG_LEN] {
        let mut tag = [0; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = key.key[i % key.key.len()] ^ nonce[i % nonce.len()] ^ 0x5a;
        }
        tag
    }
}

impl CryptoBackend for NullCrypto {
    fn seal(
        &self,
        _level: Level,
        key: &PacketKey,
        nonce: &[u8],
        packet: &mut [u8],
        _header_len: usize,
    ) -> Result<(), CryptoError> {
        let tag = Self::tag(key, nonce);
        let tag_start = packet.len() - TAG_LEN;
        packet[tag_start..].copy_from_slice(&tag);
        Ok(())
    }

    fn open(
        &self,
        _level: Level,
        key: &PacketKey,
        nonce: &[u8],
        _header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError> {
        if payload.len() < TAG_LEN {
            return Err(CryptoError);
        }
        let tag_start = payload.len() - TAG_LEN;
        if payload[tag_start..] != Self::tag(key, nonce) {
            return Err(CryptoError);
        }
        payload.truncate(tag_start);
        Ok(())
    }

    fn header_mask(&self, _level: Level, key: &HeaderKey, sample: &[u8]) -> [u8; 5] {
        let mut mask = [0; 5];
        for (i, byte) in mask.iter_mut().enumerate() {
            *byte = key[i % key.len()] ^ sample[i % sample.len()];
        }
        mask
    }

    fn tag_len(&self, _level: Level) -> usize {
        TAG_LEN
    }
}

fn keys(tag: u8) -> DirectionalKeys {
    DirectionalKeys {
        header: HeaderKey::new(vec![tag.wrapping_mul(7) ^ 0x33; 16]),
        packet: PacketKey {
            key: vec![tag; 16],
            iv: vec![tag ^ 0xff; 12],
        },
    }
}

/// Key-schedule tags agreed between both test endpoints
const INITIAL_CLIENT: u8 = 0x01;
const INITIAL_SERVER: u8 = 0x02;
const HANDSHAKE_CLIENT: u8 = 0x11;
const HANDSHAKE_SERVER: u8 = 0x12;
const ONE_RTT_CLIENT: u8 = 0x21;
const ONE_RTT_SERVER: u8 = 0x22;

pub(super) fn initial_keys(side: Side) -> (DirectionalKeys, DirectionalKeys) {
    match side {
        Side::Client => (keys(INITIAL_CLIENT), keys(INITIAL_SERVER)),
        Side::Server => (keys(INITIAL_SERVER), keys(INITIAL_CLIENT)),
    }
}

pub(super) fn handshake_keys(side: Side) -> (DirectionalKeys, DirectionalKeys) {
    match side {
        Side::Client => (keys(HANDSHAKE_CLIENT), keys(HANDSHAKE_SERVER)),
        Side::Server => (keys(HANDSHAKE_SERVER), keys(HANDSHAKE_CLIENT)),
    }
}

pub(super) fn one_rtt_keys(side: Side) -> (DirectionalKeys, DirectionalKeys) {
    match side {
        Side::Client => (keys(ONE_RTT_CLIENT), keys(ONE_RTT_SERVER)),
        Side::Server => (keys(ONE_RTT_SERVER), keys(ONE_RTT_CLIENT)),
    }
}

fn update_keys_for(side: Side, generation: u32) -> KeyUpdate {
    let client = keys(0x40u8.wrapping_add(generation as u8 * 2));
    let server = keys(0x41u8.wrapping_add(generation as u8 * 2));
    match side {
        Side::Client => KeyUpdate {
            local: client.packet,
            remote: server.packet,
        },
        Side::Server => KeyUpdate {
            local: server.packet,
            remote: client.packet,
        },
    }
}

/// Scripted embedder: records every callback and answers services
/// deterministically
pub(super) struct TestHandler {
    side: Side,
    rng: StdRng,
    next_cid: u8,
    pub(super) key_generation: u32,
    pub(super) crypto_data: Vec<(Level, u64, Bytes)>,
    pub(super) stream_data: HashMap<StreamId, Vec<u8>>,
    pub(super) stream_fins: Vec<StreamId>,
    pub(super) opened_streams: Vec<StreamId>,
    pub(super) closed_streams: Vec<(StreamId, Option<VarInt>)>,
    pub(super) resets: Vec<(StreamId, u64, VarInt)>,
    pub(super) handshake_complete: bool,
    pub(super) client_initial_dcid: Option<ConnectionId>,
    pub(super) path_events: Vec<(SocketAddr, PathOutcome)>,
    pub(super) retired_cids: Vec<ConnectionId>,
    pub(super) issued_cids: Vec<(ConnectionId, ResetToken)>,
    pub(super) stateless_reset_seen: bool,
}

impl TestHandler {
    pub(super) fn new(side: Side) -> Self {
        Self {
            side,
            rng: StdRng::seed_from_u64(match side {
                Side::Client => 17,
                Side::Server => 41,
            }),
            next_cid: match side {
                Side::Client => 0x80,
                Side::Server => 0xc0,
            },
            key_generation: 0,
            crypto_data: Vec::new(),
            stream_data: HashMap::new(),
            stream_fins: Vec::new(),
            opened_streams: Vec::new(),
            closed_streams: Vec::new(),
            resets: Vec::new(),
            handshake_complete: false,
            client_initial_dcid: None,
            path_events: Vec::new(),
            retired_cids: Vec::new(),
            issued_cids: Vec::new(),
            stateless_reset_seen: false,
        }
    }

    /// Concatenated crypto bytes delivered at `level`
    pub(super) fn crypto_at(&self, level: Level) -> Vec<u8> {
        let mut out = Vec::new();
        for (l, _, data) in &self.crypto_data {
            if *l == level {
                out.extend_from_slice(data);
            }
        }
        out
    }
}

impl ConnectionHandler for TestHandler {
    fn recv_crypto_data(
        &mut self,
        level: Level,
        offset: u64,
        data: &[u8],
    ) -> Result<(), CallbackError> {
        self.crypto_data
            .push((level, offset, Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn recv_stream_data(
        &mut self,
        id: StreamId,
        fin: bool,
        offset: u64,
        data: &[u8],
    ) -> Result<(), CallbackError> {
        let buf = self.stream_data.entry(id).or_default();
        assert_eq!(offset as usize, buf.len(), "out-of-order delivery");
        buf.extend_from_slice(data);
        if fin {
            self.stream_fins.push(id);
        }
        Ok(())
    }

    fn new_connection_id(&mut self) -> Result<(ConnectionId, ResetToken), CallbackError> {
        let tag = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1);
        let mut token = [0; 16];
        self.rng.fill_bytes(&mut token);
        let issued = (ConnectionId::new(&[tag; 8]), ResetToken::from(token));
        self.issued_cids.push(issued);
        Ok(issued)
    }

    fn update_keys(&mut self) -> Result<KeyUpdate, CallbackError> {
        let update = update_keys_for(self.side, self.key_generation);
        self.key_generation += 1;
        Ok(update)
    }

    fn rand(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }

    fn recv_client_initial(&mut self, dcid: &ConnectionId) -> Result<(), CallbackError> {
        self.client_initial_dcid = Some(*dcid);
        Ok(())
    }

    fn handshake_completed(&mut self) {
        self.handshake_complete = true;
    }

    fn stream_opened(&mut self, id: StreamId) {
        self.opened_streams.push(id);
    }

    fn stream_closed(&mut self, id: StreamId, error: Option<VarInt>) {
        self.closed_streams.push((id, error));
    }

    fn stream_reset(&mut self, id: StreamId, final_size: u64, error: VarInt) {
        self.resets.push((id, final_size, error));
    }

    fn retire_connection_id(&mut self, cid: &ConnectionId) {
        self.retired_cids.push(*cid);
    }

    fn path_validated(&mut self, remote: SocketAddr, outcome: PathOutcome) {
        self.path_events.push((remote, outcome));
    }

    fn recv_stateless_reset(&mut self) {
        self.stateless_reset_seen = true;
    }
}

pub(super) const CLIENT_HELLO: &[u8] = b"cryptographic client hello......";
pub(super) const SERVER_HELLO: &[u8] = b"cryptographic server hello......";
pub(super) const SERVER_FLIGHT: &[u8] = b"encrypted extensions, cert, verify, finished";
pub(super) const CLIENT_FINISHED: &[u8] = b"client finished";

/// A client and server driven against each other through an in-memory link
pub(super) struct Pair {
    pub(super) client: Connection,
    pub(super) server: Connection,
    pub(super) client_handler: TestHandler,
    pub(super) server_handler: TestHandler,
    pub(super) now: Instant,
    pub(super) client_addr: SocketAddr,
    pub(super) server_addr: SocketAddr,
    /// Datagrams from the client are dropped while set
    pub(super) drop_client_datagrams: bool,
    /// Datagrams from the server are dropped while set
    pub(super) drop_server_datagrams: bool,
}

impl Pair {
    pub(super) fn new(client_config: TransportConfig, server_config: TransportConfig) -> Self {
        let now = Instant::now();
        let client_addr = SocketAddr::from(([127, 0, 0, 1], 47000));
        let server_addr = SocketAddr::from(([127, 0, 0, 1], 4433));
        let initial_dcid = ConnectionId::new(&[0xee; 8]);
        let client_cid = ConnectionId::new(&[0x1a; 8]);
        let server_cid = ConnectionId::new(&[0x2b; 8]);
        let client = Connection::new_client(
            Arc::new(client_config),
            server_addr,
            initial_dcid,
            client_cid,
            now,
        );
        let server = Connection::new_server(
            Arc::new(server_config),
            client_addr,
            initial_dcid,
            client_cid,
            server_cid,
            now,
        );
        Self {
            client,
            server,
            client_handler: TestHandler::new(Side::Client),
            server_handler: TestHandler::new(Side::Server),
            now,
            client_addr,
            server_addr,
            drop_client_datagrams: false,
            drop_server_datagrams: false,
        }
    }

    pub(super) fn default() -> Self {
        Self::new(TransportConfig::default(), TransportConfig::default())
    }

    pub(super) fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Run both endpoints' timers up to the current time
    pub(super) fn handle_timeouts(&mut self) {
        let _ = self
            .client
            .handle_timeout(&mut self.client_handler, self.now);
        let _ = self
            .server
            .handle_timeout(&mut self.server_handler, self.now);
    }

    /// Exchange datagrams until both endpoints go quiet
    pub(super) fn drive(&mut self) {
        let mut buf = Vec::new();
        for _ in 0..64 {
            let mut progress = false;
            let span = info_span!("client");
            let _e = span.enter();
            while let Ok(Some(transmit)) =
                self.client.poll_transmit(&NullCrypto, &mut buf, self.now)
            {
                progress = true;
                assert_eq!(transmit.size, buf.len());
                if self.drop_client_datagrams {
                    continue;
                }
                let data = BytesMut::from(&buf[..]);
                let _ = self.server.recv(
                    &mut self.server_handler,
                    &NullCrypto,
                    self.client_addr,
                    data,
                    self.now,
                );
            }
            drop(_e);
            let span = info_span!("server");
            let _e = span.enter();
            while let Ok(Some(transmit)) =
                self.server.poll_transmit(&NullCrypto, &mut buf, self.now)
            {
                progress = true;
                assert_eq!(transmit.size, buf.len());
                if self.drop_server_datagrams {
                    continue;
                }
                let data = BytesMut::from(&buf[..]);
                let _ = self.client.recv(
                    &mut self.client_handler,
                    &NullCrypto,
                    transmit.destination,
                    data,
                    self.now,
                );
            }
            drop(_e);
            if !progress {
                break;
            }
        }
    }

    /// Run the full handshake the way a real embedder's TLS stack would
    pub(super) fn connect(&mut self) {
        let (tx, rx) = initial_keys(Side::Client);
        self.client.install_initial_keys(tx, rx);
        let (tx, rx) = initial_keys(Side::Server);
        self.server.install_initial_keys(tx, rx);

        // Client flight: ClientHello
        self.client
            .submit_crypto_data(Level::Initial, Bytes::from_static(CLIENT_HELLO))
            .unwrap();
        self.drive();
        assert_eq!(self.server_handler.crypto_at(Level::Initial), CLIENT_HELLO);

        // Server flight: ServerHello + handshake data, keys, parameters
        self.server
            .submit_crypto_data(Level::Initial, Bytes::from_static(SERVER_HELLO))
            .unwrap();
        let (tx, rx) = handshake_keys(Side::Server);
        self.server.install_handshake_keys(tx, rx);
        self.server
            .submit_crypto_data(Level::Handshake, Bytes::from_static(SERVER_FLIGHT))
            .unwrap();
        self.server
            .set_peer_params(self.client.local_transport_params())
            .unwrap();
        let (tx, rx) = one_rtt_keys(Side::Server);
        self.server.install_1rtt_keys(tx, rx);
        let (tx, rx) = handshake_keys(Side::Client);
        self.client.install_handshake_keys(tx, rx);
        let (tx, rx) = one_rtt_keys(Side::Client);
        self.client.install_1rtt_keys(tx, rx);
        self.drive();
        assert_eq!(self.client_handler.crypto_at(Level::Initial), SERVER_HELLO);
        assert_eq!(
            self.client_handler.crypto_at(Level::Handshake),
            SERVER_FLIGHT
        );

        // Client completes: Finished, parameters, done
        self.client
            .set_peer_params(self.server.local_transport_params())
            .unwrap();
        self.client
            .submit_crypto_data(Level::Handshake, Bytes::from_static(CLIENT_FINISHED))
            .unwrap();
        self.client.handshake_completed().unwrap();
        self.drive();
        assert_eq!(
            self.server_handler.crypto_at(Level::Handshake),
            CLIENT_FINISHED
        );

        self.server.handshake_completed().unwrap();
        self.drive();
        assert!(self.client.is_established());
        assert!(self.server.is_established());
    }
}
