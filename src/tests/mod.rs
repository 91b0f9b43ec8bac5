use std::time::Duration;

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};

use crate::crypto::Level;
use crate::frame::Close;
use crate::handler::PathOutcome;
use crate::{ApplicationClose, Dir, Error, TransportConfig, VarInt};

mod util;
use util::{subscribe, NullCrypto, Pair};

#[test]
fn handshake() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    assert!(pair.client_handler.handshake_complete);
    assert!(pair.server_handler.handshake_complete);
    assert_eq!(
        pair.server_handler.client_initial_dcid,
        Some(crate::ConnectionId::new(&[0xee; 8]))
    );
    // Both Initial flights were acknowledged instantaneously
    assert_eq!(pair.client.rtt(), Duration::ZERO);
}

#[test]
fn bidi_stream_transfer() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client.open_stream(Dir::Bi, 7).unwrap();
    assert_eq!(id.index(), 0);
    assert_eq!(pair.client.stream_user(id), Some(7));
    let sent = pair.client.write_stream(id, b"hello quic", true).unwrap();
    assert_eq!(sent, 10);
    pair.drive();

    assert_eq!(pair.server_handler.opened_streams, vec![id]);
    assert_eq!(pair.server_handler.stream_data[&id], b"hello quic");
    assert!(pair.server_handler.stream_fins.contains(&id));

    // Echo something back and close the server's half
    pair.server.write_stream(id, b"pong", true).unwrap();
    pair.drive();
    assert_eq!(pair.client_handler.stream_data[&id], b"pong");
    assert!(pair.client_handler.stream_fins.contains(&id));

    // Acks eventually close the stream on both sides
    pair.advance(Duration::from_millis(30));
    pair.handle_timeouts();
    pair.drive();
    pair.advance(Duration::from_millis(30));
    pair.handle_timeouts();
    pair.drive();
    assert!(pair
        .client_handler
        .closed_streams
        .iter()
        .any(|(closed, _)| *closed == id));
    assert!(pair
        .server_handler
        .closed_streams
        .iter()
        .any(|(closed, _)| *closed == id));
}

#[test]
fn uni_stream_transfer() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    assert_eq!(id.dir(), Dir::Uni);
    pair.client.write_stream(id, &[0x42; 5000], false).unwrap();
    pair.client.write_stream(id, &[0x43; 100], true).unwrap();
    pair.drive();

    let received = &pair.server_handler.stream_data[&id];
    assert_eq!(received.len(), 5100);
    assert_eq!(received[0], 0x42);
    assert_eq!(received[5099], 0x43);
    assert!(pair.server_handler.stream_fins.contains(&id));

    // Writing against the peer's direction is not possible
    assert_matches!(
        pair.server.write_stream(id, b"nope", false),
        Err(Error::UnknownStream)
    );
}

#[test]
fn open_stream_ids_and_exhaustion() {
    let _guard = subscribe();
    let mut server_config = TransportConfig::default();
    server_config.max_concurrent_bidi_streams(VarInt::from_u32(3));
    let mut pair = Pair::new(TransportConfig::default(), server_config);
    pair.connect();

    let a = pair.client.open_stream(Dir::Bi, 0).unwrap();
    let b = pair.client.open_stream(Dir::Bi, 0).unwrap();
    let c = pair.client.open_stream(Dir::Bi, 0).unwrap();
    assert_eq!(u64::from(a), 0);
    assert_eq!(u64::from(b), 4);
    assert_eq!(u64::from(c), 8);
    assert_matches!(
        pair.client.open_stream(Dir::Bi, 0),
        Err(Error::StreamIdExhausted)
    );
}

#[test]
fn connection_flow_control_blocks_and_recovers() {
    let _guard = subscribe();
    let mut server_config = TransportConfig::default();
    server_config.receive_window(VarInt::from_u32(64));
    server_config.stream_receive_window(VarInt::from_u32(1 << 20));
    let mut pair = Pair::new(TransportConfig::default(), server_config);
    pair.connect();

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    // Only the connection-level window limits us
    let written = pair.client.write_stream(id, &[0xaa; 200], false).unwrap();
    assert_eq!(written, 64);
    assert_matches!(
        pair.client.write_stream(id, &[0xaa; 136], false),
        Err(Error::Blocked)
    );
    pair.drive();
    assert_eq!(pair.server_handler.stream_data[&id].len(), 64);

    // The server consumes and returns credit; a MAX_DATA goes out once
    // half the window is freed
    pair.server.extend_max_data(64);
    pair.drive();
    let written = pair.client.write_stream(id, &[0xbb; 136], false).unwrap();
    assert_eq!(written, 64);
    pair.drive();
    assert_eq!(pair.server_handler.stream_data[&id].len(), 128);
}

#[test]
fn stream_flow_control_blocks_and_recovers() {
    let _guard = subscribe();
    let mut server_config = TransportConfig::default();
    server_config.stream_receive_window(VarInt::from_u32(32));
    let mut pair = Pair::new(TransportConfig::default(), server_config);
    pair.connect();

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    assert_eq!(pair.client.write_stream(id, &[1; 100], false).unwrap(), 32);
    assert_matches!(
        pair.client.write_stream(id, &[1; 68], false),
        Err(Error::Blocked)
    );
    pair.drive();
    assert_eq!(pair.server_handler.stream_data[&id].len(), 32);

    pair.server.extend_max_stream_data(id, 32).unwrap();
    pair.drive();
    assert_eq!(pair.client.write_stream(id, &[2; 68], false).unwrap(), 32);
    pair.drive();
    assert_eq!(pair.server_handler.stream_data[&id].len(), 64);
}

#[test]
fn lost_datagram_is_retransmitted() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    pair.client.write_stream(id, b"lost once", true).unwrap();
    pair.drop_client_datagrams = true;
    pair.drive();
    assert!(!pair.server_handler.stream_data.contains_key(&id));

    // Let the probe timeout fire and heal the loss
    pair.drop_client_datagrams = false;
    pair.advance(Duration::from_secs(2));
    pair.handle_timeouts();
    pair.drive();
    assert_eq!(pair.server_handler.stream_data[&id], b"lost once");
    assert!(pair.server_handler.stream_fins.contains(&id));
}

#[test]
fn reset_stream_reaches_peer() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    pair.client.write_stream(id, b"partial", false).unwrap();
    pair.drive();
    pair.client.reset_stream(id, VarInt::from_u32(99)).unwrap();
    pair.drive();

    assert_eq!(
        pair.server_handler.resets,
        vec![(id, 7, VarInt::from_u32(99))]
    );
    // The acknowledged reset settled the stream and discarded its state
    assert_matches!(
        pair.client.write_stream(id, b"more", false),
        Err(Error::UnknownStream)
    );
}

#[test]
fn stop_sending_triggers_reset() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    pair.client.write_stream(id, b"unwanted", false).unwrap();
    pair.drive();

    pair.server.stop_sending(id, VarInt::from_u32(5)).unwrap();
    pair.drive();

    // The client responded to STOP_SENDING by resetting with the same
    // code; once that reset was acknowledged the stream is gone
    assert_matches!(
        pair.client.write_stream(id, b"x", false),
        Err(Error::UnknownStream)
    );
    assert_eq!(
        pair.server_handler.resets,
        vec![(id, 8, VarInt::from_u32(5))]
    );
}

#[test]
fn key_update_round_trip() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    pair.client
        .initiate_key_update(&mut pair.client_handler)
        .unwrap();
    assert_eq!(pair.client_handler.key_generation, 1);

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    pair.client.write_stream(id, b"new phase", true).unwrap();
    pair.drive();

    // The server derived matching next-generation keys on demand
    assert_eq!(pair.server_handler.key_generation, 1);
    assert_eq!(pair.server_handler.stream_data[&id], b"new phase");

    // Traffic keeps flowing in the other direction too
    let id = pair.server.open_stream(Dir::Uni, 0).unwrap();
    pair.server.write_stream(id, b"echo", true).unwrap();
    pair.drive();
    assert_eq!(pair.client_handler.stream_data[&id], b"echo");
}

#[test]
fn application_close_drains_peer() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let mut buf = Vec::new();
    let transmit = pair
        .client
        .close(
            &NullCrypto,
            &mut buf,
            Close::Application(ApplicationClose {
                error_code: VarInt::from_u32(3),
                reason: Bytes::from_static(b"done"),
            }),
            pair.now,
        )
        .unwrap();
    assert!(pair.client.is_closed());

    let data = BytesMut::from(&buf[..transmit.size]);
    pair.server
        .recv(
            &mut pair.server_handler,
            &NullCrypto,
            pair.client_addr,
            data,
            pair.now,
        )
        .unwrap();
    assert!(pair.server.is_closed());
    assert_matches!(
        pair.server
            .poll_transmit(&NullCrypto, &mut buf, pair.now),
        Err(Error::Draining)
    );
    assert_matches!(
        pair.client.open_stream(Dir::Bi, 0),
        Err(Error::Closing)
    );
}

#[test]
fn migration_validates_new_path() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    // Exchange a packet so the server has spare CIDs to bind to a new path
    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    pair.client.write_stream(id, b"warmup", true).unwrap();
    pair.drive();

    // The client pops up at a different address
    pair.client_addr = std::net::SocketAddr::from(([127, 0, 0, 1], 48123));
    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    pair.client.write_stream(id, b"from elsewhere", true).unwrap();
    pair.drive();

    assert_eq!(pair.server.remote_address(), pair.client_addr);
    assert!(pair
        .server_handler
        .path_events
        .iter()
        .any(|&(addr, outcome)| addr == pair.client_addr && outcome == PathOutcome::Success));
    assert_eq!(pair.server_handler.stream_data[&id], b"from elsewhere");
}

#[test]
fn stateless_reset_detected() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    // A datagram that routes nowhere but ends in a reset token the server
    // issued tells the client the server lost its state
    let (_, token) = pair.server_handler.issued_cids[0];
    let mut wire = vec![0x40u8];
    wire.extend_from_slice(&[0x99; 8]);
    wire.extend_from_slice(&[0x77; 20]);
    wire.extend_from_slice(&token);
    pair.client
        .recv(
            &mut pair.client_handler,
            &NullCrypto,
            pair.server_addr,
            BytesMut::from(&wire[..]),
            pair.now,
        )
        .unwrap();
    assert!(pair.client_handler.stateless_reset_seen);
    assert!(pair.client.is_closed());
}

#[test]
fn idle_timeout_drains() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.advance(Duration::from_secs(60));
    pair.handle_timeouts();
    assert!(pair.client.is_closed());
    assert!(pair.server.is_closed());
}

#[test]
fn acknowledged_data_reports_progress() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client.open_stream(Dir::Uni, 0).unwrap();
    pair.client.write_stream(id, &[9; 2000], true).unwrap();
    pair.drive();
    // Force the delayed ack out
    pair.advance(Duration::from_millis(30));
    pair.handle_timeouts();
    pair.drive();
    assert_eq!(pair.client.bytes_in_flight(), 0);
}

#[test]
fn crypto_before_keys_is_buffered() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    // Run connect manually, but delay the client's handshake keys until
    // after the server's flight arrived
    let (tx, rx) = util::initial_keys(crate::Side::Client);
    pair.client.install_initial_keys(tx, rx);
    let (tx, rx) = util::initial_keys(crate::Side::Server);
    pair.server.install_initial_keys(tx, rx);
    pair.client
        .submit_crypto_data(Level::Initial, Bytes::from_static(util::CLIENT_HELLO))
        .unwrap();
    pair.drive();

    pair.server
        .submit_crypto_data(Level::Initial, Bytes::from_static(util::SERVER_HELLO))
        .unwrap();
    let (tx, rx) = util::handshake_keys(crate::Side::Server);
    pair.server.install_handshake_keys(tx, rx);
    pair.server
        .submit_crypto_data(Level::Handshake, Bytes::from_static(util::SERVER_FLIGHT))
        .unwrap();
    // Client lacks handshake keys; the flight's Handshake packet is buffered
    pair.drive();
    assert_eq!(pair.client_handler.crypto_at(Level::Handshake), b"");

    let (tx, rx) = util::handshake_keys(crate::Side::Client);
    pair.client.install_handshake_keys(tx, rx);
    // Any datagram (here: a retransmitted flight after a timeout) causes
    // the buffered packet to be replayed
    pair.advance(Duration::from_secs(1));
    pair.handle_timeouts();
    pair.drive();
    assert_eq!(
        pair.client_handler.crypto_at(Level::Handshake),
        util::SERVER_FLIGHT
    );
}
