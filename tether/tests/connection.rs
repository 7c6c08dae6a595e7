//! Integration tests for connection lifecycle over loopback.

mod common;

use common::*;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tether::{DeliveryMethod, DisconnectReason, PacketKind, PeerState, TetherError};
use tether_test_support::make_message;

/// Test connect, accept and ordered data in both directions
#[test]
fn test_connect_and_exchange() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let client = Node::start(manual_config(), Recorder::accepting());

    let peer = client.manager.connect(server.addr(), b"hello").unwrap();
    assert_eq!(peer.state(), PeerState::Outgoing);
    assert!(pump_until(&[&client, &server], Duration::from_secs(5), || {
        peer.is_connected() && server.recorder.connected() == 1
    }));
    assert_eq!(client.recorder.connected(), 1);
    assert_eq!(
        server.recorder.count(|s| *s == Seen::Request(client.addr(), b"hello".to_vec())),
        1
    );

    for id in 0..100 {
        peer.send(&make_message(id, 64), 0, DeliveryMethod::ReliableOrdered)
            .unwrap();
    }
    assert!(pump_until(&[&client, &server], Duration::from_secs(5), || {
        server.recorder.log.len() == 100
    }));
    assert!(server.recorder.log.report(100).is_perfect());

    let back = server.manager.peer(client.addr()).unwrap();
    back.send(b"pong", 0, DeliveryMethod::ReliableUnordered).unwrap();
    assert!(pump_until(&[&client, &server], Duration::from_secs(5), || {
        client.recorder.payloads() == vec![b"pong".to_vec()]
    }));
    assert_eq!(server.manager.connected_peers_count(), 1);
}

/// Test that a rejection reaches the initiator with its data
#[test]
fn test_reject_with_data() {
    let server = Node::start(manual_config(), Recorder::new(Decision::Reject(b"full".to_vec())));
    let client = Node::start(manual_config(), Recorder::accepting());

    let peer = client.manager.connect(server.addr(), &[]).unwrap();
    assert!(pump_until(&[&client, &server], Duration::from_secs(5), || {
        !client.recorder.disconnects(DisconnectReason::ConnectionRejected).is_empty()
    }));
    assert_eq!(
        client.recorder.disconnects(DisconnectReason::ConnectionRejected),
        vec![b"full".to_vec()]
    );
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert!(server.manager.peer(client.addr()).is_none());
    assert_eq!(server.recorder.connected(), 0);
}

/// Test that repeated requests surface once and connect once
#[test]
fn test_duplicate_requests_single_connection() {
    let server = Node::start(manual_config(), Recorder::new(Decision::Hold));
    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let request = connect_request(server.manager.config().protocol_id, 77, b"me");
    raw.send_to(&request, server.addr()).unwrap();
    raw.send_to(&request, server.addr()).unwrap();
    pump_for(&[&server], Duration::from_millis(100));
    assert_eq!(server.recorder.count(|s| matches!(s, Seen::Request(..))), 1);
    assert_eq!(server.manager.pending_requests(), 1);

    let held = server.recorder.requests.lock().unwrap().clone();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].connection_id(), 77);
    assert!(held[0].accept().is_some());
    assert!(held[0].accept().is_none());
    server.manager.poll_events();
    assert_eq!(server.recorder.connected(), 1);
    assert_eq!(server.manager.pending_requests(), 0);

    let accept = recv_kind(&raw, PacketKind::ConnectAccept);
    assert_eq!(accept.len(), 9);
    assert_eq!(u64::from_le_bytes(accept[1..9].try_into().unwrap()), 77);

    // A retried request after connecting gets the accept again.
    raw.send_to(&request, server.addr()).unwrap();
    pump_for(&[&server], Duration::from_millis(50));
    assert_eq!(recv_kind(&raw, PacketKind::ConnectAccept).len(), 9);
    assert_eq!(server.recorder.connected(), 1);
    assert_eq!(server.recorder.count(|s| matches!(s, Seen::Request(..))), 1);
}

/// Test that a newer connection id from the same endpoint replaces the old one
#[test]
fn test_reconnect_replaces_connection() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    let protocol = server.manager.config().protocol_id;
    let from = raw.local_addr().unwrap();

    raw.send_to(&connect_request(protocol, 10, &[]), server.addr()).unwrap();
    pump_for(&[&server], Duration::from_millis(50));
    let first = server.manager.peer(from).unwrap();
    assert!(first.is_connected());

    raw.send_to(&connect_request(protocol, 11, &[]), server.addr()).unwrap();
    pump_for(&[&server], Duration::from_millis(50));
    let second = server.manager.peer(from).unwrap();
    assert_eq!(second.connection_id(), 11);
    assert!(second.is_connected());
    assert_eq!(second.connection_number(), first.connection_number() + 1);
    assert_eq!(first.state(), PeerState::Disconnected);
    assert_eq!(server.recorder.disconnects(DisconnectReason::Reconnect).len(), 1);

    // An older id is ignored.
    raw.send_to(&connect_request(protocol, 10, &[]), server.addr()).unwrap();
    pump_for(&[&server], Duration::from_millis(50));
    assert!(Arc::ptr_eq(&server.manager.peer(from).unwrap(), &second));
    assert_eq!(server.recorder.count(|s| matches!(s, Seen::Request(..))), 2);
}

/// Test that a protocol mismatch is reported to the initiator
#[test]
fn test_invalid_protocol() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let client = Node::start(manual_config().with_protocol_id(2), Recorder::accepting());

    client.manager.connect(server.addr(), &[]).unwrap();
    assert!(pump_until(&[&client, &server], Duration::from_secs(5), || {
        !client.recorder.disconnects(DisconnectReason::InvalidProtocol).is_empty()
    }));
    assert_eq!(server.recorder.count(|s| matches!(s, Seen::Request(..))), 0);
    assert!(server.manager.peer(client.addr()).is_none());
}

/// Test that connecting to a silent endpoint fails after the retries
#[test]
fn test_connect_fails_without_answer() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let config = manual_config()
        .with_reconnect_delay(Duration::from_millis(20))
        .with_max_connect_attempts(3);
    let client = Node::start(config, Recorder::accepting());

    let peer = client.manager.connect(silent.local_addr().unwrap(), &[]).unwrap();
    assert!(pump_until(&[&client], Duration::from_secs(5), || {
        peer.state() == PeerState::Disconnected
    }));
    assert_eq!(
        client.recorder.disconnects(DisconnectReason::ConnectionFailed).len(),
        1
    );
    assert_eq!(client.recorder.connected(), 0);
}

/// Test graceful disconnect with data
#[test]
fn test_remote_disconnect() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let client = Node::start(manual_config(), Recorder::accepting());
    let peer = connect(&client, &server);

    client.manager.disconnect_peer(&peer, b"bye");
    assert_eq!(peer.state(), PeerState::ShutdownRequested);
    assert!(pump_until(&[&client, &server], Duration::from_secs(5), || {
        !server.recorder.disconnects(DisconnectReason::RemoteConnectionClose).is_empty()
            && peer.state() == PeerState::Disconnected
    }));
    assert_eq!(
        server.recorder.disconnects(DisconnectReason::RemoteConnectionClose),
        vec![b"bye".to_vec()]
    );
    assert_eq!(
        client.recorder.disconnects(DisconnectReason::DisconnectPeerCalled).len(),
        1
    );
    assert!(matches!(
        peer.send(b"late", 0, DeliveryMethod::ReliableOrdered),
        Err(TetherError::NotConnected)
    ));
}

/// Test that connecting right after a local disconnect starts a fresh attempt
#[test]
fn test_connect_after_disconnect_replaces_record() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let client = Node::start(manual_config(), Recorder::accepting());
    let first = connect(&client, &server);

    client.manager.disconnect_peer(&first, b"");
    let second = client.manager.connect(server.addr(), b"again").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.state(), PeerState::Outgoing);
    assert_eq!(first.state(), PeerState::Disconnected);
    assert!(second.connection_id() > first.connection_id());
    assert!(Arc::ptr_eq(&client.manager.peer(server.addr()).unwrap(), &second));

    assert!(pump_until(&[&client, &server], Duration::from_secs(3), || {
        second.is_connected() && server.recorder.connected() == 2
    }));
    assert_eq!(client.recorder.connected(), 2);
    assert_eq!(
        client.recorder.disconnects(DisconnectReason::DisconnectPeerCalled).len(),
        1
    );
    let record = server.manager.peer(client.addr()).unwrap();
    assert!(record.is_connected());
    assert_eq!(record.connection_id(), second.connection_id());

    second.send(b"still here", 0, DeliveryMethod::ReliableOrdered).unwrap();
    assert!(pump_until(&[&client, &server], Duration::from_secs(3), || {
        server.recorder.payloads() == vec![b"still here".to_vec()]
    }));
}

/// Test that connecting again while connected returns the live record
#[test]
fn test_connect_returns_live_record() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let client = Node::start(manual_config(), Recorder::accepting());
    let pending = client.manager.connect(server.addr(), &[]).unwrap();
    let again = client.manager.connect(server.addr(), &[]).unwrap();
    assert!(Arc::ptr_eq(&pending, &again));

    let peer = connect(&client, &server);
    assert!(Arc::ptr_eq(&peer, &pending));
    let again = client.manager.connect(server.addr(), &[]).unwrap();
    assert!(Arc::ptr_eq(&peer, &again));
}

/// Test that a silent remote times out
#[test]
fn test_peer_timeout() {
    let config = manual_config().with_disconnect_timeout(Duration::from_millis(300));
    let server = Node::start(config.clone(), Recorder::accepting());
    let client = Node::start(config, Recorder::accepting());
    let peer = connect(&client, &server);

    // Only the client keeps running.
    assert!(pump_until(&[&client], Duration::from_secs(5), || {
        !client.recorder.disconnects(DisconnectReason::Timeout).is_empty()
    }));
    assert!(!peer.is_connected());
}

/// Test a symmetric connect where both sides dial each other
#[test]
fn test_symmetric_connect() {
    let a = Node::start(manual_config(), Recorder::accepting());
    let b = Node::start(manual_config(), Recorder::accepting());

    a.manager.connect(b.addr(), &[]).unwrap();
    b.manager.connect(a.addr(), &[]).unwrap();
    assert!(pump_until(&[&a, &b], Duration::from_secs(5), || {
        a.manager.connected_peers_count() == 1 && b.manager.connected_peers_count() == 1
    }));
    pump_for(&[&a, &b], Duration::from_millis(50));
    assert_eq!(a.manager.connected_peers_count(), 1);
    assert_eq!(b.manager.connected_peers_count(), 1);

    let a_peer = a.manager.peer(b.addr()).unwrap();
    let b_peer = b.manager.peer(a.addr()).unwrap();
    assert_eq!(a_peer.connection_id(), b_peer.connection_id());

    let losses = a.recorder.disconnects(DisconnectReason::PeerToPeerConnection).len()
        + b.recorder.disconnects(DisconnectReason::PeerToPeerConnection).len();
    assert_eq!(losses, 1);
}

/// Test that stopping notifies the remote side and refuses further use
#[test]
fn test_stop_disconnects_peers() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let client = Node::start(manual_config(), Recorder::accepting());
    connect(&client, &server);

    client.manager.stop();
    assert!(!client.manager.is_running());
    assert!(pump_until(&[&server], Duration::from_secs(5), || {
        !server.recorder.disconnects(DisconnectReason::RemoteConnectionClose).is_empty()
    }));
    assert!(matches!(
        client.manager.manual_update(),
        Err(TetherError::NotRunning)
    ));
    assert!(matches!(
        client.manager.connect(server.addr(), &[]),
        Err(TetherError::NotRunning)
    ));
}

/// Test pool accounting after a session
#[test]
fn test_pool_returns_every_packet() {
    let server = Node::start(manual_config(), Recorder::accepting());
    let client = Node::start(manual_config(), Recorder::accepting());
    let peer = connect(&client, &server);

    for id in 0..50 {
        peer.send(&make_message(id, 300), 0, DeliveryMethod::ReliableOrdered)
            .unwrap();
        peer.send(&make_message(id, 100), 0, DeliveryMethod::Unreliable)
            .unwrap();
    }
    assert!(pump_until(&[&client, &server], Duration::from_secs(5), || {
        server.recorder.log.len() == 100
    }));

    client.manager.stop();
    server.manager.stop();
    client.manager.poll_events();
    server.manager.poll_events();
    for stats in [client.manager.pool_stats(), server.manager.pool_stats()] {
        assert!(stats.is_balanced());
        assert_eq!(stats.outstanding(), 0);
    }
}

fn connect_request(protocol_id: u32, connection_id: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![PacketKind::ConnectRequest as u8];
    buf.extend_from_slice(&protocol_id.to_le_bytes());
    buf.extend_from_slice(&connection_id.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Read datagrams until one of `kind` arrives.
fn recv_kind(socket: &UdpSocket, kind: PacketKind) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    loop {
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        if buf[0] & 0x1f == kind as u8 {
            return buf[..len].to_vec();
        }
    }
}
