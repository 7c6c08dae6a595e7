//! Loopback harness shared by the integration tests.
#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tether::{
    ConnectionRequest, DatagramSocket, DeliveryMethod, DisconnectInfo, DisconnectReason,
    EventListener, NatAddressType, Peer, SocketOptions, TransportConfig, TransportManager,
    UdpDatagramSocket, UnconnectedKind,
};
use tether_test_support::loss::{DropDecision, LossGenerator};
use tether_test_support::{DeliveryLog, LinkChaos};

/// What the listener does with connection requests.
#[derive(Debug, Clone)]
pub enum Decision {
    Accept,
    Reject(Vec<u8>),
    /// Keep the request for the test to decide.
    Hold,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Connected(SocketAddr),
    Disconnected(SocketAddr, DisconnectReason, Vec<u8>),
    Request(SocketAddr, Vec<u8>),
    Unconnected(SocketAddr, Vec<u8>, UnconnectedKind),
    Nat(SocketAddr, NatAddressType, String),
    Latency(SocketAddr),
    Error,
}

/// Listener recording everything it sees.
pub struct Recorder {
    decision: Decision,
    pub seen: Mutex<Vec<Seen>>,
    pub log: DeliveryLog,
    pub received: Mutex<Vec<(Vec<u8>, u8, DeliveryMethod)>>,
    pub requests: Mutex<Vec<Arc<ConnectionRequest>>>,
}

impl Recorder {
    pub fn new(decision: Decision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            seen: Mutex::new(Vec::new()),
            log: DeliveryLog::new(),
            received: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new(Decision::Accept)
    }

    pub fn count(&self, predicate: impl Fn(&Seen) -> bool) -> usize {
        self.seen.lock().unwrap().iter().filter(|s| predicate(s)).count()
    }

    pub fn connected(&self) -> usize {
        self.count(|s| matches!(s, Seen::Connected(_)))
    }

    pub fn disconnects(&self, reason: DisconnectReason) -> Vec<Vec<u8>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| match s {
                Seen::Disconnected(_, r, data) if *r == reason => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(data, _, _)| data.clone())
            .collect()
    }

    fn push(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }
}

impl EventListener for Recorder {
    fn on_connected(&self, peer: &Arc<Peer>) {
        self.push(Seen::Connected(peer.remote()));
    }

    fn on_disconnected(&self, peer: &Arc<Peer>, info: &DisconnectInfo) {
        self.push(Seen::Disconnected(peer.remote(), info.reason, info.data.clone()));
    }

    fn on_receive(&self, _peer: &Arc<Peer>, data: &[u8], channel: u8, method: DeliveryMethod) {
        self.log.record(data);
        self.received
            .lock()
            .unwrap()
            .push((data.to_vec(), channel, method));
    }

    fn on_receive_unconnected(&self, remote: SocketAddr, data: &[u8], kind: UnconnectedKind) {
        self.push(Seen::Unconnected(remote, data.to_vec(), kind));
    }

    fn on_network_error(&self, _remote: Option<SocketAddr>, _error: &io::Error) {
        self.push(Seen::Error);
    }

    fn on_latency_update(&self, peer: &Arc<Peer>, _latency: Duration) {
        self.push(Seen::Latency(peer.remote()));
    }

    fn on_connection_request(&self, request: &Arc<ConnectionRequest>) {
        self.push(Seen::Request(request.remote(), request.data().to_vec()));
        match &self.decision {
            Decision::Accept => {
                request.accept();
            }
            Decision::Reject(data) => {
                request.reject(data);
            }
            Decision::Hold => self.requests.lock().unwrap().push(request.clone()),
        }
    }

    fn on_nat_introduction_success(&self, endpoint: SocketAddr, address_type: NatAddressType, token: &str) {
        self.push(Seen::Nat(endpoint, address_type, token.to_string()));
    }
}

pub fn manual_config() -> TransportConfig {
    TransportConfig::default().with_manual_mode(true)
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn socket_options() -> SocketOptions {
    SocketOptions {
        broadcast: false,
        buffer_size: 4 * 1024 * 1024,
        nonblocking: true,
    }
}

/// A manager on loopback plus the listener behind it.
pub struct Node {
    pub manager: TransportManager,
    pub recorder: Arc<Recorder>,
}

impl Node {
    pub fn start(config: TransportConfig, recorder: Arc<Recorder>) -> Self {
        let manager = TransportManager::new(config, recorder.clone()).unwrap();
        manager.start(loopback()).unwrap();
        Self { manager, recorder }
    }

    pub fn start_with_socket(
        config: TransportConfig,
        recorder: Arc<Recorder>,
        socket: Arc<dyn DatagramSocket>,
    ) -> Self {
        let manager = TransportManager::new(config, recorder.clone()).unwrap();
        manager.start_with_socket(socket).unwrap();
        Self { manager, recorder }
    }

    pub fn addr(&self) -> SocketAddr {
        self.manager.local_addr().unwrap()
    }

    fn pump(&self) {
        self.manager.manual_receive().unwrap();
        self.manager.manual_update().unwrap();
        self.manager.poll_events();
    }
}

/// Pump every node until `done` holds or `timeout` passes.
pub fn pump_until(nodes: &[&Node], timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for node in nodes {
            node.pump();
        }
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

pub fn pump_for(nodes: &[&Node], duration: Duration) {
    pump_until(nodes, duration, || false);
}

/// Connect `client` to `server` and pump until both sides report it.
pub fn connect(client: &Node, server: &Node) -> Arc<Peer> {
    let peer = client.manager.connect(server.addr(), b"").unwrap();
    let ok = pump_until(&[client, server], Duration::from_secs(5), || {
        peer.is_connected() && server.recorder.connected() > 0
    });
    assert!(ok, "connection not established");
    peer
}

/// Loopback socket that loses and mangles outbound datagrams.
pub struct LossySocket {
    inner: UdpDatagramSocket,
    loss: Mutex<LossGenerator>,
    chaos: Option<Mutex<LinkChaos>>,
}

impl LossySocket {
    pub fn new(loss: LossGenerator) -> Arc<Self> {
        Arc::new(Self {
            inner: UdpDatagramSocket::bind(loopback(), &socket_options()).unwrap(),
            loss: Mutex::new(loss),
            chaos: None,
        })
    }

    pub fn with_chaos(loss: LossGenerator, chaos: LinkChaos) -> Arc<Self> {
        Arc::new(Self {
            inner: UdpDatagramSocket::bind(loopback(), &socket_options()).unwrap(),
            loss: Mutex::new(loss),
            chaos: Some(Mutex::new(chaos)),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.loss.lock().unwrap().stats().dropped
    }
}

impl DatagramSocket for LossySocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.loss.lock().unwrap().next_decision() == DropDecision::Drop {
            return Ok(buf.len());
        }
        match &self.chaos {
            Some(chaos) => {
                let out = chaos.lock().unwrap().apply(buf.to_vec());
                for datagram in out {
                    self.inner.send_to(&datagram, addr)?;
                }
            }
            None => {
                self.inner.send_to(buf, addr)?;
            }
        }
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
