//! Transport manager.
//!
//! Owns the socket, the peer set, the handshake broker, the event queue and
//! two threads:
//!
//! ```text
//! tether-recv    socket ──► simulation ──► layer ──► checksum ──► decode ──► route
//! tether-update  every update_interval (or when triggered): peer timers,
//!                retransmission, parked datagrams, NAT expiry
//! ```
//!
//! In manual mode no thread is spawned; the caller pumps
//! [`manual_receive`](TransportManager::manual_receive) and
//! [`manual_update`](TransportManager::manual_update) itself.
//!
//! Locks are held only around map and queue operations, never across a
//! socket call.

use crate::config::TransportConfig;
use crate::event::{
    dispatch, DisconnectInfo, DisconnectReason, EventDelivery, EventListener, EventQueue,
    TransportEvent, UnconnectedKind,
};
use crate::handshake::{
    classify_request, parse_connect_request, ConnectionRequest, HandshakeBroker, RequestResolver,
    RequestVerdict,
};
use crate::nat::NatPunchModule;
use crate::packet::{self, Packet};
use crate::peer::{Peer, PeerEnv, PeerOutput, PeerState};
use crate::pool::{PacketPool, PoolStats};
use crate::simulation::{NetworkSimulator, Verdict};
use crate::socket::{
    classify, DatagramSocket, PacketLayer, SocketErrorClass, SocketOptions, UdpDatagramSocket,
    MAX_DATAGRAM_SIZE, RECEIVE_POLL_TIMEOUT,
};
use crate::stats::{NetStatistics, StatisticsSnapshot};
use crate::{channel::DeliveryMethod, Result, TetherError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tether_shared::crc32::{self, CHECKSUM_SIZE};
use tether_shared::{PacketHeader, PacketKind};

/// Initial send buffer; grows for oversized unconnected messages.
const SEND_BUFFER_SIZE: usize = 2048;

thread_local! {
    static SEND_BUFFER: RefCell<Vec<u8>> = RefCell::new(vec![0u8; SEND_BUFFER_SIZE]);
}

/// Reliable UDP endpoint: client, server and NAT relay in one.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tether::{ConnectionRequest, DeliveryMethod, EventListener, Peer, TransportConfig, TransportManager};
///
/// struct Echo;
///
/// impl EventListener for Echo {
///     fn on_connection_request(&self, request: &Arc<ConnectionRequest>) {
///         request.accept();
///     }
///
///     fn on_receive(&self, peer: &Arc<Peer>, data: &[u8], channel: u8, method: DeliveryMethod) {
///         let _ = peer.send(data, channel, method);
///     }
/// }
///
/// let server = TransportManager::new(TransportConfig::default(), Arc::new(Echo)).unwrap();
/// server.start("0.0.0.0:9050".parse().unwrap()).unwrap();
/// loop {
///     server.poll_events();
///     std::thread::sleep(std::time::Duration::from_millis(15));
/// }
/// ```
pub struct TransportManager {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    weak: Weak<Shared>,
    config: Arc<TransportConfig>,
    env: PeerEnv,
    listener: Arc<dyn EventListener>,
    layer: Option<Arc<dyn PacketLayer>>,
    socket: RwLock<Option<Arc<dyn DatagramSocket>>>,
    peers: RwLock<HashMap<SocketAddr, Arc<Peer>>>,
    broker: HandshakeBroker,
    events: EventQueue,
    nat: NatPunchModule,
    simulator: Option<NetworkSimulator>,
    stats: NetStatistics,
    running: AtomicBool,
    next_peer_id: AtomicU32,
    wake: Mutex<bool>,
    wake_signal: Condvar,
}

impl TransportManager {
    pub fn new(config: TransportConfig, listener: Arc<dyn EventListener>) -> Result<Self> {
        Self::build(config, listener, None)
    }

    /// Manager whose datagrams pass through `layer` (encryption, compression).
    pub fn new_with_layer(
        config: TransportConfig,
        listener: Arc<dyn EventListener>,
        layer: Arc<dyn PacketLayer>,
    ) -> Result<Self> {
        Self::build(config, listener, Some(layer))
    }

    fn build(
        config: TransportConfig,
        listener: Arc<dyn EventListener>,
        layer: Option<Arc<dyn PacketLayer>>,
    ) -> Result<Self> {
        config.validate()?;
        let overhead = config.checksum_overhead() + layer.as_ref().map_or(0, |l| l.extra_size());
        let config = Arc::new(config);
        let pool = Arc::new(PacketPool::new(config.pool_capacity));
        let simulator = config
            .simulation
            .is_active()
            .then(|| NetworkSimulator::new(config.simulation.clone()));
        let shared = Arc::new_cyclic(|weak| Shared {
            weak: weak.clone(),
            env: PeerEnv::new(config.clone(), pool, overhead),
            config,
            listener,
            layer,
            socket: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            broker: HandshakeBroker::new(),
            events: EventQueue::default(),
            nat: NatPunchModule::new(),
            simulator,
            stats: NetStatistics::default(),
            running: AtomicBool::new(false),
            next_peer_id: AtomicU32::new(0),
            wake: Mutex::new(false),
            wake_signal: Condvar::new(),
        });
        Ok(Self {
            shared,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Bind a UDP socket on `addr` and start.
    pub fn start(&self, addr: SocketAddr) -> Result<()> {
        let config = &self.shared.config;
        let options = SocketOptions {
            broadcast: config.broadcast,
            buffer_size: config.socket_buffer_size,
            nonblocking: config.manual_mode,
        };
        let socket = UdpDatagramSocket::bind(addr, &options)?;
        self.start_with_socket(Arc::new(socket))
    }

    /// Start on an already bound socket.
    pub fn start_with_socket(&self, socket: Arc<dyn DatagramSocket>) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(TetherError::AlreadyRunning);
        }
        *self.shared.socket.write() = Some(socket.clone());
        trace_info!(local = ?socket.local_addr().ok(), manual = self.shared.config.manual_mode, "transport started");
        if self.shared.config.manual_mode {
            return Ok(());
        }
        if let Err(err) = self.spawn_threads(socket) {
            self.stop();
            return Err(err.into());
        }
        Ok(())
    }

    fn spawn_threads(&self, socket: Arc<dyn DatagramSocket>) -> io::Result<()> {
        let mut threads = self.threads.lock();
        let shared = self.shared.clone();
        threads.push(
            thread::Builder::new()
                .name("tether-recv".into())
                .spawn(move || shared.receive_loop(socket))?,
        );
        let shared = self.shared.clone();
        threads.push(
            thread::Builder::new()
                .name("tether-update".into())
                .spawn(move || shared.update_loop())?,
        );
        Ok(())
    }

    /// Disconnect every peer, stop the threads and release the socket.
    pub fn stop(&self) {
        let shared = &self.shared;
        if !shared.running.load(Ordering::Acquire) {
            return;
        }
        shared.disconnect_all(&[]);
        shared.running.store(false, Ordering::Release);
        self.trigger_update();

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        for (_, peer) in shared.peers.write().drain() {
            peer.clear_channels();
        }
        shared.broker.clear();
        *shared.socket.write() = None;
        trace_info!("transport stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket()?.local_addr()?)
    }

    /// Start connecting to `remote`. Returns the existing record if one is
    /// already connected or connecting; a record in any other state is
    /// closed and replaced by a fresh attempt.
    pub fn connect(&self, remote: SocketAddr, data: &[u8]) -> Result<Arc<Peer>> {
        let shared = &self.shared;
        shared.socket()?;
        let max = shared.max_unconnected_payload(PacketKind::ConnectRequest);
        if data.len() > max {
            return Err(TetherError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }
        let now = Instant::now();
        let (peer, replaced) = {
            let mut peers = shared.peers.write();
            let replaced = match peers.get(&remote) {
                Some(existing)
                    if matches!(existing.state(), PeerState::Outgoing | PeerState::Connected) =>
                {
                    return Ok(existing.clone());
                }
                Some(old) => Some(old.clone()),
                None => None,
            };
            let number = replaced
                .as_ref()
                .map_or(0, |old| old.connection_number().wrapping_add(1));
            let peer = Arc::new(Peer::outgoing(
                shared.next_peer_id(),
                remote,
                number,
                data,
                &shared.env,
                now,
            ));
            peers.insert(remote, peer.clone());
            (peer, replaced)
        };
        if let Some(old) = replaced {
            trace_debug!(%remote, state = ?old.state(), "replacing record for new connect");
            // Shutting down or pending records close silently.
            old.force_close(DisconnectInfo::new(DisconnectReason::DisconnectPeerCalled), now);
            shared.broker.expire(&old);
        }
        trace_debug!(%remote, connection_id = peer.connection_id(), "connecting");
        self.trigger_update();
        Ok(peer)
    }

    pub fn peer(&self, remote: SocketAddr) -> Option<Arc<Peer>> {
        self.shared.peer(remote)
    }

    /// Every record, whatever its state.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.shared.peers.read().values().cloned().collect()
    }

    pub fn connected_peers_count(&self) -> usize {
        self.shared
            .peers
            .read()
            .values()
            .filter(|p| p.is_connected())
            .count()
    }

    /// Queue `data` to every connected peer.
    pub fn send_to_all(&self, data: &[u8], channel: u8, method: DeliveryMethod) -> Result<()> {
        for peer in self.peers() {
            if peer.is_connected() {
                peer.send(data, channel, method)?;
            }
        }
        Ok(())
    }

    /// Graceful disconnect with optional data for the remote side.
    pub fn disconnect_peer(&self, peer: &Arc<Peer>, data: &[u8]) {
        let out = peer.shutdown(data, Instant::now());
        self.shared.apply(peer, out);
    }

    pub fn disconnect_all(&self, data: &[u8]) {
        self.shared.disconnect_all(data);
    }

    /// Send a connectionless message.
    pub fn send_unconnected(&self, data: &[u8], remote: SocketAddr) -> Result<()> {
        let shared = &self.shared;
        if !shared.config.unconnected_messages {
            return Err(TetherError::Disabled("unconnected messages"));
        }
        shared.send_out_of_band(PacketKind::UnconnectedMessage, data, remote)
    }

    /// Send a connectionless message to every host on the local IPv4 network.
    pub fn send_broadcast(&self, data: &[u8], port: u16) -> Result<()> {
        let shared = &self.shared;
        if !shared.config.broadcast {
            return Err(TetherError::Disabled("broadcast"));
        }
        let remote = SocketAddr::new(Ipv4Addr::BROADCAST.into(), port);
        shared.send_out_of_band(PacketKind::Broadcast, data, remote)
    }

    /// Ask `relay` to introduce us to whoever else registers `token`.
    pub fn send_nat_introduce_request(&self, relay: SocketAddr, token: &str) -> Result<()> {
        let shared = &self.shared;
        if !shared.config.nat_punch {
            return Err(TetherError::Disabled("NAT punch"));
        }
        let internal = internal_endpoint(shared.socket()?.local_addr()?, relay);
        let payload = shared
            .nat
            .introduction_request(internal, token, Instant::now())?;
        shared.send_nat(relay, &payload);
        Ok(())
    }

    /// Introduce two peers directly, acting as the relay.
    pub fn nat_introduce(
        &self,
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) -> Result<()> {
        let shared = &self.shared;
        if !shared.config.nat_punch {
            return Err(TetherError::Disabled("NAT punch"));
        }
        shared.socket()?;
        for (to, payload) in NatPunchModule::introduce(
            host_internal,
            host_external,
            client_internal,
            client_external,
            token,
        )? {
            shared.send_nat(to, &payload);
        }
        Ok(())
    }

    /// Dispatch queued (synced) events to the listener on this thread.
    /// Returns how many were dispatched.
    pub fn poll_events(&self) -> usize {
        let shared = &self.shared;
        let events = shared.events.take();
        let count = events.len();
        for event in events {
            dispatch(event, shared.listener.as_ref(), &shared.env.pool);
        }
        count
    }

    /// Synced events waiting for [`poll_events`](Self::poll_events).
    pub fn pending_events(&self) -> usize {
        self.shared.events.len()
    }

    /// Wake the update thread now instead of at the next interval.
    pub fn trigger_update(&self) {
        let mut woken = self.shared.wake.lock();
        *woken = true;
        self.shared.wake_signal.notify_one();
    }

    /// Run one update tick on the calling thread.
    pub fn manual_update(&self) -> Result<()> {
        if !self.is_running() {
            return Err(TetherError::NotRunning);
        }
        self.shared.update(Instant::now());
        Ok(())
    }

    /// Receive and process every datagram waiting on the socket. Returns the
    /// number processed.
    pub fn manual_receive(&self) -> Result<usize> {
        let shared = &self.shared;
        if !self.is_running() {
            return Err(TetherError::NotRunning);
        }
        let socket = shared.socket()?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut count = 0;
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    shared.on_datagram(from, &mut buf[..len], Instant::now());
                    count += 1;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break
                }
                Err(err) => {
                    if shared.on_socket_error(None, err) != SocketErrorClass::Transient {
                        break;
                    }
                }
            }
        }
        Ok(count)
    }

    /// Connection requests still waiting for accept or reject.
    pub fn pending_requests(&self) -> usize {
        self.shared.broker.len()
    }

    /// Manager-wide traffic counters.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.env.pool.stats()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Local endpoint as the relay should see it from inside our network.
fn internal_endpoint(local: SocketAddr, relay: SocketAddr) -> SocketAddr {
    if !local.ip().is_unspecified() {
        return local;
    }
    let any = if relay.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let probe = UdpSocket::bind(any).and_then(|socket| {
        socket.connect(relay)?;
        socket.local_addr()
    });
    match probe {
        Ok(addr) => SocketAddr::new(addr.ip(), local.port()),
        Err(_) => local,
    }
}

impl Shared {
    fn socket(&self) -> Result<Arc<dyn DatagramSocket>> {
        self.socket.read().clone().ok_or(TetherError::NotRunning)
    }

    fn peer(&self, remote: SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().get(&remote).cloned()
    }

    fn next_peer_id(&self) -> u32 {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn max_unconnected_payload(&self, kind: PacketKind) -> usize {
        self.config
            .initial_mtu()
            .saturating_sub(self.env.overhead + kind.header_size())
    }

    fn receive_loop(&self, socket: Arc<dyn DatagramSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while self.running.load(Ordering::Acquire) {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => self.on_datagram(from, &mut buf[..len], Instant::now()),
                Err(err) => {
                    if self.on_socket_error(None, err) == SocketErrorClass::Fatal {
                        thread::sleep(RECEIVE_POLL_TIMEOUT);
                    }
                }
            }
        }
        trace_debug!("receive thread exiting");
    }

    fn update_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            self.update(Instant::now());
            let mut woken = self.wake.lock();
            if !*woken {
                self.wake_signal
                    .wait_for(&mut woken, self.config.update_interval);
            }
            *woken = false;
        }
        trace_debug!("update thread exiting");
    }

    fn update(&self, now: Instant) {
        if let Some(simulator) = &self.simulator {
            for (from, mut data) in simulator.release_due(now) {
                self.process_datagram(from, &mut data, now);
            }
        }

        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        let mut evicted = Vec::new();
        for peer in peers {
            let out = peer.update(now);
            if out.evict {
                evicted.push(peer.clone());
            }
            self.apply(&peer, out);
        }
        if !evicted.is_empty() {
            let mut peers = self.peers.write();
            for peer in &evicted {
                let remote = peer.remote();
                if peers.get(&remote).is_some_and(|p| Arc::ptr_eq(p, peer)) {
                    peers.remove(&remote);
                    trace_trace!(%remote, "peer evicted");
                }
            }
        }
        for peer in evicted {
            self.broker.expire(&peer);
            peer.clear_channels();
        }

        if self.config.nat_punch {
            self.nat.update(now);
        }
    }

    fn disconnect_all(&self, data: &[u8]) {
        let now = Instant::now();
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            let out = peer.shutdown(data, now);
            self.apply(&peer, out);
        }
    }

    /// Send what a peer operation produced, then emit its events.
    fn apply(&self, peer: &Arc<Peer>, out: PeerOutput) {
        for packet in out.outbound {
            self.send_to_peer(peer, packet);
        }
        for event in out.events {
            self.emit(event);
        }
    }

    fn emit(&self, event: TransportEvent) {
        match self.config.delivery(event.kind()) {
            EventDelivery::Synced => self.events.push(event),
            EventDelivery::Unsynced => dispatch(event, self.listener.as_ref(), &self.env.pool),
        }
    }

    fn send_to_peer(&self, peer: &Arc<Peer>, packet: Packet) {
        self.send_packet(peer.remote(), packet, peer.connection_number(), Some(peer));
    }

    /// Stamp the connection number, append the checksum, run the layer and
    /// send. The packet goes back to the pool either way.
    fn send_packet(&self, remote: SocketAddr, mut packet: Packet, connection_number: u8, peer: Option<&Arc<Peer>>) {
        let Some(socket) = self.socket.read().clone() else {
            self.env.pool.release(packet);
            return;
        };
        tether_shared::set_connection_number(packet.as_mut_slice(), connection_number);
        let result = SEND_BUFFER.with(|cell| {
            let mut buf = cell.borrow_mut();
            let extra = self.layer.as_ref().map_or(0, |l| l.extra_size());
            let needed = packet.size() + CHECKSUM_SIZE + extra;
            if buf.len() < needed {
                buf.resize(needed, 0);
            }
            let mut len = packet.size();
            buf[..len].copy_from_slice(packet.as_slice());
            if self.config.checksum {
                len = crc32::append(&mut buf, len);
            }
            if let Some(layer) = &self.layer {
                len = layer.process_outbound(&mut buf, len);
            }
            socket.send_to(&buf[..len], remote).map(|_| len)
        });
        self.env.pool.release(packet);
        match result {
            Ok(len) => {
                self.stats.record_sent(len);
                if let Some(peer) = peer {
                    peer.stats().record_sent(len);
                }
            }
            Err(err) => {
                self.on_socket_error(Some(remote), err);
            }
        }
    }

    fn send_out_of_band(&self, kind: PacketKind, data: &[u8], remote: SocketAddr) -> Result<()> {
        self.socket()?;
        let max = self.max_unconnected_payload(kind);
        if data.len() > max {
            return Err(TetherError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }
        let packet = packet::simple(&self.env.pool, kind, 0, data);
        self.send_packet(remote, packet, 0, None);
        Ok(())
    }

    fn send_nat(&self, to: SocketAddr, payload: &[u8]) {
        let packet = packet::simple(&self.env.pool, PacketKind::NatMessage, 0, payload);
        self.send_packet(to, packet, 0, None);
    }

    fn send_accept(&self, peer: &Arc<Peer>) {
        let accept = packet::connection(
            &self.env.pool,
            PacketKind::ConnectAccept,
            peer.connection_id(),
            0,
            &[],
        );
        self.send_to_peer(peer, accept);
    }

    fn on_socket_error(&self, remote: Option<SocketAddr>, error: io::Error) -> SocketErrorClass {
        let class = classify(&error);
        match class {
            SocketErrorClass::Transient => {
                trace_trace!(?remote, %error, "transient socket error");
            }
            SocketErrorClass::MessageTooLong => {
                trace_debug!(?remote, "datagram too large for path");
                if let Some(peer) = remote.and_then(|r| self.peer(r)) {
                    peer.mtu_exceeded();
                }
            }
            SocketErrorClass::HostUnreachable | SocketErrorClass::NetworkUnreachable => {
                trace_warn!(?remote, %error, "destination unreachable");
                if self.config.disconnect_on_unreachable {
                    if let Some(peer) = remote.and_then(|r| self.peer(r)) {
                        let reason = if class == SocketErrorClass::HostUnreachable {
                            DisconnectReason::HostUnreachable
                        } else {
                            DisconnectReason::NetworkUnreachable
                        };
                        let info = DisconnectInfo::new(reason).with_socket_error(error.kind());
                        if let Some(event) = peer.force_close(info, Instant::now()) {
                            self.emit(event);
                        }
                    }
                }
                self.emit(TransportEvent::NetworkError { remote, error });
            }
            SocketErrorClass::Fatal => {
                trace_error!(?remote, %error, "socket error");
                self.emit(TransportEvent::NetworkError { remote, error });
            }
        }
        class
    }

    fn on_datagram(&self, from: SocketAddr, data: &mut [u8], now: Instant) {
        if let Some(simulator) = &self.simulator {
            match simulator.intercept(from, data, now) {
                Verdict::Deliver => {}
                Verdict::Drop => {
                    self.stats.record_dropped();
                    return;
                }
                Verdict::Delay => return,
            }
        }
        self.process_datagram(from, data, now);
    }

    fn process_datagram(&self, from: SocketAddr, buf: &mut [u8], now: Instant) {
        self.stats.record_received(buf.len());
        let mut len = buf.len();
        if let Some(layer) = &self.layer {
            match layer.process_inbound(buf, len) {
                Some(inner) => len = inner,
                None => {
                    trace_trace!(%from, "layer rejected datagram");
                    self.stats.record_dropped();
                    return;
                }
            }
        }
        if self.config.checksum {
            match crc32::verify(&buf[..len]) {
                Ok(body) => len = body,
                Err(err) => {
                    trace_trace!(%from, %err, "checksum failed");
                    self.stats.record_dropped();
                    return;
                }
            }
        }
        let data = &buf[..len];
        let header = match PacketHeader::decode(data) {
            Ok(header) => header,
            Err(err) => {
                trace_trace!(%from, %err, "malformed datagram");
                self.stats.record_dropped();
                return;
            }
        };

        match header.kind {
            PacketKind::UnconnectedMessage | PacketKind::Broadcast => {
                self.on_unconnected(from, &header, data)
            }
            PacketKind::NatMessage => self.on_nat(from, data, now),
            PacketKind::ConnectRequest => self.on_connect_request(from, &header, data, now),
            _ => self.on_peer_packet(from, &header, data, now),
        }
    }

    fn on_unconnected(&self, from: SocketAddr, header: &PacketHeader, data: &[u8]) {
        let kind = match header.kind {
            PacketKind::Broadcast if self.config.broadcast => UnconnectedKind::Broadcast,
            PacketKind::UnconnectedMessage if self.config.unconnected_messages => {
                UnconnectedKind::Unconnected
            }
            _ => {
                trace_trace!(%from, kind = ?header.kind, "out-of-band message disabled");
                return;
            }
        };
        let packet = packet::from_datagram(&self.env.pool, data, header.header_len());
        self.emit(TransportEvent::ReceivedUnconnected {
            remote: from,
            packet,
            kind,
        });
    }

    fn on_nat(&self, from: SocketAddr, data: &[u8], now: Instant) {
        if !self.config.nat_punch {
            return;
        }
        let out = self.nat.process(from, &data[1..], now);
        for (to, payload) in out.sends {
            self.send_nat(to, &payload);
        }
        if let Some(success) = out.success {
            self.emit(TransportEvent::NatIntroductionSuccess {
                endpoint: success.endpoint,
                address_type: success.address_type,
                token: success.token,
            });
        }
    }

    fn on_connect_request(&self, from: SocketAddr, header: &PacketHeader, data: &[u8], now: Instant) {
        let Some((protocol_id, remote_id, payload)) = parse_connect_request(data) else {
            return;
        };
        if protocol_id != self.config.protocol_id {
            trace_debug!(%from, protocol_id, "connect request for another protocol");
            let reply = packet::simple(&self.env.pool, PacketKind::InvalidProtocol, 0, &[]);
            self.send_packet(from, reply, header.connection_number, None);
            return;
        }

        let existing = self.peer(from);
        let verdict = classify_request(
            existing.as_ref().map(|p| (p.state(), p.connection_id())),
            remote_id,
            self.config.p2p_tie_break,
        );
        trace_trace!(%from, remote_id, ?verdict, "connect request");
        match (verdict, existing) {
            (RequestVerdict::New, _) => {
                self.new_request(from, remote_id, header.connection_number, payload, now)
            }
            (RequestVerdict::Duplicate, Some(peer)) => {
                if peer.state() == PeerState::Connected {
                    self.send_accept(&peer);
                }
            }
            (RequestVerdict::Reconnect, Some(old)) => {
                trace_debug!(%from, "reconnect replaces existing connection");
                let number = old.connection_number().wrapping_add(1);
                if let Some(event) = old.force_close(DisconnectInfo::new(DisconnectReason::Reconnect), now) {
                    self.emit(event);
                }
                self.broker.expire(&old);
                self.new_request(from, remote_id, number, payload, now);
            }
            (RequestVerdict::LocalLoses, Some(old)) => {
                trace_debug!(%from, "symmetric connect lost, taking inbound request");
                if let Some(event) =
                    old.force_close(DisconnectInfo::new(DisconnectReason::PeerToPeerConnection), now)
                {
                    self.emit(event);
                }
                self.new_request(from, remote_id, header.connection_number, payload, now);
            }
            _ => {}
        }
    }

    fn new_request(&self, from: SocketAddr, remote_id: u64, number: u8, data: &[u8], now: Instant) {
        let peer = Arc::new(Peer::incoming(
            self.next_peer_id(),
            from,
            remote_id,
            number,
            &self.env,
            now,
        ));
        self.peers.write().insert(from, peer.clone());
        let resolver: Weak<dyn RequestResolver> = self.weak.clone();
        let request = Arc::new(ConnectionRequest::new(peer, data, resolver));
        self.broker.register(request.clone());
        self.emit(TransportEvent::ConnectionRequest { request });
    }

    fn on_peer_packet(&self, from: SocketAddr, header: &PacketHeader, data: &[u8], now: Instant) {
        let Some(peer) = self.peer(from) else {
            trace_trace!(%from, kind = ?header.kind, "packet from unknown endpoint");
            return;
        };
        let epoch_free = matches!(
            header.kind,
            PacketKind::ConnectAccept | PacketKind::ConnectReject | PacketKind::Disconnect
        );
        if !epoch_free && header.connection_number != peer.connection_number() {
            trace_trace!(%from, number = header.connection_number, "packet from old connection");
            self.stats.record_dropped();
            return;
        }
        let out = peer.process_packet(header, data, now);
        self.apply(&peer, out);
    }
}

impl RequestResolver for Shared {
    fn accept_request(&self, request: &ConnectionRequest) -> Option<Arc<Peer>> {
        self.broker.complete(request);
        let peer = request.peer().clone();
        if !peer.accept(Instant::now()) {
            return None;
        }
        trace_debug!(remote = %peer.remote(), "connection accepted");
        self.send_accept(&peer);
        self.emit(TransportEvent::Connected { peer: peer.clone() });
        Some(peer)
    }

    fn reject_request(&self, request: &ConnectionRequest, data: &[u8]) {
        self.broker.complete(request);
        let peer = request.peer();
        trace_debug!(remote = %peer.remote(), "connection rejected");
        let reject = packet::connection(
            &self.env.pool,
            PacketKind::ConnectReject,
            peer.connection_id(),
            0,
            data,
        );
        self.send_to_peer(peer, reject);
        peer.force_close(DisconnectInfo::new(DisconnectReason::ConnectionRejected), Instant::now());
        let remote = peer.remote();
        let mut peers = self.peers.write();
        if peers.get(&remote).is_some_and(|p| Arc::ptr_eq(p, peer)) {
            peers.remove(&remote);
        }
    }
}
