//! Connection records.
//!
//! A [`Peer`] aggregates one remote endpoint's channels, fragment assembler,
//! RTT estimate, MTU and lifecycle state:
//!
//! ```text
//! Outgoing ──accept──► Connected ──disconnect / timeout──► Disconnected ──linger──► evicted
//! IncomingPending ──accept──► Connected
//! Connected ──local disconnect──► ShutdownRequested ──ShutdownOk / timeout──► Disconnected
//! ```
//!
//! Peer operations never send. They return a [`PeerOutput`] and the manager
//! puts its packets on the wire after every lock here is released. Packets
//! are built with connection number 0; the manager stamps the current number
//! at send time.

use crate::channel::{
    channel_id, split_channel_id, ChannelContext, DeliveryChannel, DeliveryMethod,
    ReliableChannel, SequencedChannel, UnreliableChannel,
};
use crate::config::{MtuMode, TransportConfig, MTU_CANDIDATES};
use crate::event::{DisconnectInfo, DisconnectReason, TransportEvent};
use crate::fragment::{self, FragmentAssembler};
use crate::handshake::parse_connection_id;
use crate::packet::{self, Packet};
use crate::pool::PacketPool;
use crate::stats::{NetStatistics, StatisticsSnapshot};
use crate::{Result, TetherError};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tether_shared::sequence::next_sequence;
use tether_shared::{FragmentHeader, PacketHeader, PacketKind, FRAGMENT_HEADER_SIZE};

/// Interval between MTU probes.
const MTU_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Probes per candidate size before discovery stops.
const MTU_PROBE_ATTEMPTS: u32 = 4;

static LAST_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Connection id for a new outgoing attempt: wall-clock microseconds, strictly
/// increasing within the process.
pub(crate) fn next_connection_id() -> u64 {
    let now = unix_micros();
    let mut last = LAST_CONNECTION_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_CONNECTION_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Connect request sent, waiting for an answer.
    Outgoing,
    /// Connect request received, waiting for the application.
    IncomingPending,
    Connected,
    /// Local disconnect sent, waiting for `ShutdownOk`.
    ShutdownRequested,
    Disconnected,
}

/// Manager-wide inputs every peer shares.
#[derive(Clone)]
pub(crate) struct PeerEnv {
    pub config: Arc<TransportConfig>,
    pub pool: Arc<PacketPool>,
    /// Bytes per datagram taken by checksum and packet layer.
    pub overhead: usize,
}

impl PeerEnv {
    pub fn new(config: Arc<TransportConfig>, pool: Arc<PacketPool>, overhead: usize) -> Self {
        Self {
            config,
            pool,
            overhead,
        }
    }
}

/// What a peer operation wants done.
#[derive(Debug, Default)]
pub(crate) struct PeerOutput {
    pub outbound: Vec<Packet>,
    pub events: Vec<TransportEvent>,
    /// Remove the record from the peer set.
    pub evict: bool,
}

#[derive(Debug)]
struct MtuDiscovery {
    /// Index into `MTU_CANDIDATES` of the size being probed.
    next: usize,
    attempts: u32,
    last_probe: Option<Instant>,
}

#[derive(Debug)]
struct PeerControl {
    state: PeerState,
    /// Entry into `ShutdownRequested` or `Disconnected`.
    state_since: Instant,
    last_received: Instant,
    /// Last `ConnectRequest` or `Disconnect` send.
    last_control_sent: Option<Instant>,
    connect_attempts: u32,
    connect_data: Vec<u8>,
    disconnect_data: Vec<u8>,
    ping_sequence: u16,
    ping_sent_at: Option<Instant>,
    last_ping: Instant,
    rtt_us: Option<u64>,
    mtu: usize,
    mtu_discovery: Option<MtuDiscovery>,
}

impl PeerControl {
    fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_us.unwrap_or(0))
    }

    fn update_rtt(&mut self, sample: Duration) {
        let sample_us = sample.as_micros() as u64;
        // EWMA: rtt = 0.875 * rtt + 0.125 * sample
        self.rtt_us = Some(match self.rtt_us {
            Some(rtt_us) => (rtt_us * 7 + sample_us) / 8,
            None => sample_us,
        });
    }

    fn enter(&mut self, state: PeerState, now: Instant) {
        self.state = state;
        self.state_since = now;
    }
}

/// One remote endpoint.
pub struct Peer {
    id: u32,
    remote: SocketAddr,
    connection_id: u64,
    connection_number: AtomicU8,
    env: PeerEnv,
    control: Mutex<PeerControl>,
    unreliable: Mutex<UnreliableChannel>,
    channels: Box<[Mutex<Box<dyn DeliveryChannel>>]>,
    fragments: Mutex<FragmentAssembler>,
    next_fragment_id: AtomicU16,
    stats: NetStatistics,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

fn build_channel(id: u8, window: u16) -> Box<dyn DeliveryChannel> {
    match split_channel_id(id).1 {
        DeliveryMethod::ReliableOrdered => Box::new(ReliableChannel::new(id, true, window)),
        DeliveryMethod::ReliableUnordered => Box::new(ReliableChannel::new(id, false, window)),
        _ => Box::new(SequencedChannel::new(id)),
    }
}

impl Peer {
    fn new(
        id: u32,
        remote: SocketAddr,
        connection_id: u64,
        connection_number: u8,
        state: PeerState,
        env: &PeerEnv,
        now: Instant,
    ) -> Self {
        let config = &env.config;
        let lanes = config.channels as usize * DeliveryMethod::CHANNELED.len();
        let channels = (0..lanes)
            .map(|id| Mutex::new(build_channel(id as u8, config.window_size)))
            .collect();
        let mtu = config.initial_mtu();
        let mtu_discovery = match config.mtu {
            MtuMode::Discover => Some(MtuDiscovery {
                next: MTU_CANDIDATES.iter().position(|&c| c > mtu).unwrap_or(MTU_CANDIDATES.len()),
                attempts: 0,
                last_probe: None,
            }),
            MtuMode::Fixed(_) => None,
        };
        Self {
            id,
            remote,
            connection_id,
            connection_number: AtomicU8::new(connection_number % tether_shared::CONNECTION_NUMBER_MODULUS),
            env: env.clone(),
            control: Mutex::new(PeerControl {
                state,
                state_since: now,
                last_received: now,
                last_control_sent: None,
                connect_attempts: 0,
                connect_data: Vec::new(),
                disconnect_data: Vec::new(),
                ping_sequence: 0,
                ping_sent_at: None,
                last_ping: now,
                rtt_us: None,
                mtu,
                mtu_discovery,
            }),
            unreliable: Mutex::new(UnreliableChannel::new()),
            channels,
            fragments: Mutex::new(FragmentAssembler::new(config.max_fragments)),
            next_fragment_id: AtomicU16::new(0),
            stats: NetStatistics::default(),
        }
    }

    /// Record for a local connect attempt. `connection_number` is a guess the
    /// responder may override in its accept.
    pub(crate) fn outgoing(
        id: u32,
        remote: SocketAddr,
        connection_number: u8,
        data: &[u8],
        env: &PeerEnv,
        now: Instant,
    ) -> Self {
        let peer = Self::new(
            id,
            remote,
            next_connection_id(),
            connection_number,
            PeerState::Outgoing,
            env,
            now,
        );
        peer.control.lock().connect_data = data.to_vec();
        peer
    }

    /// Record for an inbound request awaiting a decision.
    pub(crate) fn incoming(
        id: u32,
        remote: SocketAddr,
        connection_id: u64,
        connection_number: u8,
        env: &PeerEnv,
        now: Instant,
    ) -> Self {
        Self::new(
            id,
            remote,
            connection_id,
            connection_number,
            PeerState::IncomingPending,
            env,
            now,
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Connection epoch, modulo 4.
    pub fn connection_number(&self) -> u8 {
        self.connection_number.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PeerState {
        self.control.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Smoothed round-trip time; zero until the first pong.
    pub fn rtt(&self) -> Duration {
        self.control.lock().rtt()
    }

    /// Current datagram size limit.
    pub fn mtu(&self) -> usize {
        self.control.lock().mtu
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats(&self) -> &NetStatistics {
        &self.stats
    }

    /// Packets queued or in flight across every channel.
    pub fn pending_packets(&self) -> usize {
        self.unreliable.lock().pending()
            + self
                .channels
                .iter()
                .map(|lane| lane.lock().pending())
                .sum::<usize>()
    }

    /// Queue `data` for sending. Reliable messages above one datagram are
    /// fragmented; unreliable and sequenced ones must fit.
    ///
    /// Nothing goes on the wire until the next update tick.
    pub fn send(&self, data: &[u8], channel: u8, method: DeliveryMethod) -> Result<()> {
        let config = &self.env.config;
        if channel >= config.channels {
            return Err(TetherError::InvalidChannel {
                number: channel,
                max: config.channels,
            });
        }
        let mtu = {
            let control = self.control.lock();
            if control.state != PeerState::Connected {
                return Err(TetherError::NotConnected);
            }
            control.mtu
        };
        let room = mtu.saturating_sub(self.env.overhead);
        let pool = &self.env.pool;

        let Some(id) = channel_id(channel, method) else {
            let max = room.saturating_sub(PacketKind::Unreliable.header_size());
            if data.len() > max {
                return Err(TetherError::PayloadTooLarge {
                    size: data.len(),
                    max,
                });
            }
            let packet = packet::simple(pool, PacketKind::Unreliable, 0, data);
            self.unreliable.lock().enqueue(packet);
            return Ok(());
        };

        let max = room.saturating_sub(PacketKind::Channeled.header_size());
        if data.len() <= max {
            let packet = packet::with_payload(pool, PacketHeader::channeled(0, id), data);
            self.channels[id as usize].lock().enqueue(packet);
            return Ok(());
        }
        if !method.is_reliable() {
            return Err(TetherError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }

        let per_fragment = max.saturating_sub(FRAGMENT_HEADER_SIZE).max(1);
        let count = fragment::plan(data.len(), per_fragment, config.max_fragments)?;
        let fragment_id = self.next_fragment_id.fetch_add(1, Ordering::Relaxed);
        trace_trace!(peer = self.id, fragment_id, count, "fragmenting message");
        let mut lane = self.channels[id as usize].lock();
        for (index, chunk) in data.chunks(per_fragment).enumerate() {
            let descriptor = FragmentHeader::new(fragment_id, index as u16, count);
            lane.enqueue(packet::fragment(pool, id, 0, descriptor, chunk));
        }
        Ok(())
    }

    /// Timers: connect retries, keepalive, MTU probes, retransmission and
    /// expiry.
    pub(crate) fn update(self: &Arc<Self>, now: Instant) -> PeerOutput {
        let mut out = PeerOutput::default();
        let config = &self.env.config;
        let pool = &self.env.pool;
        let mut control = self.control.lock();
        let silent = now.saturating_duration_since(control.last_received);
        let in_state = now.saturating_duration_since(control.state_since);

        match control.state {
            PeerState::Outgoing => {
                let due = control
                    .last_control_sent
                    .map_or(true, |at| now.saturating_duration_since(at) >= config.reconnect_delay);
                if !due {
                    return out;
                }
                if control.connect_attempts >= config.max_connect_attempts {
                    trace_debug!(remote = %self.remote, "connect attempts exhausted");
                    control.enter(PeerState::Disconnected, now);
                    drop(control);
                    self.clear_channels();
                    out.events
                        .push(self.disconnected(DisconnectInfo::new(DisconnectReason::ConnectionFailed)));
                    return out;
                }
                control.connect_attempts += 1;
                control.last_control_sent = Some(now);
                out.outbound.push(packet::connect_request(
                    pool,
                    config.protocol_id,
                    self.connection_id,
                    0,
                    &control.connect_data,
                ));
            }
            PeerState::IncomingPending => {
                if silent >= config.disconnect_timeout {
                    out.evict = true;
                }
            }
            PeerState::Connected => {
                if silent >= config.disconnect_timeout {
                    trace_debug!(remote = %self.remote, "peer timed out");
                    control.enter(PeerState::Disconnected, now);
                    drop(control);
                    self.clear_channels();
                    out.events
                        .push(self.disconnected(DisconnectInfo::new(DisconnectReason::Timeout)));
                    return out;
                }
                if now.saturating_duration_since(control.last_ping) >= config.ping_interval {
                    control.last_ping = now;
                    control.ping_sequence = next_sequence(control.ping_sequence);
                    control.ping_sent_at = Some(now);
                    out.outbound.push(packet::ping(pool, control.ping_sequence, 0));
                }
                self.probe_mtu(&mut control, now, &mut out);
                let resend_delay = config.resend_delay(control.rtt());
                drop(control);
                self.tick_channels(now, resend_delay, &mut out);
            }
            PeerState::ShutdownRequested => {
                if in_state >= config.disconnect_timeout {
                    control.enter(PeerState::Disconnected, now);
                    return out;
                }
                let due = control
                    .last_control_sent
                    .map_or(true, |at| now.saturating_duration_since(at) >= config.reconnect_delay);
                if due {
                    control.last_control_sent = Some(now);
                    out.outbound.push(packet::connection(
                        pool,
                        PacketKind::Disconnect,
                        self.connection_id,
                        0,
                        &control.disconnect_data,
                    ));
                }
            }
            PeerState::Disconnected => {
                if in_state >= config.disconnect_timeout {
                    out.evict = true;
                }
            }
        }
        out
    }

    fn probe_mtu(&self, control: &mut PeerControl, now: Instant, out: &mut PeerOutput) {
        let Some(discovery) = control.mtu_discovery.as_mut() else {
            return;
        };
        if discovery
            .last_probe
            .is_some_and(|at| now.saturating_duration_since(at) < MTU_PROBE_INTERVAL)
        {
            return;
        }
        let candidate = match MTU_CANDIDATES.get(discovery.next) {
            Some(&candidate) if discovery.attempts < MTU_PROBE_ATTEMPTS => candidate,
            _ => {
                trace_debug!(remote = %self.remote, mtu = control.mtu, "mtu discovery finished");
                control.mtu_discovery = None;
                return;
            }
        };
        discovery.attempts += 1;
        discovery.last_probe = Some(now);
        let size = candidate.saturating_sub(self.env.overhead) as u16;
        out.outbound
            .push(packet::mtu(&self.env.pool, PacketKind::MtuCheck, size, 0));
    }

    fn tick_channels(&self, now: Instant, resend_delay: Duration, out: &mut PeerOutput) {
        let mut ctx = ChannelContext::new(now, resend_delay, &self.env.pool);
        self.unreliable.lock().tick(&mut ctx);
        for lane in self.channels.iter() {
            lane.lock().tick(&mut ctx);
        }
        self.stats.record_resent(ctx.resent);
        out.outbound.append(&mut ctx.outbound);
        ctx.recycle();
    }

    /// Handle a decoded datagram addressed to this peer. `datagram` is the
    /// whole datagram without checksum or layer bytes.
    pub(crate) fn process_packet(
        self: &Arc<Self>,
        header: &PacketHeader,
        datagram: &[u8],
        now: Instant,
    ) -> PeerOutput {
        let mut out = PeerOutput::default();
        let pool = &self.env.pool;
        self.stats.record_received(datagram.len());
        let (state, resend_delay) = {
            let mut control = self.control.lock();
            control.last_received = now;
            (control.state, self.env.config.resend_delay(control.rtt()))
        };

        match header.kind {
            PacketKind::ConnectAccept => self.on_accept(header, datagram, now, &mut out),
            PacketKind::ConnectReject => {
                if let Some((id, data)) = parse_connection_id(datagram) {
                    if id == self.connection_id && self.leave(PeerState::Outgoing, now) {
                        trace_debug!(remote = %self.remote, "connection rejected");
                        out.events.push(self.disconnected(
                            DisconnectInfo::new(DisconnectReason::ConnectionRejected).with_data(data),
                        ));
                    }
                }
            }
            PacketKind::InvalidProtocol => {
                if self.leave(PeerState::Outgoing, now) {
                    trace_debug!(remote = %self.remote, "remote runs another protocol");
                    out.events
                        .push(self.disconnected(DisconnectInfo::new(DisconnectReason::InvalidProtocol)));
                }
            }
            PacketKind::Disconnect => self.on_disconnect(datagram, now, &mut out),
            PacketKind::ShutdownOk => {
                self.leave(PeerState::ShutdownRequested, now);
            }
            _ if state != PeerState::Connected => {
                trace_trace!(remote = %self.remote, kind = ?header.kind, ?state, "packet for unconnected peer");
            }
            PacketKind::Unreliable => {
                let packet = packet::from_datagram(pool, datagram, header.header_len());
                let mut ctx = ChannelContext::new(now, resend_delay, pool);
                self.unreliable.lock().on_packet(packet, &mut ctx);
                for packet in std::mem::take(&mut ctx.delivered) {
                    out.events.push(TransportEvent::Received {
                        peer: self.clone(),
                        packet,
                        channel: 0,
                        method: DeliveryMethod::Unreliable,
                    });
                }
                ctx.recycle();
            }
            PacketKind::Channeled | PacketKind::Ack => {
                self.on_channel_packet(header, datagram, now, resend_delay, &mut out)
            }
            PacketKind::Ping => {
                out.outbound
                    .push(packet::pong(pool, header.sequence, unix_micros(), 0));
            }
            PacketKind::Pong => {
                let latency = {
                    let mut control = self.control.lock();
                    let sent_at = if header.sequence == control.ping_sequence {
                        control.ping_sent_at.take()
                    } else {
                        None
                    };
                    sent_at.map(|at| {
                        control.update_rtt(now.saturating_duration_since(at));
                        control.rtt()
                    })
                };
                if let Some(latency) = latency {
                    out.events.push(TransportEvent::LatencyUpdated {
                        peer: self.clone(),
                        latency,
                    });
                }
            }
            PacketKind::MtuCheck => {
                let declared = u16::from_le_bytes([datagram[1], datagram[2]]);
                if datagram.len() == declared as usize {
                    out.outbound
                        .push(packet::mtu(pool, PacketKind::MtuOk, declared, 0));
                } else {
                    trace_trace!(remote = %self.remote, declared, actual = datagram.len(), "truncated mtu probe");
                }
            }
            PacketKind::MtuOk => {
                let size = u16::from_le_bytes([datagram[1], datagram[2]]) as usize;
                self.on_mtu_ok(size);
            }
            _ => {
                trace_trace!(remote = %self.remote, kind = ?header.kind, "unexpected packet kind for peer");
            }
        }
        out
    }

    fn on_accept(self: &Arc<Self>, header: &PacketHeader, datagram: &[u8], now: Instant, out: &mut PeerOutput) {
        let Some((id, _)) = parse_connection_id(datagram) else {
            return;
        };
        if id != self.connection_id {
            trace_trace!(remote = %self.remote, id, "accept for another connection");
            return;
        }
        let mut control = self.control.lock();
        if control.state != PeerState::Outgoing {
            return;
        }
        control.enter(PeerState::Connected, now);
        control.last_ping = now;
        self.connection_number
            .store(header.connection_number, Ordering::Release);
        drop(control);
        trace_debug!(remote = %self.remote, number = header.connection_number, "connected");
        out.events.push(TransportEvent::Connected { peer: self.clone() });
    }

    fn on_disconnect(self: &Arc<Self>, datagram: &[u8], now: Instant, out: &mut PeerOutput) {
        let Some((id, data)) = parse_connection_id(datagram) else {
            return;
        };
        if id != self.connection_id {
            trace_trace!(remote = %self.remote, id, "disconnect for another connection");
            return;
        }
        out.outbound
            .push(packet::simple(&self.env.pool, PacketKind::ShutdownOk, 0, &[]));
        let previous = {
            let mut control = self.control.lock();
            let previous = control.state;
            if previous != PeerState::Disconnected {
                control.enter(PeerState::Disconnected, now);
            }
            previous
        };
        if previous == PeerState::Disconnected {
            return;
        }
        self.clear_channels();
        if previous == PeerState::Connected {
            trace_debug!(remote = %self.remote, "remote closed connection");
            out.events.push(self.disconnected(
                DisconnectInfo::new(DisconnectReason::RemoteConnectionClose).with_data(data),
            ));
        }
    }

    fn on_channel_packet(
        self: &Arc<Self>,
        header: &PacketHeader,
        datagram: &[u8],
        now: Instant,
        resend_delay: Duration,
        out: &mut PeerOutput,
    ) {
        let pool = &self.env.pool;
        let Some(lane) = self.channels.get(header.channel_id as usize) else {
            trace_trace!(remote = %self.remote, channel = header.channel_id, "unknown channel");
            return;
        };
        let packet = packet::from_datagram(pool, datagram, header.header_len());
        let mut ctx = ChannelContext::new(now, resend_delay, pool);
        {
            let mut lane = lane.lock();
            if header.kind == PacketKind::Ack {
                lane.on_ack(packet, &mut ctx);
            } else {
                lane.on_packet(packet, &mut ctx);
            }
        }
        let delivered = std::mem::take(&mut ctx.delivered);
        out.outbound.append(&mut ctx.outbound);
        ctx.recycle();

        let (channel, method) = split_channel_id(header.channel_id);
        for packet in delivered {
            let packet = if packet.is_fragmented() {
                match self.fragments.lock().add(packet, pool) {
                    Some((message, _)) => message,
                    None => continue,
                }
            } else {
                packet
            };
            out.events.push(TransportEvent::Received {
                peer: self.clone(),
                packet,
                channel,
                method,
            });
        }
    }

    fn on_mtu_ok(&self, size: usize) {
        let mut control = self.control.lock();
        let overhead = self.env.overhead;
        let confirmed = control.mtu_discovery.as_ref().and_then(|d| {
            MTU_CANDIDATES
                .get(d.next)
                .copied()
                .filter(|&candidate| candidate.saturating_sub(overhead) == size)
        });
        let Some(candidate) = confirmed else {
            return;
        };
        control.mtu = candidate;
        if let Some(discovery) = control.mtu_discovery.as_mut() {
            discovery.next += 1;
            discovery.attempts = 0;
            discovery.last_probe = None;
        }
        trace_debug!(remote = %self.remote, mtu = candidate, "mtu confirmed");
    }

    /// A send failed as too large: fall back to the last confirmed size and
    /// stop probing.
    pub(crate) fn mtu_exceeded(&self) {
        let mut control = self.control.lock();
        if control.mtu_discovery.take().is_some() {
            trace_debug!(remote = %self.remote, mtu = control.mtu, "mtu probe too large, discovery stopped");
        }
    }

    /// IncomingPending → Connected. `false` if no longer pending.
    pub(crate) fn accept(&self, now: Instant) -> bool {
        let mut control = self.control.lock();
        if control.state != PeerState::IncomingPending {
            return false;
        }
        control.enter(PeerState::Connected, now);
        control.last_received = now;
        control.last_ping = now;
        true
    }

    /// Local disconnect. Connected peers go through `ShutdownRequested`;
    /// the event fires immediately either way.
    pub(crate) fn shutdown(self: &Arc<Self>, data: &[u8], now: Instant) -> PeerOutput {
        let mut out = PeerOutput::default();
        let mut control = self.control.lock();
        let previous = control.state;
        match previous {
            PeerState::Connected => {
                control.enter(PeerState::ShutdownRequested, now);
                control.last_control_sent = Some(now);
                control.disconnect_data = data.to_vec();
            }
            PeerState::Outgoing | PeerState::IncomingPending => {
                control.enter(PeerState::Disconnected, now)
            }
            PeerState::ShutdownRequested | PeerState::Disconnected => return out,
        }
        drop(control);
        self.clear_channels();
        if previous != PeerState::IncomingPending {
            out.outbound.push(packet::connection(
                &self.env.pool,
                PacketKind::Disconnect,
                self.connection_id,
                0,
                data,
            ));
            out.events.push(
                self.disconnected(DisconnectInfo::new(DisconnectReason::DisconnectPeerCalled)),
            );
        }
        out
    }

    /// Drop the connection without a handshake. Produces an event only if the
    /// application knew the peer as connected or connecting.
    pub(crate) fn force_close(self: &Arc<Self>, info: DisconnectInfo, now: Instant) -> Option<TransportEvent> {
        let previous = {
            let mut control = self.control.lock();
            let previous = control.state;
            if previous == PeerState::Disconnected {
                return None;
            }
            control.enter(PeerState::Disconnected, now);
            previous
        };
        self.clear_channels();
        matches!(previous, PeerState::Connected | PeerState::Outgoing).then(|| self.disconnected(info))
    }

    /// Move from `from` to `Disconnected`. `false` if not in `from`.
    fn leave(&self, from: PeerState, now: Instant) -> bool {
        {
            let mut control = self.control.lock();
            if control.state != from {
                return false;
            }
            control.enter(PeerState::Disconnected, now);
        }
        self.clear_channels();
        true
    }

    fn disconnected(self: &Arc<Self>, info: DisconnectInfo) -> TransportEvent {
        TransportEvent::Disconnected {
            peer: self.clone(),
            info,
        }
    }

    /// Release everything queued, in flight or half assembled.
    pub(crate) fn clear_channels(&self) {
        let pool = &self.env.pool;
        self.unreliable.lock().drain(pool);
        for lane in self.channels.iter() {
            lane.lock().drain(pool);
        }
        self.fragments.lock().clear(pool);
    }
}
