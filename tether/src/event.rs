//! Events and their delivery.
//!
//! Every network-side occurrence becomes a [`TransportEvent`] value. Its
//! [`EventKind`] selects the delivery mode at production time: `Synced` events
//! are queued until [`TransportManager::poll_events`](crate::TransportManager::poll_events),
//! `Unsynced` events invoke the [`EventListener`] on the producing thread.
//! The two streams are not ordered relative to each other.

use crate::channel::DeliveryMethod;
use crate::handshake::ConnectionRequest;
use crate::nat::NatAddressType;
use crate::packet::Packet;
use crate::peer::Peer;
use crate::pool::PacketPool;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Why a peer was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Connect attempts exhausted without an answer.
    ConnectionFailed,
    /// No packets for the disconnect timeout.
    Timeout,
    HostUnreachable,
    NetworkUnreachable,
    /// The remote side disconnected.
    RemoteConnectionClose,
    /// Disconnected locally.
    DisconnectPeerCalled,
    /// The remote side rejected the connect request.
    ConnectionRejected,
    /// The remote side runs another protocol id.
    InvalidProtocol,
    /// Replaced by a newer connection from the same endpoint.
    Reconnect,
    /// Lost a symmetric connection race; the inbound connection wins.
    PeerToPeerConnection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
    /// Data attached by the remote side (reject or disconnect payload).
    pub data: Vec<u8>,
    pub socket_error: Option<io::ErrorKind>,
}

impl DisconnectInfo {
    pub fn new(reason: DisconnectReason) -> Self {
        Self {
            reason,
            data: Vec::new(),
            socket_error: None,
        }
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn with_socket_error(mut self, kind: io::ErrorKind) -> Self {
        self.socket_error = Some(kind);
        self
    }
}

/// How an out-of-band message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconnectedKind {
    Unconnected,
    Broadcast,
}

/// Event classes, used to pick a delivery mode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect = 0,
    Disconnect = 1,
    Receive = 2,
    ReceiveUnconnected = 3,
    Error = 4,
    LatencyUpdate = 5,
    ConnectionRequest = 6,
    NatIntroductionSuccess = 7,
}

impl EventKind {
    pub const COUNT: usize = 8;
}

/// Queue until polled, or dispatch immediately on the network thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventDelivery {
    #[default]
    Synced,
    Unsynced,
}

#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        peer: Arc<Peer>,
    },
    Disconnected {
        peer: Arc<Peer>,
        info: DisconnectInfo,
    },
    Received {
        peer: Arc<Peer>,
        packet: Packet,
        channel: u8,
        method: DeliveryMethod,
    },
    ReceivedUnconnected {
        remote: SocketAddr,
        packet: Packet,
        kind: UnconnectedKind,
    },
    NetworkError {
        remote: Option<SocketAddr>,
        error: io::Error,
    },
    LatencyUpdated {
        peer: Arc<Peer>,
        latency: Duration,
    },
    ConnectionRequest {
        request: Arc<ConnectionRequest>,
    },
    NatIntroductionSuccess {
        endpoint: SocketAddr,
        address_type: NatAddressType,
        token: String,
    },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connect,
            Self::Disconnected { .. } => EventKind::Disconnect,
            Self::Received { .. } => EventKind::Receive,
            Self::ReceivedUnconnected { .. } => EventKind::ReceiveUnconnected,
            Self::NetworkError { .. } => EventKind::Error,
            Self::LatencyUpdated { .. } => EventKind::LatencyUpdate,
            Self::ConnectionRequest { .. } => EventKind::ConnectionRequest,
            Self::NatIntroductionSuccess { .. } => EventKind::NatIntroductionSuccess,
        }
    }
}

/// Application callbacks. Every method defaults to doing nothing.
///
/// A connection request must be answered with exactly one of
/// [`ConnectionRequest::accept`] or [`ConnectionRequest::reject`]; requests
/// left unanswered expire after the disconnect timeout.
pub trait EventListener: Send + Sync {
    fn on_connected(&self, _peer: &Arc<Peer>) {}

    fn on_disconnected(&self, _peer: &Arc<Peer>, _info: &DisconnectInfo) {}

    fn on_receive(&self, _peer: &Arc<Peer>, _data: &[u8], _channel: u8, _method: DeliveryMethod) {}

    fn on_receive_unconnected(&self, _remote: SocketAddr, _data: &[u8], _kind: UnconnectedKind) {}

    fn on_network_error(&self, _remote: Option<SocketAddr>, _error: &io::Error) {}

    fn on_latency_update(&self, _peer: &Arc<Peer>, _latency: Duration) {}

    fn on_connection_request(&self, _request: &Arc<ConnectionRequest>) {}

    fn on_nat_introduction_success(&self, _endpoint: SocketAddr, _address_type: NatAddressType, _token: &str) {}
}

/// Invoke the listener for one event and recycle any packet it carries.
pub(crate) fn dispatch(event: TransportEvent, listener: &dyn EventListener, pool: &PacketPool) {
    match event {
        TransportEvent::Connected { peer } => listener.on_connected(&peer),
        TransportEvent::Disconnected { peer, info } => listener.on_disconnected(&peer, &info),
        TransportEvent::Received {
            peer,
            packet,
            channel,
            method,
        } => {
            listener.on_receive(&peer, packet.payload(), channel, method);
            pool.release(packet);
        }
        TransportEvent::ReceivedUnconnected {
            remote,
            packet,
            kind,
        } => {
            listener.on_receive_unconnected(remote, packet.payload(), kind);
            pool.release(packet);
        }
        TransportEvent::NetworkError { remote, error } => listener.on_network_error(remote, &error),
        TransportEvent::LatencyUpdated { peer, latency } => listener.on_latency_update(&peer, latency),
        TransportEvent::ConnectionRequest { request } => listener.on_connection_request(&request),
        TransportEvent::NatIntroductionSuccess {
            endpoint,
            address_type,
            token,
        } => listener.on_nat_introduction_success(endpoint, address_type, &token),
    }
}

/// FIFO of synced events.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<TransportEvent>>,
}

impl EventQueue {
    pub fn push(&self, event: TransportEvent) {
        self.events.lock().push_back(event);
    }

    /// Take everything queued so far, oldest first.
    pub fn take(&self) -> VecDeque<TransportEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}
