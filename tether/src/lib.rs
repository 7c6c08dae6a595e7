//! # tether
//!
//! Reliable transport over UDP datagrams.
//!
//! ## Features
//!
//! - **Delivery channels**: unreliable, sequenced, reliable-unordered and
//!   reliable-ordered lanes per channel number
//! - **Sliding window**: timer-based retransmission with bitmap acks
//! - **Fragmentation**: reliable messages larger than the MTU are split and
//!   reassembled transparently
//! - **Connections**: handshake with reconnect detection, keepalive, RTT,
//!   optional MTU discovery
//! - **NAT rendezvous**: relay-assisted hole punching
//! - **Pooled buffers**: datagrams recycled through a [`PacketPool`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether::{DeliveryMethod, EventListener, Peer, TransportConfig, TransportManager};
//!
//! struct Client;
//!
//! impl EventListener for Client {
//!     fn on_connected(&self, peer: &Arc<Peer>) {
//!         peer.send(b"hello", 0, DeliveryMethod::ReliableOrdered).unwrap();
//!     }
//! }
//!
//! let client = TransportManager::new(TransportConfig::default(), Arc::new(Client)).unwrap();
//! client.start("0.0.0.0:0".parse().unwrap()).unwrap();
//! client.connect("127.0.0.1:9050".parse().unwrap(), b"").unwrap();
//! loop {
//!     client.poll_events();
//!     std::thread::sleep(std::time::Duration::from_millis(15));
//! }
//! ```
//!
//! ## Protocol
//!
//! - Byte 0 carries the packet kind, a 2-bit connection number and the
//!   fragment flag; see [`tether_shared::PacketHeader`]
//! - 15-bit sequence space with wraparound-safe comparison
//! - Acks carry the receiver's window start and a bit per window slot
//! - Optional trailing CRC32 and a pluggable [`PacketLayer`]

// Tracing macros - no-op when feature disabled
#[cfg(feature = "tracing")]
macro_rules! trace_trace { ($($arg:tt)*) => { tracing::trace!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_trace { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_debug { ($($arg:tt)*) => { tracing::debug!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_info { ($($arg:tt)*) => { tracing::info!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_info { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_warn { ($($arg:tt)*) => { tracing::warn!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_error { ($($arg:tt)*) => { tracing::error!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_error { ($($arg:tt)*) => {} }

mod channel;
mod config;
mod error;
mod event;
mod fragment;
mod handshake;
mod manager;
mod nat;
mod packet;
mod peer;
mod pool;
mod simulation;
mod socket;
mod stats;

pub use channel::DeliveryMethod;
pub use config::{
    smaller_id_wins, MtuMode, SimulationConfig, TieBreak, TransportConfig, DEFAULT_MTU,
    MAX_CHANNELS, MAX_WINDOW_SIZE, MTU_CANDIDATES,
};
pub use error::{Result, TetherError};
pub use event::{
    DisconnectInfo, DisconnectReason, EventDelivery, EventKind, EventListener, TransportEvent,
    UnconnectedKind,
};
pub use handshake::ConnectionRequest;
pub use manager::TransportManager;
pub use nat::{NatAddressType, NAT_REQUEST_TIMEOUT, NAT_TOKEN_MAX};
pub use packet::Packet;
pub use peer::{Peer, PeerState};
pub use pool::{PacketPool, PoolStats, MAX_POOLED_SIZE};
pub use socket::{
    DatagramSocket, PacketLayer, SocketOptions, UdpDatagramSocket, MAX_DATAGRAM_SIZE,
    RECEIVE_POLL_TIMEOUT,
};
pub use stats::{NetStatistics, StatisticsSnapshot};
pub use tether_shared::{PacketHeader, PacketKind};
