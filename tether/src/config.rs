//! Transport configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use tether::{EventDelivery, EventKind, TransportConfig};
//!
//! let config = TransportConfig::default()
//!     .with_channels(4)
//!     .with_disconnect_timeout(Duration::from_secs(10))
//!     .with_delivery(EventKind::Receive, EventDelivery::Unsynced);
//! assert!(config.validate().is_ok());
//! ```

use crate::event::{EventDelivery, EventKind};
use crate::{Result, TetherError};
use std::time::Duration;
use tether_shared::crc32::CHECKSUM_SIZE;

/// Conservative datagram size that survives nearly every path.
pub const DEFAULT_MTU: usize = 1232;

/// Datagram sizes tried by MTU discovery, smallest first.
pub const MTU_CANDIDATES: [usize; 4] = [DEFAULT_MTU, 1350, 1432, 1472];

/// Largest configurable window.
pub const MAX_WINDOW_SIZE: u16 = 512;

/// Largest number of channels per delivery method.
pub const MAX_CHANNELS: u8 = 64;

/// Upper bound on the computed resend delay.
const MAX_RESEND_DELAY: Duration = Duration::from_secs(1);

/// Decides a symmetric connection race.
///
/// Called with `(local_connection_id, remote_connection_id)`; returning `true`
/// means the local outgoing attempt wins and the inbound request is ignored.
pub type TieBreak = fn(u64, u64) -> bool;

/// Smaller connection id wins.
pub fn smaller_id_wins(local: u64, remote: u64) -> bool {
    local < remote
}

/// How the datagram size limit is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuMode {
    /// Use exactly this many bytes per datagram.
    Fixed(usize),
    /// Start at [`DEFAULT_MTU`] and probe upward per peer.
    Discover,
}

/// Simulated network conditions applied to received datagrams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationConfig {
    /// Percentage of datagrams dropped (0-100).
    pub loss_percent: u8,
    /// Extra delay range applied to every datagram.
    pub latency: Option<(Duration, Duration)>,
}

impl SimulationConfig {
    pub fn is_active(&self) -> bool {
        self.loss_percent > 0 || self.latency.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between update ticks.
    pub update_interval: Duration,
    /// Silence after which a peer is disconnected, and how long disconnected
    /// records linger before eviction.
    pub disconnect_timeout: Duration,
    pub ping_interval: Duration,
    /// Interval between connect request (and disconnect) resends.
    pub reconnect_delay: Duration,
    pub max_connect_attempts: u32,
    /// Reliable window size in packets. Power of two in 8..=512.
    pub window_size: u16,
    /// Base of the resend delay; the smoothed RTT is added on top.
    pub resend_base: Duration,
    pub max_fragments: u16,
    pub mtu: MtuMode,
    /// Channels per delivery method.
    pub channels: u8,
    /// Append and verify a CRC32 on every datagram.
    pub checksum: bool,
    pub unconnected_messages: bool,
    pub broadcast: bool,
    pub nat_punch: bool,
    /// Connect requests carrying another id are answered with `InvalidProtocol`.
    pub protocol_id: u32,
    pub pool_capacity: usize,
    delivery: [EventDelivery; EventKind::COUNT],
    /// Force-disconnect peers whose host or network becomes unreachable.
    pub disconnect_on_unreachable: bool,
    /// No background threads; the caller pumps `manual_receive` and
    /// `manual_update`.
    pub manual_mode: bool,
    pub p2p_tie_break: TieBreak,
    pub simulation: SimulationConfig,
    /// OS socket buffer size, both directions.
    pub socket_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(15),
            disconnect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(500),
            max_connect_attempts: 10,
            window_size: 64,
            resend_base: Duration::from_millis(25),
            max_fragments: 512,
            mtu: MtuMode::Fixed(DEFAULT_MTU),
            channels: 1,
            checksum: false,
            unconnected_messages: false,
            broadcast: false,
            nat_punch: false,
            protocol_id: 1,
            pool_capacity: 1000,
            delivery: [EventDelivery::Synced; EventKind::COUNT],
            disconnect_on_unreachable: false,
            manual_mode: false,
            p2p_tie_break: smaller_id_wins,
            simulation: SimulationConfig::default(),
            socket_buffer_size: 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn with_window_size(mut self, window: u16) -> Self {
        self.window_size = window;
        self
    }

    pub fn with_resend_base(mut self, base: Duration) -> Self {
        self.resend_base = base;
        self
    }

    pub fn with_max_fragments(mut self, max: u16) -> Self {
        self.max_fragments = max;
        self
    }

    pub fn with_mtu(mut self, mtu: MtuMode) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    pub fn with_unconnected_messages(mut self, enabled: bool) -> Self {
        self.unconnected_messages = enabled;
        self
    }

    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    pub fn with_nat_punch(mut self, enabled: bool) -> Self {
        self.nat_punch = enabled;
        self
    }

    pub fn with_protocol_id(mut self, id: u32) -> Self {
        self.protocol_id = id;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Delivery mode for one event kind.
    pub fn with_delivery(mut self, kind: EventKind, mode: EventDelivery) -> Self {
        self.delivery[kind as usize] = mode;
        self
    }

    /// Delivery mode for every event kind.
    pub fn with_all_delivery(mut self, mode: EventDelivery) -> Self {
        self.delivery = [mode; EventKind::COUNT];
        self
    }

    pub fn with_disconnect_on_unreachable(mut self, enabled: bool) -> Self {
        self.disconnect_on_unreachable = enabled;
        self
    }

    pub fn with_manual_mode(mut self, enabled: bool) -> Self {
        self.manual_mode = enabled;
        self
    }

    pub fn with_p2p_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.p2p_tie_break = tie_break;
        self
    }

    pub fn with_simulation(mut self, simulation: SimulationConfig) -> Self {
        self.simulation = simulation;
        self
    }

    #[inline]
    pub fn delivery(&self, kind: EventKind) -> EventDelivery {
        self.delivery[kind as usize]
    }

    /// Datagram size a new peer starts with.
    pub fn initial_mtu(&self) -> usize {
        match self.mtu {
            MtuMode::Fixed(mtu) => mtu,
            MtuMode::Discover => DEFAULT_MTU,
        }
    }

    /// Bytes per datagram taken by the checksum.
    #[inline]
    pub(crate) fn checksum_overhead(&self) -> usize {
        if self.checksum {
            CHECKSUM_SIZE
        } else {
            0
        }
    }

    /// `resend_base + rtt * 2.1`, capped at one second.
    pub fn resend_delay(&self, rtt: Duration) -> Duration {
        (self.resend_base + rtt.mul_f64(2.1)).min(MAX_RESEND_DELAY.max(self.resend_base))
    }

    pub fn validate(&self) -> Result<()> {
        // Slots are `sequence % window`; they stay contiguous across the
        // sequence wrap only when the window divides MAX_SEQUENCE.
        if self.window_size < 8
            || self.window_size > MAX_WINDOW_SIZE
            || !self.window_size.is_power_of_two()
        {
            return Err(TetherError::config(format!(
                "window_size must be a power of two in 8..={}, got {}",
                MAX_WINDOW_SIZE, self.window_size
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(TetherError::config(format!(
                "channels must be in 1..={}, got {}",
                MAX_CHANNELS, self.channels
            )));
        }
        if self.max_fragments == 0 {
            return Err(TetherError::config("max_fragments must be at least 1"));
        }
        if let MtuMode::Fixed(mtu) = self.mtu {
            if !(64..=65507).contains(&mtu) {
                return Err(TetherError::config(format!(
                    "mtu must be in 64..=65507, got {}",
                    mtu
                )));
            }
        }
        if self.update_interval.is_zero() {
            return Err(TetherError::config("update_interval must be non-zero"));
        }
        if self.disconnect_timeout <= self.update_interval {
            return Err(TetherError::config(
                "disconnect_timeout must exceed update_interval",
            ));
        }
        if self.max_connect_attempts == 0 {
            return Err(TetherError::config("max_connect_attempts must be at least 1"));
        }
        if self.simulation.loss_percent > 100 {
            return Err(TetherError::config("simulation loss_percent must be <= 100"));
        }
        if let Some((min, max)) = self.simulation.latency {
            if min > max {
                return Err(TetherError::config("simulation latency min exceeds max"));
            }
        }
        Ok(())
    }
}
