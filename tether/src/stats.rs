//! Traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free traffic counters, kept per manager and per peer.
#[derive(Debug, Default)]
pub struct NetStatistics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_resent: AtomicU64,
    packets_dropped: AtomicU64,
}

/// Copy of [`NetStatistics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_resent: u64,
    /// Malformed, corrupt or simulated-lost datagrams.
    pub packets_dropped: u64,
}

impl StatisticsSnapshot {
    /// Share of sent packets that were retransmissions.
    pub fn resend_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_resent as f64 / self.packets_sent as f64
        }
    }
}

impl NetStatistics {
    #[inline]
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_resent(&self, count: u64) {
        if count > 0 {
            self.packets_resent.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_resent: self.packets_resent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.packets_sent,
            &self.packets_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.packets_resent,
            &self.packets_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
