//! Packet pool.
//!
//! Free-lists bucketed by power-of-two capacity class behind one mutex.
//! Buffers above [`MAX_POOLED_SIZE`] are allocated exactly and never kept.
//!
//! Accounting invariant: `pooled + outstanding + discarded == created`.

use crate::packet::Packet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest capacity class.
const MIN_CLASS_SHIFT: u32 = 6;

/// Buffers larger than this are discarded on release.
pub const MAX_POOLED_SIZE: usize = 4096;

const CLASS_COUNT: usize = (MAX_POOLED_SIZE.trailing_zeros() - MIN_CLASS_SHIFT + 1) as usize;

pub struct PacketPool {
    buckets: Mutex<PoolBuckets>,
    capacity: usize,
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

struct PoolBuckets {
    free: [Vec<Vec<u8>>; CLASS_COUNT],
    pooled: usize,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ever allocated.
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    /// Buffers dropped on release (too large, or pool full).
    pub discarded: u64,
    /// Buffers sitting in the free-lists.
    pub pooled: u64,
}

impl PoolStats {
    /// Buffers handed out and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.acquired - self.released
    }

    /// Every created buffer is pooled, outstanding or discarded.
    pub fn is_balanced(&self) -> bool {
        self.pooled + self.outstanding() + self.discarded == self.created
    }
}

#[inline]
fn class_of(size: usize) -> Option<usize> {
    if size > MAX_POOLED_SIZE {
        return None;
    }
    let rounded = size.max(1 << MIN_CLASS_SHIFT).next_power_of_two();
    Some((rounded.trailing_zeros() - MIN_CLASS_SHIFT) as usize)
}

#[inline]
fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

impl PacketPool {
    /// Pool keeping at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: Mutex::new(PoolBuckets {
                free: Default::default(),
                pooled: 0,
            }),
            capacity,
            created: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Packet of `size` bytes backed by a buffer of at least that capacity.
    pub fn acquire(&self, size: usize) -> Packet {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let buf = match class_of(size) {
            Some(class) => {
                let reused = {
                    let mut buckets = self.buckets.lock();
                    let buf = buckets.free[class].pop();
                    if buf.is_some() {
                        buckets.pooled -= 1;
                    }
                    buf
                };
                reused.unwrap_or_else(|| {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    vec![0u8; class_size(class)]
                })
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                vec![0u8; size]
            }
        };
        Packet::from_buffer(buf, size)
    }

    /// Return a packet. Clears the fragmented flag so a reused buffer never
    /// carries a stale descriptor.
    pub fn release(&self, mut packet: Packet) {
        self.released.fetch_add(1, Ordering::Relaxed);
        tether_shared::clear_fragmented(&mut packet.buf);
        packet.reset();
        let len = packet.buf.len();
        let class = match class_of(len) {
            Some(class) if class_size(class) == len => class,
            _ => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let mut buckets = self.buckets.lock();
        if buckets.pooled >= self.capacity {
            drop(buckets);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        buckets.free[class].push(packet.buf);
        buckets.pooled += 1;
    }

    pub fn stats(&self) -> PoolStats {
        let pooled = self.buckets.lock().pooled as u64;
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            pooled,
        }
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
