//! Fragmentation and reassembly of large reliable messages.
//!
//! Each fragment travels as an independent reliable packet, so a lost
//! fragment is recovered by ordinary retransmission. The assembler only has
//! to collect `count` distinct indices per fragment id and concatenate them.

use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::{Result, TetherError};
use std::collections::HashMap;

/// Number of fragments needed for `size` bytes at `per_fragment` bytes each.
#[inline]
pub(crate) fn fragment_count(size: usize, per_fragment: usize) -> usize {
    size.div_ceil(per_fragment.max(1))
}

/// Fragment count for `size`, or `TooManyFragments` above `max`.
pub(crate) fn plan(size: usize, per_fragment: usize, max: u16) -> Result<u16> {
    let required = fragment_count(size, per_fragment);
    if required > max as usize {
        return Err(TetherError::TooManyFragments {
            required,
            max: max as usize,
        });
    }
    Ok(required as u16)
}

#[derive(Debug)]
struct IncomingFragments {
    parts: Vec<Option<Packet>>,
    received: u16,
    total_size: usize,
    channel_id: u8,
}

/// Per-peer reassembly buffers keyed by fragment id.
#[derive(Debug)]
pub(crate) struct FragmentAssembler {
    incoming: HashMap<u16, IncomingFragments>,
    max_fragments: u16,
}

impl FragmentAssembler {
    pub fn new(max_fragments: u16) -> Self {
        Self {
            incoming: HashMap::new(),
            max_fragments,
        }
    }

    /// Add one delivered fragment. Returns the whole message once the last
    /// missing index arrives, as a packet whose payload is the message.
    pub fn add(&mut self, packet: Packet, pool: &PacketPool) -> Option<(Packet, u8)> {
        let Some(descriptor) = packet.fragment() else {
            pool.release(packet);
            return None;
        };
        let (fragment_id, index, count) = (
            { descriptor.fragment_id },
            { descriptor.index },
            { descriptor.count },
        );
        if !descriptor.is_valid() || count > self.max_fragments {
            trace_debug!(fragment_id, count, "fragment count above limit");
            pool.release(packet);
            return None;
        }

        let entry = self
            .incoming
            .entry(fragment_id)
            .or_insert_with(|| IncomingFragments {
                parts: (0..count).map(|_| None).collect(),
                received: 0,
                total_size: 0,
                channel_id: packet.channel_id(),
            });
        if entry.parts.len() != count as usize || entry.channel_id != packet.channel_id() {
            trace_debug!(fragment_id, "fragment descriptor disagrees with earlier parts");
            pool.release(packet);
            return None;
        }
        let part = &mut entry.parts[index as usize];
        if part.is_some() {
            pool.release(packet);
            return None;
        }
        entry.total_size += packet.payload().len();
        entry.received += 1;
        *part = Some(packet);

        if entry.received < count {
            return None;
        }

        let complete = self.incoming.remove(&fragment_id)?;
        let mut message = pool.acquire(complete.total_size);
        let mut at = 0;
        for part in complete.parts.into_iter().flatten() {
            let payload = part.payload();
            message.as_mut_slice()[at..at + payload.len()].copy_from_slice(payload);
            at += payload.len();
            pool.release(part);
        }
        Some((message, complete.channel_id))
    }

    /// Partial messages currently buffered.
    #[cfg(test)]
    fn in_progress(&self) -> usize {
        self.incoming.len()
    }

    pub fn clear(&mut self, pool: &PacketPool) {
        for (_, entry) in self.incoming.drain() {
            for part in entry.parts.into_iter().flatten() {
                pool.release(part);
            }
        }
    }
}
