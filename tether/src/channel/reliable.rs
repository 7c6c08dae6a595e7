//! Reliable lanes, ordered and unordered.
//!
//! Sliding window of `W` sequences on each side, all state in fixed arrays
//! indexed by `sequence % W`:
//!
//! ```text
//! sender    pending[W]       slots [local_window_start, local_sequence)
//! receiver  acks[W / 8]      bit per sequence in [remote_window_start, +W)
//!           received[W]      ordered: packets waiting for their turn
//!           early[W]         unordered: delivered ahead of remote_sequence
//! ```
//!
//! Retransmission is purely timer based: a pending packet is resent once
//! `resend_delay` has passed since its last send. Acks carry the receiver's
//! window start in the sequence field and the bitmap as payload; one ack is
//! sent per tick while there is something new to acknowledge.

use super::{ChannelContext, DeliveryChannel};
use crate::packet::{self, Packet};
use crate::pool::PacketPool;
use std::collections::VecDeque;
use std::time::Instant;
use tether_shared::sequence::{add_sequence, next_sequence, MAX_SEQUENCE};
use tether_shared::{relative_sequence, PacketHeader, PacketKind};

const ACK_HEADER_SIZE: usize = PacketKind::Ack.header_size();

#[derive(Debug, Default)]
struct PendingSlot {
    packet: Option<Packet>,
    sent_at: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct ReliableChannel {
    id: u8,
    ordered: bool,
    window: u16,
    outgoing: VecDeque<Packet>,

    pending: Box<[PendingSlot]>,
    local_sequence: u16,
    local_window_start: u16,

    remote_sequence: u16,
    remote_window_start: u16,
    received: Box<[Option<Packet>]>,
    early_received: Box<[bool]>,
    acks: Box<[u8]>,
    must_send_acks: bool,
}

impl ReliableChannel {
    /// `window` must be a power of two, at least 8, so that it divides
    /// `MAX_SEQUENCE`.
    pub fn new(id: u8, ordered: bool, window: u16) -> Self {
        debug_assert!(window >= 8 && MAX_SEQUENCE % window == 0);
        let w = window as usize;
        Self {
            id,
            ordered,
            window,
            outgoing: VecDeque::new(),
            pending: (0..w).map(|_| PendingSlot::default()).collect(),
            local_sequence: 0,
            local_window_start: 0,
            remote_sequence: 0,
            remote_window_start: 0,
            received: if ordered {
                (0..w).map(|_| None).collect()
            } else {
                Box::default()
            },
            early_received: if ordered {
                Box::default()
            } else {
                vec![false; w].into_boxed_slice()
            },
            acks: vec![0u8; w / 8].into_boxed_slice(),
            must_send_acks: false,
        }
    }

    #[inline]
    fn slot(&self, sequence: u16) -> usize {
        sequence as usize % self.window as usize
    }

    #[inline]
    fn ack_bit(&self, sequence: u16) -> (usize, u8) {
        let index = self.slot(sequence);
        (index / 8, 1 << (index % 8))
    }

    /// Sequences sent or waiting in the window, not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        relative_sequence(self.local_sequence, self.local_window_start) as usize
    }

    fn send_acks(&mut self, ctx: &mut ChannelContext<'_>) {
        self.must_send_acks = false;
        let mut header = PacketHeader::new(PacketKind::Ack);
        header.sequence = self.remote_window_start;
        header.channel_id = self.id;
        ctx.outbound
            .push(packet::with_payload(ctx.pool, header, &self.acks));
    }

    /// Move the receive window so that `relate` (offset of the new sequence
    /// from the window start) lands on its last slot, clearing bits that fall
    /// out.
    fn shift_receive_window(&mut self, relate: i32) {
        let new_start = add_sequence(self.remote_window_start, (relate - self.window as i32 + 1) as u16);
        while self.remote_window_start != new_start {
            let (byte, bit) = self.ack_bit(self.remote_window_start);
            self.acks[byte] &= !bit;
            self.remote_window_start = next_sequence(self.remote_window_start);
        }
    }

    #[cfg(test)]
    fn starting_at(mut self, sequence: u16) -> Self {
        self.local_sequence = sequence;
        self.local_window_start = sequence;
        self.remote_sequence = sequence;
        self.remote_window_start = sequence;
        self
    }
}

impl DeliveryChannel for ReliableChannel {
    fn enqueue(&mut self, packet: Packet) {
        self.outgoing.push_back(packet);
    }

    fn tick(&mut self, ctx: &mut ChannelContext<'_>) {
        if self.must_send_acks {
            self.send_acks(ctx);
        }

        while relative_sequence(self.local_sequence, self.local_window_start) < self.window as i32 {
            let Some(mut packet) = self.outgoing.pop_front() else {
                break;
            };
            packet.set_sequence(self.local_sequence);
            let index = self.slot(self.local_sequence);
            let slot = &mut self.pending[index];
            debug_assert!(slot.packet.is_none());
            slot.packet = Some(packet);
            slot.sent_at = None;
            self.local_sequence = next_sequence(self.local_sequence);
        }

        let mut sequence = self.local_window_start;
        while sequence != self.local_sequence {
            let index = self.slot(sequence);
            let slot = &mut self.pending[index];
            if let Some(packet) = &slot.packet {
                match slot.sent_at {
                    None => {
                        ctx.send_copy(packet);
                        slot.sent_at = Some(ctx.now);
                    }
                    Some(at) if ctx.now.saturating_duration_since(at) >= ctx.resend_delay => {
                        ctx.send_copy(packet);
                        slot.sent_at = Some(ctx.now);
                        ctx.resent += 1;
                    }
                    Some(_) => {}
                }
            }
            sequence = next_sequence(sequence);
        }
    }

    fn on_packet(&mut self, packet: Packet, ctx: &mut ChannelContext<'_>) {
        let sequence = packet.sequence();
        let window = self.window as i32;
        let relate = relative_sequence(sequence, self.remote_window_start);

        if relate < 0 {
            // Already delivered; the sender missed our ack.
            trace_trace!(channel = self.id, sequence, "reliable: packet behind window");
            self.must_send_acks = true;
            ctx.pool.release(packet);
            return;
        }
        if relate >= window * 2 || relative_sequence(sequence, self.remote_sequence) >= window {
            trace_trace!(channel = self.id, sequence, "reliable: packet too far ahead");
            ctx.pool.release(packet);
            return;
        }

        if relate >= window {
            self.shift_receive_window(relate);
        }
        self.must_send_acks = true;

        let (byte, bit) = self.ack_bit(sequence);
        if self.acks[byte] & bit != 0 {
            trace_trace!(channel = self.id, sequence, "reliable: duplicate");
            ctx.pool.release(packet);
            return;
        }
        self.acks[byte] |= bit;

        if sequence == self.remote_sequence {
            ctx.deliver(packet);
            self.remote_sequence = next_sequence(self.remote_sequence);
            if self.ordered {
                loop {
                    let index = self.slot(self.remote_sequence);
                    let Some(next) = self.received[index].take() else {
                        break;
                    };
                    ctx.deliver(next);
                    self.remote_sequence = next_sequence(self.remote_sequence);
                }
            } else {
                loop {
                    let index = self.slot(self.remote_sequence);
                    if !self.early_received[index] {
                        break;
                    }
                    self.early_received[index] = false;
                    self.remote_sequence = next_sequence(self.remote_sequence);
                }
            }
            return;
        }

        let index = self.slot(sequence);
        if self.ordered {
            self.received[index] = Some(packet);
        } else {
            self.early_received[index] = true;
            ctx.deliver(packet);
        }
    }

    fn on_ack(&mut self, packet: Packet, ctx: &mut ChannelContext<'_>) {
        if packet.size() != ACK_HEADER_SIZE + self.acks.len() {
            trace_trace!(channel = self.id, size = packet.size(), "reliable: malformed ack");
            ctx.pool.release(packet);
            return;
        }
        let ack_window_start = packet.sequence();
        let window_rel = relative_sequence(self.local_window_start, ack_window_start);
        if window_rel < 0 || window_rel >= self.window as i32 {
            trace_trace!(channel = self.id, ack_window_start, "reliable: stale ack");
            ctx.pool.release(packet);
            return;
        }

        {
            let bits = &packet.as_slice()[ACK_HEADER_SIZE..];
            let mut sequence = self.local_window_start;
            while sequence != self.local_sequence {
                if relative_sequence(sequence, ack_window_start) >= self.window as i32 {
                    break;
                }
                let (byte, bit) = self.ack_bit(sequence);
                if bits[byte] & bit != 0 {
                    let index = self.slot(sequence);
                    if let Some(acked) = self.pending[index].packet.take() {
                        self.pending[index].sent_at = None;
                        ctx.pool.release(acked);
                    }
                }
                sequence = next_sequence(sequence);
            }
        }
        ctx.pool.release(packet);

        while self.local_window_start != self.local_sequence
            && self.pending[self.slot(self.local_window_start)].packet.is_none()
        {
            self.local_window_start = next_sequence(self.local_window_start);
        }
    }

    fn pending(&self) -> usize {
        self.outgoing.len() + self.in_flight()
    }

    fn drain(&mut self, pool: &PacketPool) {
        for packet in self.outgoing.drain(..) {
            pool.release(packet);
        }
        for slot in self.pending.iter_mut() {
            if let Some(packet) = slot.packet.take() {
                pool.release(packet);
            }
        }
        for entry in self.received.iter_mut() {
            if let Some(packet) = entry.take() {
                pool.release(packet);
            }
        }
    }
}
