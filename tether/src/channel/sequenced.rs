//! Sequenced lane: newest wins, anything older than the last delivered
//! packet is dropped.

use super::{ChannelContext, DeliveryChannel};
use crate::packet::Packet;
use crate::pool::PacketPool;
use std::collections::VecDeque;
use tether_shared::sequence::next_sequence;
use tether_shared::relative_sequence;

#[derive(Debug)]
pub(crate) struct SequencedChannel {
    id: u8,
    outgoing: VecDeque<Packet>,
    local_sequence: u16,
    remote_sequence: u16,
}

impl SequencedChannel {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            outgoing: VecDeque::new(),
            local_sequence: 0,
            remote_sequence: 0,
        }
    }

    #[cfg(test)]
    fn starting_at(mut self, sequence: u16) -> Self {
        self.local_sequence = sequence;
        self.remote_sequence = sequence;
        self
    }
}

impl DeliveryChannel for SequencedChannel {
    fn enqueue(&mut self, mut packet: Packet) {
        self.local_sequence = next_sequence(self.local_sequence);
        packet.set_sequence(self.local_sequence);
        self.outgoing.push_back(packet);
    }

    fn tick(&mut self, ctx: &mut ChannelContext<'_>) {
        ctx.outbound.extend(self.outgoing.drain(..));
    }

    fn on_packet(&mut self, packet: Packet, ctx: &mut ChannelContext<'_>) {
        let sequence = packet.sequence();
        if relative_sequence(sequence, self.remote_sequence) > 0 {
            self.remote_sequence = sequence;
            ctx.deliver(packet);
        } else {
            trace_trace!(channel = self.id, sequence, "sequenced: dropping old packet");
            ctx.pool.release(packet);
        }
    }

    fn pending(&self) -> usize {
        self.outgoing.len()
    }

    fn drain(&mut self, pool: &PacketPool) {
        for packet in self.outgoing.drain(..) {
            pool.release(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;
    use std::time::{Duration, Instant};
    use tether_shared::{PacketHeader, MAX_SEQUENCE};

    fn data(pool: &PacketPool, byte: u8) -> Packet {
        packet::with_payload(pool, PacketHeader::channeled(0, 0), &[byte])
    }

    #[test]
    fn test_drops_older_packets() {
        let pool = PacketPool::new(32);
        let mut sender = SequencedChannel::new(0);
        let mut receiver = SequencedChannel::new(0);

        for byte in 1..=3 {
            sender.enqueue(data(&pool, byte));
        }
        let mut ctx = ChannelContext::new(Instant::now(), Duration::ZERO, &pool);
        sender.tick(&mut ctx);
        let mut wire: Vec<Packet> = ctx.outbound.drain(..).collect();
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0].sequence(), 1);

        // deliver 3, then the late 1 and 2
        let third = wire.pop().unwrap();
        receiver.on_packet(third, &mut ctx);
        for late in wire {
            receiver.on_packet(late, &mut ctx);
        }
        assert_eq!(ctx.delivered.len(), 1);
        assert_eq!(ctx.delivered[0].payload(), &[3]);
        ctx.recycle();
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn test_newest_wins_across_sequence_wrap() {
        let pool = PacketPool::new(32);
        let start = MAX_SEQUENCE - 2;
        let mut sender = SequencedChannel::new(0).starting_at(start);
        let mut receiver = SequencedChannel::new(0).starting_at(start);

        for byte in 1..=5 {
            sender.enqueue(data(&pool, byte));
        }
        let mut ctx = ChannelContext::new(Instant::now(), Duration::ZERO, &pool);
        sender.tick(&mut ctx);
        let wire: Vec<Packet> = ctx.outbound.drain(..).collect();
        let sequences: Vec<u16> = wire.iter().map(|p| p.sequence()).collect();
        assert_eq!(sequences, vec![MAX_SEQUENCE - 1, 0, 1, 2, 3]);

        // 0 and 2 arrive after a newer packet and must be dropped
        let mut wire: Vec<Option<Packet>> = wire.into_iter().map(Some).collect();
        for index in [0, 2, 1, 4, 3] {
            let packet = wire[index].take().unwrap();
            receiver.on_packet(packet, &mut ctx);
        }
        let delivered: Vec<u8> = ctx.delivered.iter().map(|p| p.payload()[0]).collect();
        assert_eq!(delivered, vec![1, 3, 5]);
        ctx.recycle();
        assert_eq!(pool.stats().outstanding(), 0);
    }
}
