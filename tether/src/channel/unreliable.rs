//! Unreliable lane: send as queued, deliver as received.

use super::{ChannelContext, DeliveryChannel};
use crate::packet::Packet;
use crate::pool::PacketPool;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct UnreliableChannel {
    outgoing: VecDeque<Packet>,
}

impl UnreliableChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeliveryChannel for UnreliableChannel {
    fn enqueue(&mut self, packet: Packet) {
        self.outgoing.push_back(packet);
    }

    fn tick(&mut self, ctx: &mut ChannelContext<'_>) {
        ctx.outbound.extend(self.outgoing.drain(..));
    }

    fn on_packet(&mut self, packet: Packet, ctx: &mut ChannelContext<'_>) {
        ctx.deliver(packet);
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
    use tether_shared::PacketKind;

    #[test]
    fn test_delivers_payload_after_header() {
        let pool = PacketPool::new(8);
        let mut lane = UnreliableChannel::new();
        lane.enqueue(packet::simple(&pool, PacketKind::Unreliable, 0, b"ping"));
        assert_eq!(lane.pending(), 1);

        let mut ctx = ChannelContext::new(Instant::now(), Duration::ZERO, &pool);
        lane.tick(&mut ctx);
        assert_eq!(lane.pending(), 0);
        let sent = ctx.outbound.pop().unwrap();
        let received = packet::from_datagram(&pool, sent.as_slice(), 0);
        pool.release(sent);

        lane.on_packet(received, &mut ctx);
        assert_eq!(ctx.delivered.len(), 1);
        assert_eq!(ctx.delivered[0].payload(), b"ping");
        ctx.recycle();
        assert_eq!(pool.stats().outstanding(), 0);
    }
}
