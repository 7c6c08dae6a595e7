//! Delivery channels.
//!
//! Each peer owns one unreliable channel plus, for every channel number, one
//! sequenced, one reliable-unordered and one reliable-ordered channel. They
//! share a narrow contract:
//!
//! ```text
//!  enqueue ──► outgoing queue ──tick──► ctx.outbound ──► socket
//!  socket ──► on_packet ──► ctx.delivered ──► fragment assembler / events
//!  socket ──► on_ack (reliable only)
//! ```
//!
//! Channels never touch the socket. Everything they want sent is pushed into
//! [`ChannelContext::outbound`] and sent by the caller after the channel lock
//! is released.

mod reliable;
mod sequenced;
mod unreliable;

pub(crate) use reliable::ReliableChannel;
pub(crate) use sequenced::SequencedChannel;
pub(crate) use unreliable::UnreliableChannel;

use crate::packet::Packet;
use crate::pool::PacketPool;
use std::time::{Duration, Instant};

/// Delivery guarantee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    /// May be lost, duplicated or reordered. Always arrives on channel 0.
    Unreliable,
    /// May be lost; older packets arriving after newer ones are dropped.
    Sequenced,
    /// Arrives exactly once, in any order.
    ReliableUnordered,
    /// Arrives exactly once, in send order.
    ReliableOrdered,
}

impl DeliveryMethod {
    /// Per-number channels, in channel id order.
    pub(crate) const CHANNELED: [DeliveryMethod; 3] = [
        DeliveryMethod::Sequenced,
        DeliveryMethod::ReliableUnordered,
        DeliveryMethod::ReliableOrdered,
    ];

    #[inline]
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::ReliableUnordered | Self::ReliableOrdered)
    }

    #[inline]
    fn index(self) -> Option<u8> {
        match self {
            Self::Unreliable => None,
            Self::Sequenced => Some(0),
            Self::ReliableUnordered => Some(1),
            Self::ReliableOrdered => Some(2),
        }
    }
}

/// Wire channel id for a channel number and method.
///
/// `None` for [`DeliveryMethod::Unreliable`], which has no channel id.
#[inline]
pub(crate) fn channel_id(number: u8, method: DeliveryMethod) -> Option<u8> {
    method
        .index()
        .map(|index| number * DeliveryMethod::CHANNELED.len() as u8 + index)
}

/// Channel number and method behind a wire channel id.
#[inline]
pub(crate) fn split_channel_id(id: u8) -> (u8, DeliveryMethod) {
    let per_number = DeliveryMethod::CHANNELED.len() as u8;
    (
        id / per_number,
        DeliveryMethod::CHANNELED[(id % per_number) as usize],
    )
}

/// Per-call inputs and outputs of a channel operation.
pub(crate) struct ChannelContext<'a> {
    pub now: Instant,
    pub resend_delay: Duration,
    pub pool: &'a PacketPool,
    /// Packets to put on the wire.
    pub outbound: Vec<Packet>,
    /// Packets ready for the application, payload offset set.
    pub delivered: Vec<Packet>,
    /// Retransmissions performed.
    pub resent: u64,
}

impl<'a> ChannelContext<'a> {
    pub fn new(now: Instant, resend_delay: Duration, pool: &'a PacketPool) -> Self {
        Self {
            now,
            resend_delay,
            pool,
            outbound: Vec::new(),
            delivered: Vec::new(),
            resent: 0,
        }
    }

    /// Queue a copy of `packet` for sending; the original stays with the caller.
    pub fn send_copy(&mut self, packet: &Packet) {
        let mut copy = self.pool.acquire(packet.size());
        copy.as_mut_slice().copy_from_slice(packet.as_slice());
        self.outbound.push(copy);
    }

    /// Hand a received packet to the application, payload after its header.
    pub fn deliver(&mut self, mut packet: Packet) {
        let header_len = tether_shared::PacketHeader::decode(packet.as_slice())
            .map(|h| h.header_len())
            .unwrap_or(packet.size());
        packet.set_payload_offset(header_len);
        self.delivered.push(packet);
    }

    /// Give every packet still held back to the pool.
    pub fn recycle(self) {
        for packet in self.outbound.into_iter().chain(self.delivered) {
            self.pool.release(packet);
        }
    }
}

/// A delivery lane.
pub(crate) trait DeliveryChannel: Send {
    /// Accept an encoded packet for sending. Sequence is stamped here or at
    /// tick time.
    fn enqueue(&mut self, packet: Packet);

    /// Emit whatever should go on the wire now.
    fn tick(&mut self, ctx: &mut ChannelContext<'_>);

    /// Process a data packet addressed to this channel.
    fn on_packet(&mut self, packet: Packet, ctx: &mut ChannelContext<'_>);

    /// Process an acknowledgement. Only reliable channels care.
    fn on_ack(&mut self, packet: Packet, ctx: &mut ChannelContext<'_>) {
        ctx.pool.release(packet);
    }

    /// Packets accepted but not yet acknowledged (or sent, for unreliable lanes).
    fn pending(&self) -> usize;

    /// Release every held packet back to the pool.
    fn drain(&mut self, pool: &PacketPool);
}
