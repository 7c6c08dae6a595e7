//! Pooled datagram buffers and control packet builders.

use crate::pool::PacketPool;
use tether_shared::wire::WireWriter;
use tether_shared::{FragmentHeader, PacketHeader, PacketKind};

/// One datagram's bytes.
///
/// Owned by exactly one stage at a time and handed back to the
/// [`PacketPool`] once, by whoever holds it last.
#[derive(Debug)]
pub struct Packet {
    pub(crate) buf: Vec<u8>,
    size: usize,
    offset: usize,
}

impl Packet {
    pub(crate) fn from_buffer(buf: Vec<u8>, size: usize) -> Self {
        debug_assert!(size <= buf.len());
        Self {
            buf,
            size,
            offset: 0,
        }
    }

    /// Bytes in use.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Underlying buffer length (the pool capacity class).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.size]
    }

    /// Application bytes: everything after the header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.offset..self.size]
    }

    #[inline]
    pub(crate) fn payload_offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub(crate) fn set_payload_offset(&mut self, offset: usize) {
        self.offset = offset.min(self.size);
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.size = 0;
        self.offset = 0;
    }

    #[inline]
    pub fn kind(&self) -> Option<PacketKind> {
        tether_shared::peek_kind(self.as_slice())
    }

    /// Sequence field of a sequenced packet.
    #[inline]
    pub fn sequence(&self) -> u16 {
        u16::from_le_bytes([self.buf[1], self.buf[2]])
    }

    #[inline]
    pub(crate) fn set_sequence(&mut self, sequence: u16) {
        self.buf[1..3].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Channel id of a `Channeled` or `Ack` packet.
    #[inline]
    pub fn channel_id(&self) -> u8 {
        self.buf[3]
    }

    #[inline]
    pub fn is_fragmented(&self) -> bool {
        self.buf.first().is_some_and(|b| b & 0x80 != 0)
    }

    /// Fragment descriptor of a fragmented `Channeled` packet.
    pub fn fragment(&self) -> Option<FragmentHeader> {
        if !self.is_fragmented() {
            return None;
        }
        let at = PacketKind::Channeled.header_size();
        FragmentHeader::from_bytes(&self.as_slice()[at..])
    }
}

/// Packet with `header` encoded and room for `payload_len` bytes after it.
pub(crate) fn with_header(pool: &PacketPool, header: PacketHeader, payload_len: usize) -> Packet {
    let header_len = header.header_len();
    let mut packet = pool.acquire(header_len + payload_len);
    header.encode(&mut packet.buf);
    packet.set_payload_offset(header_len);
    packet
}

/// Packet of `header` followed by `payload`.
pub(crate) fn with_payload(pool: &PacketPool, header: PacketHeader, payload: &[u8]) -> Packet {
    let mut packet = with_header(pool, header, payload.len());
    let at = packet.payload_offset();
    packet.buf[at..at + payload.len()].copy_from_slice(payload);
    packet
}

/// Copy of a received datagram, payload starting after its header.
pub(crate) fn from_datagram(pool: &PacketPool, data: &[u8], header_len: usize) -> Packet {
    let mut packet = pool.acquire(data.len());
    packet.buf[..data.len()].copy_from_slice(data);
    packet.set_payload_offset(header_len);
    packet
}

/// Control packet: `fields` fills the kind's fixed fields after the
/// property byte, `payload` follows the header.
fn control(
    pool: &PacketPool,
    kind: PacketKind,
    connection_number: u8,
    fields: impl FnOnce(&mut WireWriter<'_>),
    payload: &[u8],
) -> Packet {
    let header = PacketHeader::new(kind).with_connection_number(connection_number);
    let mut packet = with_payload(pool, header, payload);
    let mut scratch = Vec::with_capacity(kind.header_size());
    fields(&mut WireWriter::new(&mut scratch));
    debug_assert_eq!(scratch.len() + 1, kind.header_size());
    packet.buf[1..1 + scratch.len()].copy_from_slice(&scratch);
    packet
}

pub(crate) fn connect_request(
    pool: &PacketPool,
    protocol_id: u32,
    connection_id: u64,
    connection_number: u8,
    data: &[u8],
) -> Packet {
    control(
        pool,
        PacketKind::ConnectRequest,
        connection_number,
        |w| {
            w.write_u32(protocol_id);
            w.write_u64(connection_id);
        },
        data,
    )
}

/// `ConnectAccept`, `ConnectReject` or `Disconnect`.
pub(crate) fn connection(
    pool: &PacketPool,
    kind: PacketKind,
    connection_id: u64,
    connection_number: u8,
    data: &[u8],
) -> Packet {
    control(
        pool,
        kind,
        connection_number,
        |w| w.write_u64(connection_id),
        data,
    )
}

pub(crate) fn ping(pool: &PacketPool, sequence: u16, connection_number: u8) -> Packet {
    let mut header = PacketHeader::new(PacketKind::Ping).with_connection_number(connection_number);
    header.sequence = sequence;
    with_header(pool, header, 0)
}

pub(crate) fn pong(pool: &PacketPool, sequence: u16, timestamp: u64, connection_number: u8) -> Packet {
    let mut header = PacketHeader::new(PacketKind::Pong).with_connection_number(connection_number);
    header.sequence = sequence;
    let mut packet = with_header(pool, header, 0);
    packet.buf[3..11].copy_from_slice(&timestamp.to_le_bytes());
    packet
}

/// `MtuCheck` padded to `size` bytes, or `MtuOk` echoing `size`.
pub(crate) fn mtu(pool: &PacketPool, kind: PacketKind, size: u16, connection_number: u8) -> Packet {
    let padding = match kind {
        PacketKind::MtuCheck => (size as usize).saturating_sub(kind.header_size()),
        _ => 0,
    };
    let header = PacketHeader::new(kind).with_connection_number(connection_number);
    let mut packet = with_header(pool, header, padding);
    packet.buf[1..3].copy_from_slice(&size.to_le_bytes());
    packet
}

/// One-byte header followed by `payload`.
pub(crate) fn simple(pool: &PacketPool, kind: PacketKind, connection_number: u8, payload: &[u8]) -> Packet {
    let header = PacketHeader::new(kind).with_connection_number(connection_number);
    with_payload(pool, header, payload)
}

/// Fragment of a reliable message. Sequence is stamped by the channel.
pub(crate) fn fragment(
    pool: &PacketPool,
    channel_id: u8,
    connection_number: u8,
    fragment: FragmentHeader,
    payload: &[u8],
) -> Packet {
    let header = PacketHeader::channeled(0, channel_id)
        .with_connection_number(connection_number)
        .with_fragment(fragment);
    with_payload(pool, header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_shared::wire::WireReader;

    #[test]
    fn test_connect_request_layout() {
        let pool = PacketPool::new(16);
        let packet = connect_request(&pool, 7, 0xAABB_CCDD_0011_2233, 2, b"hi");
        assert_eq!(packet.size(), PacketKind::ConnectRequest.header_size() + 2);
        let header = PacketHeader::decode(packet.as_slice()).unwrap();
        assert_eq!(header.kind, PacketKind::ConnectRequest);
        assert_eq!(header.connection_number, 2);

        let mut r = WireReader::new(&packet.as_slice()[1..]);
        assert_eq!(r.read_u32(), Some(7));
        assert_eq!(r.read_u64(), Some(0xAABB_CCDD_0011_2233));
        assert_eq!(packet.payload(), b"hi");
    }

    #[test]
    fn test_pong_layout() {
        let pool = PacketPool::new(16);
        let packet = pong(&pool, 99, 123_456, 1);
        assert_eq!(packet.size(), 11);
        assert_eq!(packet.sequence(), 99);
        assert_eq!(u64::from_le_bytes(packet.as_slice()[3..11].try_into().unwrap()), 123_456);
    }

    #[test]
    fn test_mtu_check_padding() {
        let pool = PacketPool::new(16);
        let packet = mtu(&pool, PacketKind::MtuCheck, 1350, 0);
        assert_eq!(packet.size(), 1350);
        let ok = mtu(&pool, PacketKind::MtuOk, 1350, 0);
        assert_eq!(ok.size(), 3);
    }

    #[test]
    fn test_fragment_accessors() {
        let pool = PacketPool::new(16);
        let mut packet = fragment(&pool, 4, 0, FragmentHeader::new(3, 1, 2), b"abc");
        packet.set_sequence(500);
        assert!(packet.is_fragmented());
        assert_eq!(packet.sequence(), 500);
        assert_eq!(packet.channel_id(), 4);
        assert_eq!(packet.fragment(), Some(FragmentHeader::new(3, 1, 2)));
        assert_eq!(packet.payload(), b"abc");
    }
}
