//! Packet header encoding.

use crate::sequence::MAX_SEQUENCE;
use crate::{DecodeError, PacketKind, CONNECTION_NUMBER_MODULUS};
use bytemuck::{Pod, Zeroable};

/// Fragment descriptor size in bytes.
pub const FRAGMENT_HEADER_SIZE: usize = 6;

const KIND_MASK: u8 = 0x1F;
const CONNECTION_NUMBER_SHIFT: u8 = 5;
const CONNECTION_NUMBER_MASK: u8 = 0x03;
const FRAGMENTED_FLAG: u8 = 0x80;

/// Fragment descriptor (6 bytes), present when the fragmented flag is set.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       2     fragment_id
/// 2       2     index
/// 4       2     count
/// ```
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FragmentHeader {
    /// Identifier shared by all fragments of one message
    pub fragment_id: u16,
    /// Zero-based position of this fragment
    pub index: u16,
    /// Total number of fragments in the message
    pub count: u16,
}

impl FragmentHeader {
    /// Size of the descriptor in bytes.
    pub const SIZE: usize = FRAGMENT_HEADER_SIZE;

    #[inline]
    pub fn new(fragment_id: u16, index: u16, count: u16) -> Self {
        Self {
            fragment_id,
            index,
            count,
        }
    }

    /// Serialize descriptor to bytes.
    #[inline]
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        buf[0..2].copy_from_slice(&{ self.fragment_id }.to_le_bytes());
        buf[2..4].copy_from_slice(&{ self.index }.to_le_bytes());
        buf[4..6].copy_from_slice(&{ self.count }.to_le_bytes());
        buf
    }

    /// Parse descriptor from bytes.
    ///
    /// Returns `None` if buffer is too small.
    #[inline]
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            fragment_id: u16::from_le_bytes([buf[0], buf[1]]),
            index: u16::from_le_bytes([buf[2], buf[3]]),
            count: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }

    /// `count > 0` and `index < count`.
    #[inline]
    pub fn is_valid(&self) -> bool {
        let (index, count) = ({ self.index }, { self.count });
        count > 0 && index < count
    }
}

/// Decoded packet header.
///
/// Only the property byte, the channel/sequence fields and the fragment
/// descriptor are decoded here. Kind-specific trailing fields (connection ids,
/// timestamps, MTU sizes) sit between these and the payload and are read by
/// the transport; [`PacketHeader::header_len`] already accounts for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    /// Connection number, modulo [`CONNECTION_NUMBER_MODULUS`]
    pub connection_number: u8,
    /// Sequence number for sequenced kinds, zero otherwise
    pub sequence: u16,
    /// Channel id for `Channeled` and `Ack`, zero otherwise
    pub channel_id: u8,
    pub fragment: Option<FragmentHeader>,
}

impl PacketHeader {
    /// Header for the given kind with all other fields zeroed.
    #[inline]
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            connection_number: 0,
            sequence: 0,
            channel_id: 0,
            fragment: None,
        }
    }

    /// `Channeled` header for the given sequence and channel id.
    #[inline]
    pub fn channeled(sequence: u16, channel_id: u8) -> Self {
        Self {
            sequence,
            channel_id,
            ..Self::new(PacketKind::Channeled)
        }
    }

    #[inline]
    pub fn with_connection_number(mut self, number: u8) -> Self {
        self.connection_number = number % CONNECTION_NUMBER_MODULUS;
        self
    }

    #[inline]
    pub fn with_fragment(mut self, fragment: FragmentHeader) -> Self {
        self.fragment = Some(fragment);
        self
    }

    /// Total header length, fragment descriptor included.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.kind.header_size()
            + if self.fragment.is_some() {
                FRAGMENT_HEADER_SIZE
            } else {
                0
            }
    }

    /// The property byte: kind, connection number and fragmented flag.
    #[inline]
    pub fn property(&self) -> u8 {
        let mut byte = self.kind as u8 & KIND_MASK;
        byte |= (self.connection_number & CONNECTION_NUMBER_MASK) << CONNECTION_NUMBER_SHIFT;
        if self.fragment.is_some() {
            byte |= FRAGMENTED_FLAG;
        }
        byte
    }

    /// Write the header into `buf` and return [`header_len`](Self::header_len).
    ///
    /// Kind-specific fields beyond sequence and channel are left for the
    /// caller. `buf` must be at least `header_len()` bytes.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.property();
        match self.kind {
            PacketKind::Channeled | PacketKind::Ack => {
                buf[1..3].copy_from_slice(&self.sequence.to_le_bytes());
                buf[3] = self.channel_id;
            }
            PacketKind::Ping | PacketKind::Pong => {
                buf[1..3].copy_from_slice(&self.sequence.to_le_bytes());
            }
            _ => {}
        }
        if let Some(fragment) = self.fragment {
            let at = self.kind.header_size();
            buf[at..at + FRAGMENT_HEADER_SIZE].copy_from_slice(&fragment.to_bytes());
        }
        self.header_len()
    }

    /// Parse a header from a received datagram.
    ///
    /// Fails on an unknown kind, a datagram shorter than the declared header,
    /// an inconsistent fragment descriptor or an out-of-range sequence.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let Some(&property) = buf.first() else {
            return Err(DecodeError::Truncated {
                needed: 1,
                actual: 0,
            });
        };
        let kind = PacketKind::try_from(property & KIND_MASK)?;
        let fragmented = property & FRAGMENTED_FLAG != 0;
        if fragmented && kind != PacketKind::Channeled {
            return Err(DecodeError::InvalidFragment);
        }

        let mut header = Self::new(kind);
        header.connection_number = (property >> CONNECTION_NUMBER_SHIFT) & CONNECTION_NUMBER_MASK;

        let needed = kind.header_size() + if fragmented { FRAGMENT_HEADER_SIZE } else { 0 };
        if buf.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                actual: buf.len(),
            });
        }

        if kind.is_sequenced() {
            header.sequence = u16::from_le_bytes([buf[1], buf[2]]);
            if header.sequence >= MAX_SEQUENCE {
                return Err(DecodeError::InvalidSequence(header.sequence));
            }
        }
        if matches!(kind, PacketKind::Channeled | PacketKind::Ack) {
            header.channel_id = buf[3];
        }
        if fragmented {
            let fragment = FragmentHeader::from_bytes(&buf[kind.header_size()..])
                .ok_or(DecodeError::InvalidFragment)?;
            if !fragment.is_valid() {
                return Err(DecodeError::InvalidFragment);
            }
            header.fragment = Some(fragment);
        }
        Ok(header)
    }
}

/// Kind of a datagram without a full decode.
#[inline]
pub fn peek_kind(buf: &[u8]) -> Option<PacketKind> {
    buf.first().and_then(|b| PacketKind::from_u8(b & KIND_MASK))
}

/// Overwrite the connection number bits of an encoded datagram.
#[inline]
pub fn set_connection_number(buf: &mut [u8], number: u8) {
    if let Some(b) = buf.first_mut() {
        *b = (*b & !(CONNECTION_NUMBER_MASK << CONNECTION_NUMBER_SHIFT))
            | ((number % CONNECTION_NUMBER_MODULUS) << CONNECTION_NUMBER_SHIFT);
    }
}

/// Clear the fragmented flag on an encoded datagram.
#[inline]
pub fn clear_fragmented(buf: &mut [u8]) {
    if let Some(b) = buf.first_mut() {
        *b &= !FRAGMENTED_FLAG;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_header_size() {
        assert_eq!(std::mem::size_of::<FragmentHeader>(), FRAGMENT_HEADER_SIZE);
    }

    #[test]
    fn test_property_byte_layout() {
        let header = PacketHeader::channeled(7, 2)
            .with_connection_number(3)
            .with_fragment(FragmentHeader::new(1, 0, 2));
        let property = header.property();
        assert_eq!(property & 0x1F, PacketKind::Channeled as u8);
        assert_eq!((property >> 5) & 0x03, 3);
        assert_eq!(property & 0x80, 0x80);
    }

    #[test]
    fn test_connection_number_wraps() {
        let header = PacketHeader::new(PacketKind::Ping).with_connection_number(5);
        assert_eq!(header.connection_number, 1);
    }

    #[test]
    fn test_channeled_decode() {
        let header = PacketHeader::channeled(1234, 5)
            .with_connection_number(2)
            .with_fragment(FragmentHeader::new(9, 1, 3));
        let mut buf = [0u8; 32];
        let len = header.encode(&mut buf);
        assert_eq!(len, 4 + FRAGMENT_HEADER_SIZE);

        let parsed = PacketHeader::decode(&buf[..len + 4]).unwrap();
        assert_eq!(parsed, header);
        let fragment = parsed.fragment.unwrap();
        assert_eq!({ fragment.fragment_id }, 9);
        assert_eq!({ fragment.index }, 1);
        assert_eq!({ fragment.count }, 3);
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(
            PacketHeader::decode(&[]),
            Err(DecodeError::Truncated {
                needed: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        assert_eq!(PacketHeader::decode(&[0x1F]), Err(DecodeError::UnknownKind(31)));
    }

    #[test]
    fn test_decode_truncated_channel_header() {
        let buf = [PacketKind::Channeled as u8, 1, 0];
        assert_eq!(
            PacketHeader::decode(&buf),
            Err(DecodeError::Truncated {
                needed: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_fragment() {
        // index == count
        let header = PacketHeader::channeled(1, 0).with_fragment(FragmentHeader::new(1, 2, 2));
        let mut buf = [0u8; 16];
        let len = header.encode(&mut buf);
        assert_eq!(
            PacketHeader::decode(&buf[..len]),
            Err(DecodeError::InvalidFragment)
        );

        // zero count
        let header = PacketHeader::channeled(1, 0).with_fragment(FragmentHeader::new(1, 0, 0));
        let len = header.encode(&mut buf);
        assert_eq!(
            PacketHeader::decode(&buf[..len]),
            Err(DecodeError::InvalidFragment)
        );
    }

    #[test]
    fn test_decode_rejects_fragment_flag_on_ping() {
        let buf = [PacketKind::Ping as u8 | 0x80, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(PacketHeader::decode(&buf), Err(DecodeError::InvalidFragment));
    }

    #[test]
    fn test_decode_rejects_out_of_range_sequence() {
        let mut buf = [0u8; 4];
        PacketHeader::channeled(0, 0).encode(&mut buf);
        buf[1..3].copy_from_slice(&40000u16.to_le_bytes());
        assert_eq!(
            PacketHeader::decode(&buf),
            Err(DecodeError::InvalidSequence(40000))
        );
    }

    #[test]
    fn test_set_connection_number() {
        let mut buf = [0u8; 4];
        PacketHeader::channeled(1, 0)
            .with_connection_number(1)
            .encode(&mut buf);
        set_connection_number(&mut buf, 2);
        let header = PacketHeader::decode(&buf).unwrap();
        assert_eq!(header.connection_number, 2);
        assert_eq!(header.kind, PacketKind::Channeled);
    }

    #[test]
    fn test_clear_fragmented() {
        let mut buf = [0u8; 16];
        PacketHeader::channeled(1, 0)
            .with_fragment(FragmentHeader::new(1, 0, 1))
            .encode(&mut buf);
        clear_fragmented(&mut buf);
        assert_eq!(buf[0] & 0x80, 0);
        assert_eq!(peek_kind(&buf), Some(PacketKind::Channeled));
    }
}
