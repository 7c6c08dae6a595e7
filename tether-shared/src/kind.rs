//! Packet kind discriminator.

/// Datagram kinds understood by the transport.
///
/// The kind occupies the low five bits of the first byte of every datagram
/// (the property byte). The remaining bits carry the connection number and
/// the fragmented flag, see [`PacketHeader`](crate::PacketHeader).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Connected payload with no channel and no sequence
    Unreliable = 0,
    /// Payload on a numbered delivery channel
    Channeled = 1,
    /// Acknowledgement bitmap for a reliable channel
    Ack = 2,
    /// Keep-alive and RTT probe
    Ping = 3,
    /// Reply to a ping, echoes the sequence plus a timestamp
    Pong = 4,
    /// Initiator's connection request
    ConnectRequest = 5,
    /// Responder accepted the request
    ConnectAccept = 6,
    /// Responder rejected the request, payload carries reject data
    ConnectReject = 7,
    /// Graceful disconnect, resent until acknowledged
    Disconnect = 8,
    /// Acknowledges a disconnect
    ShutdownOk = 9,
    /// Payload sent outside any connection
    UnconnectedMessage = 10,
    /// Payload sent to the LAN broadcast address
    Broadcast = 11,
    /// NAT rendezvous message (introduction request, introduction, punch)
    NatMessage = 12,
    /// MTU probe padded to the candidate size
    MtuCheck = 13,
    /// MTU probe acknowledgement
    MtuOk = 14,
    /// Connect request carried a foreign protocol id
    InvalidProtocol = 15,
}

impl PacketKind {
    /// Highest discriminator value in use.
    pub const MAX: u8 = 15;

    /// Convert from raw byte value.
    ///
    /// Returns `None` for invalid values.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unreliable),
            1 => Some(Self::Channeled),
            2 => Some(Self::Ack),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            5 => Some(Self::ConnectRequest),
            6 => Some(Self::ConnectAccept),
            7 => Some(Self::ConnectReject),
            8 => Some(Self::Disconnect),
            9 => Some(Self::ShutdownOk),
            10 => Some(Self::UnconnectedMessage),
            11 => Some(Self::Broadcast),
            12 => Some(Self::NatMessage),
            13 => Some(Self::MtuCheck),
            14 => Some(Self::MtuOk),
            15 => Some(Self::InvalidProtocol),
            _ => None,
        }
    }

    /// Fixed header size for this kind, fragment descriptor excluded.
    ///
    /// ```text
    /// Kind              Size  Layout after the property byte
    /// Unreliable        1     -
    /// Channeled / Ack   4     sequence u16, channel u8
    /// Ping              3     sequence u16
    /// Pong              11    sequence u16, timestamp u64
    /// ConnectRequest    13    protocol id u32, connection id u64
    /// ConnectAccept     9     connection id u64
    /// ConnectReject     9     connection id u64
    /// Disconnect        9     connection id u64
    /// MtuCheck / MtuOk  3     candidate size u16
    /// everything else   1     -
    /// ```
    #[inline]
    pub const fn header_size(self) -> usize {
        match self {
            Self::Channeled | Self::Ack => 4,
            Self::Ping => 3,
            Self::Pong => 11,
            Self::ConnectRequest => 13,
            Self::ConnectAccept | Self::ConnectReject | Self::Disconnect => 9,
            Self::MtuCheck | Self::MtuOk => 3,
            _ => 1,
        }
    }

    /// Kinds whose header carries a sequence number.
    #[inline]
    pub const fn is_sequenced(self) -> bool {
        matches!(self, Self::Channeled | Self::Ack | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = crate::DecodeError;

    #[inline]
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(crate::DecodeError::UnknownKind(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_values() {
        assert_eq!(PacketKind::Unreliable as u8, 0);
        assert_eq!(PacketKind::Channeled as u8, 1);
        assert_eq!(PacketKind::Ack as u8, 2);
        assert_eq!(PacketKind::ConnectRequest as u8, 5);
        assert_eq!(PacketKind::NatMessage as u8, 12);
        assert_eq!(PacketKind::InvalidProtocol as u8, PacketKind::MAX);
    }

    #[test]
    fn test_from_u8() {
        for value in 0..=PacketKind::MAX {
            let kind = PacketKind::from_u8(value).unwrap();
            assert_eq!(kind as u8, value);
        }
        assert_eq!(PacketKind::from_u8(16), None);
        assert_eq!(PacketKind::from_u8(31), None);
    }

    #[test]
    fn test_try_from() {
        assert_eq!(PacketKind::try_from(2u8), Ok(PacketKind::Ack));
        assert_eq!(
            PacketKind::try_from(20u8),
            Err(crate::DecodeError::UnknownKind(20))
        );
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(PacketKind::Unreliable.header_size(), 1);
        assert_eq!(PacketKind::Channeled.header_size(), 4);
        assert_eq!(PacketKind::Ack.header_size(), 4);
        assert_eq!(PacketKind::Ping.header_size(), 3);
        assert_eq!(PacketKind::Pong.header_size(), 11);
        assert_eq!(PacketKind::ConnectRequest.header_size(), 13);
        assert_eq!(PacketKind::Disconnect.header_size(), 9);
    }
}
