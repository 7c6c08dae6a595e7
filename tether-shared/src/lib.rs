//! # tether-shared
//!
//! Wire vocabulary shared by every part of the tether transport.
//!
//! - [`PacketKind`]: datagram discriminator stored in the low bits of byte 0
//! - [`PacketHeader`]: per-kind header with optional fragment descriptor
//! - [`sequence`]: wraparound-safe sequence arithmetic
//! - [`wire`]: little-endian field reader/writer used by control payloads
//! - CRC32 checksum utilities
//!
//! ## Layer Diagram
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ tether (Transport Engine)               │
//! │ - channels, peers, handshake, NAT       │
//! └────────────────────┬────────────────────┘
//!                      │
//! ┌────────────────────┴────────────────────┐
//! │ tether-shared (Wire Layer)              │
//! │ - PacketKind, PacketHeader (Binary)     │  ← This crate
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use tether_shared::{PacketHeader, PacketKind};
//!
//! let header = PacketHeader::channeled(42, 3);
//! let mut buf = [0u8; 16];
//! let len = header.encode(&mut buf);
//! assert_eq!(len, PacketKind::Channeled.header_size());
//!
//! let parsed = PacketHeader::decode(&buf[..len]).unwrap();
//! assert_eq!(parsed.sequence, 42);
//! ```

mod error;
mod header;
mod kind;
pub mod sequence;
pub mod wire;

pub use error::DecodeError;
pub use header::{
    clear_fragmented, peek_kind, set_connection_number, FragmentHeader, PacketHeader,
    FRAGMENT_HEADER_SIZE,
};
pub use kind::PacketKind;
pub use sequence::{relative_sequence, HALF_MAX_SEQUENCE, MAX_SEQUENCE};

/// Maximum connection number before it wraps (two bits of the property byte).
pub const CONNECTION_NUMBER_MODULUS: u8 = 4;

/// CRC32 checksum utilities.
///
/// A checksummed datagram carries its CRC32 as the trailing four bytes
/// (little-endian), computed over everything before it.
pub mod crc32 {
    use crate::DecodeError;

    /// Size of the trailing checksum in bytes.
    pub const CHECKSUM_SIZE: usize = 4;

    /// Calculate CRC32 checksum for data
    #[inline]
    pub fn crc32(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }

    /// Append the checksum of `buf[..len]` at `buf[len..len + 4]`.
    ///
    /// Returns the new datagram length. `buf` must have room for the
    /// trailing four bytes.
    #[inline]
    pub fn append(buf: &mut [u8], len: usize) -> usize {
        let crc = crc32(&buf[..len]);
        buf[len..len + CHECKSUM_SIZE].copy_from_slice(&crc.to_le_bytes());
        len + CHECKSUM_SIZE
    }

    /// Verify the trailing checksum and return the length without it.
    pub fn verify(buf: &[u8]) -> Result<usize, DecodeError> {
        if buf.len() <= CHECKSUM_SIZE {
            return Err(DecodeError::Truncated {
                needed: CHECKSUM_SIZE + 1,
                actual: buf.len(),
            });
        }
        let body = buf.len() - CHECKSUM_SIZE;
        let stored = u32::from_le_bytes([buf[body], buf[body + 1], buf[body + 2], buf[body + 3]]);
        if crc32(&buf[..body]) == stored {
            Ok(body)
        } else {
            Err(DecodeError::ChecksumMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_append_and_verify() {
        let mut buf = [0u8; 16];
        buf[..5].copy_from_slice(b"hello");
        let len = crc32::append(&mut buf, 5);
        assert_eq!(len, 9);
        assert_eq!(crc32::verify(&buf[..len]), Ok(5));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut buf = [0u8; 16];
        buf[..5].copy_from_slice(b"hello");
        let len = crc32::append(&mut buf, 5);
        buf[2] ^= 0x40;
        assert_eq!(crc32::verify(&buf[..len]), Err(DecodeError::ChecksumMismatch));
    }

    #[test]
    fn test_checksum_too_short() {
        assert!(matches!(
            crc32::verify(&[1, 2, 3]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_known_check_value() {
        assert_eq!(crc32::crc32(b"123456789"), 0xCBF4_3926);
    }
}
