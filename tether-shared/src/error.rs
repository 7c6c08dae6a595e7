//! Decode failures.
//!
//! All of these are drop-and-continue conditions: the transport logs them and
//! discards the datagram.

use thiserror::Error;

/// Why a datagram could not be decoded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Byte 0 names a kind outside the known range.
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),

    /// Fewer bytes than the header for this kind declares.
    #[error("truncated packet: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Fragment descriptor is inconsistent (zero count or index past count),
    /// or the fragmented flag is set on a kind that cannot carry fragments.
    #[error("invalid fragment descriptor")]
    InvalidFragment,

    /// Sequence number outside the sequence space.
    #[error("sequence {0} outside sequence space")]
    InvalidSequence(u16),

    /// Trailing CRC32 does not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,
}
