//! Sequence arithmetic over a wrapping 15-bit space.
//!
//! Sequence numbers live in `[0, MAX_SEQUENCE)` and wrap. Ordering between
//! two numbers is only meaningful within half the space; [`relative_sequence`]
//! maps the difference into `[-HALF_MAX_SEQUENCE, HALF_MAX_SEQUENCE)`.

/// Size of the sequence space.
pub const MAX_SEQUENCE: u16 = 32768;

/// Half the sequence space.
pub const HALF_MAX_SEQUENCE: i32 = MAX_SEQUENCE as i32 / 2;

/// Signed distance from `expected` to `number`.
///
/// Positive when `number` is ahead of `expected`, negative when behind.
#[inline]
pub fn relative_sequence(number: u16, expected: u16) -> i32 {
    let max = MAX_SEQUENCE as i32;
    (number as i32 - expected as i32 + max + HALF_MAX_SEQUENCE) % max - HALF_MAX_SEQUENCE
}

/// `sequence + 1` modulo the sequence space.
#[inline]
pub fn next_sequence(sequence: u16) -> u16 {
    add_sequence(sequence, 1)
}

/// `sequence + n` modulo the sequence space.
#[inline]
pub fn add_sequence(sequence: u16, n: u16) -> u16 {
    ((sequence as u32 + n as u32) % MAX_SEQUENCE as u32) as u16
}
