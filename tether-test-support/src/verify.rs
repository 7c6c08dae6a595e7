//! Payload generation and delivery verification.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const ID_SIZE: usize = 8;

/// Build a self-describing payload of `len` bytes (at least 8) for message `id`.
///
/// The first eight bytes carry the id; the rest is a fill derived from it so
/// truncation or corruption is detectable by [`parse_message`].
pub fn make_message(id: u64, len: usize) -> Vec<u8> {
    let len = len.max(ID_SIZE);
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend((ID_SIZE..len).map(|i| fill_byte(id, i)));
    buf
}

/// Recover the id from a payload built by [`make_message`].
///
/// Returns `None` if the payload is short or its fill does not match.
pub fn parse_message(payload: &[u8]) -> Option<u64> {
    if payload.len() < ID_SIZE {
        return None;
    }
    let mut id_bytes = [0u8; ID_SIZE];
    id_bytes.copy_from_slice(&payload[..ID_SIZE]);
    let id = u64::from_le_bytes(id_bytes);
    payload[ID_SIZE..]
        .iter()
        .enumerate()
        .all(|(i, b)| *b == fill_byte(id, i + ID_SIZE))
        .then_some(id)
}

#[inline]
fn fill_byte(id: u64, index: usize) -> u8 {
    // FNV-1a style mix of id and position
    let mut hash: u64 = 0xcbf29ce484222325;
    hash ^= id;
    hash = hash.wrapping_mul(0x100000001b3);
    hash ^= index as u64;
    hash = hash.wrapping_mul(0x100000001b3);
    (hash >> 24) as u8
}

/// Records delivered message ids for later checking.
///
/// Safe to share between the receive callback and the test body.
#[derive(Debug, Default)]
pub struct DeliveryLog {
    ids: Mutex<Vec<u64>>,
    malformed: Mutex<usize>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered payload.
    pub fn record(&self, payload: &[u8]) {
        match parse_message(payload) {
            Some(id) => self.ids.lock().unwrap().push(id),
            None => *self.malformed.lock().unwrap() += 1,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<u64> {
        self.ids.lock().unwrap().clone()
    }

    /// Summarise deliveries against the expected ids `0..expected`.
    pub fn report(&self, expected: u64) -> DeliveryReport {
        let ids = self.ids.lock().unwrap();
        let mut counts: HashMap<u64, usize> = HashMap::new();
        for id in ids.iter() {
            *counts.entry(*id).or_default() += 1;
        }
        let unique: HashSet<u64> = counts.keys().copied().collect();
        DeliveryReport {
            delivered: ids.len(),
            duplicates: counts.values().filter(|c| **c > 1).map(|c| c - 1).sum(),
            missing: (0..expected).filter(|id| !unique.contains(id)).count(),
            unexpected: unique.iter().filter(|id| **id >= expected).count(),
            in_order: ids.windows(2).all(|w| w[0] < w[1]),
            malformed: *self.malformed.lock().unwrap(),
        }
    }
}

/// Outcome of [`DeliveryLog::report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub duplicates: usize,
    pub missing: usize,
    pub unexpected: usize,
    /// Every delivery had a strictly larger id than the one before
    pub in_order: bool,
    pub malformed: usize,
}

impl DeliveryReport {
    /// Every expected id exactly once, nothing else.
    pub fn is_exactly_once(&self) -> bool {
        self.duplicates == 0 && self.missing == 0 && self.unexpected == 0 && self.malformed == 0
    }

    /// Exactly once and in send order.
    pub fn is_perfect(&self) -> bool {
        self.is_exactly_once() && self.in_order
    }
}
