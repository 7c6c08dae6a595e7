//! Link chaos: duplication, reordering and corruption of datagrams.
//!
//! Loss lives in [`loss`](crate::loss); this module covers the other ways a
//! UDP path misbehaves.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// What the link does with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Deliver unchanged
    Deliver,
    /// Deliver twice
    Duplicate,
    /// Hold back and deliver after the next datagram
    Reorder,
    /// Flip one byte, then deliver
    Corrupt,
}

/// Applies random link misbehaviour to a datagram stream.
///
/// # Example
///
/// ```
/// use tether_test_support::chaos::LinkChaos;
///
/// let mut chaos = LinkChaos::new().with_duplicate_probability(1.0);
/// let out = chaos.apply(vec![1, 2, 3]);
/// assert_eq!(out, vec![vec![1, 2, 3], vec![1, 2, 3]]);
/// ```
#[derive(Debug)]
pub struct LinkChaos {
    duplicate_probability: f64,
    reorder_probability: f64,
    corrupt_probability: f64,
    held: Option<Vec<u8>>,
    rng: StdRng,
    events: usize,
}

impl Default for LinkChaos {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkChaos {
    pub fn new() -> Self {
        Self {
            duplicate_probability: 0.0,
            reorder_probability: 0.0,
            corrupt_probability: 0.0,
            held: None,
            rng: StdRng::seed_from_u64(0xc4a05),
            events: 0,
        }
    }

    /// Duplicates and reorders often, never corrupts.
    pub fn shuffling() -> Self {
        Self::new()
            .with_duplicate_probability(0.1)
            .with_reorder_probability(0.2)
    }

    pub fn with_duplicate_probability(mut self, prob: f64) -> Self {
        self.duplicate_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_reorder_probability(mut self, prob: f64) -> Self {
        self.reorder_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_corrupt_probability(mut self, prob: f64) -> Self {
        self.corrupt_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Pick an action for the next datagram.
    pub fn decide(&mut self) -> LinkAction {
        let roll: f64 = self.rng.gen();
        let mut edge = self.duplicate_probability;
        if roll < edge {
            return LinkAction::Duplicate;
        }
        edge += self.reorder_probability;
        if roll < edge {
            return LinkAction::Reorder;
        }
        edge += self.corrupt_probability;
        if roll < edge {
            return LinkAction::Corrupt;
        }
        LinkAction::Deliver
    }

    /// Push one datagram through the link, returning what comes out now.
    pub fn apply(&mut self, mut datagram: Vec<u8>) -> Vec<Vec<u8>> {
        let action = self.decide();
        if action != LinkAction::Deliver {
            self.events += 1;
        }
        let mut out = Vec::with_capacity(3);
        match action {
            LinkAction::Deliver => out.push(datagram),
            LinkAction::Duplicate => {
                out.push(datagram.clone());
                out.push(datagram);
            }
            LinkAction::Corrupt => {
                if !datagram.is_empty() {
                    let at = self.rng.gen_range(0..datagram.len());
                    datagram[at] ^= 0xFF;
                }
                out.push(datagram);
            }
            LinkAction::Reorder => {
                // Only one datagram is held at a time; a second reorder
                // releases the first.
                if let Some(previous) = self.held.replace(datagram) {
                    out.push(previous);
                }
                return out;
            }
        }
        if let Some(held) = self.held.take() {
            out.push(held);
        }
        out
    }

    /// Release any held datagram.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        self.held.take()
    }

    pub fn events_triggered(&self) -> usize {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_chaos() {
        let mut chaos = LinkChaos::new();
        for i in 0..50u8 {
            assert_eq!(chaos.apply(vec![i]), vec![vec![i]]);
        }
        assert_eq!(chaos.events_triggered(), 0);
    }

    #[test]
    fn test_reorder_swaps_with_next() {
        let mut chaos = LinkChaos::new().with_reorder_probability(1.0);
        assert!(chaos.apply(vec![1]).is_empty());
        assert_eq!(chaos.apply(vec![2]), vec![vec![1]]);
        assert_eq!(chaos.flush(), Some(vec![2]));
    }

    #[test]
    fn test_corrupt_changes_one_byte() {
        let mut chaos = LinkChaos::new().with_corrupt_probability(1.0);
        let out = chaos.apply(vec![0u8; 8]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].iter().filter(|b| **b != 0).count(), 1);
    }

    #[test]
    fn test_shuffling_preserves_everything() {
        let mut chaos = LinkChaos::shuffling();
        let mut seen = Vec::new();
        for i in 0..200u8 {
            seen.extend(chaos.apply(vec![i]));
        }
        seen.extend(chaos.flush());
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 200);
        assert!(chaos.events_triggered() > 0);
    }
}
