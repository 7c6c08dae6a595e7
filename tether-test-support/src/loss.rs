//! Datagram loss for link simulation.
//!
//! Decisions are keyed by the index of the datagram on the link (0, 1, 2...),
//! not by any transport sequence number, so patterns stay meaningful for
//! control traffic, acks and resends alike.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// Whether a datagram survives the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDecision {
    Drop,
    Pass,
}

/// Which datagrams to drop.
#[derive(Debug, Clone)]
pub enum LossPattern {
    /// No loss
    None,
    /// Drop every Nth datagram (the Nth, 2Nth, ...)
    EveryNth { n: usize },
    /// Drop with the given probability (0.0-1.0)
    Random { probability: f64 },
    /// Drop `length` consecutive datagrams starting at `start`
    Burst { start: u64, length: u64 },
    /// Drop exactly these datagram indices
    Indices(HashSet<u64>),
}

/// Decides datagram fate along a simulated link.
///
/// # Example
///
/// ```
/// use tether_test_support::loss::{DropDecision, LossGenerator};
///
/// let mut gen = LossGenerator::every_nth(3);
/// let dropped = (0..9)
///     .filter(|_| gen.next_decision() == DropDecision::Drop)
///     .count();
/// assert_eq!(dropped, 3);
/// ```
#[derive(Debug)]
pub struct LossGenerator {
    pattern: LossPattern,
    index: u64,
    dropped: u64,
    rng: StdRng,
}

impl LossGenerator {
    pub fn new(pattern: LossPattern) -> Self {
        Self::with_seed(pattern, 0x7e7e_7e7e)
    }

    /// Fixed seed so random patterns are reproducible.
    pub fn with_seed(pattern: LossPattern, seed: u64) -> Self {
        Self {
            pattern,
            index: 0,
            dropped: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn none() -> Self {
        Self::new(LossPattern::None)
    }

    pub fn every_nth(n: usize) -> Self {
        Self::new(LossPattern::EveryNth { n })
    }

    pub fn random(probability: f64) -> Self {
        Self::new(LossPattern::Random {
            probability: probability.clamp(0.0, 1.0),
        })
    }

    pub fn burst(start: u64, length: u64) -> Self {
        Self::new(LossPattern::Burst { start, length })
    }

    pub fn indices(indices: impl IntoIterator<Item = u64>) -> Self {
        Self::new(LossPattern::Indices(indices.into_iter().collect()))
    }

    /// Decide the fate of the next datagram on the link.
    pub fn next_decision(&mut self) -> DropDecision {
        let index = self.index;
        self.index += 1;
        let drop = match &self.pattern {
            LossPattern::None => false,
            LossPattern::EveryNth { n } => *n > 0 && (index + 1) % *n as u64 == 0,
            LossPattern::Random { probability } => self.rng.gen::<f64>() < *probability,
            LossPattern::Burst { start, length } => index >= *start && index < start + length,
            LossPattern::Indices(set) => set.contains(&index),
        };
        if drop {
            self.dropped += 1;
            DropDecision::Drop
        } else {
            DropDecision::Pass
        }
    }

    pub fn stats(&self) -> LossStats {
        LossStats {
            seen: self.index,
            dropped: self.dropped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossStats {
    pub seen: u64,
    pub dropped: u64,
}

impl LossStats {
    pub fn drop_rate(&self) -> f64 {
        if self.seen == 0 {
            0.0
        } else {
            self.dropped as f64 / self.seen as f64
        }
    }
}
