//! Simulated loss and latency on the receive path.

use crate::config::SimulationConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Fate of a received datagram under simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Deliver,
    Drop,
    /// Held; released by [`NetworkSimulator::release_due`].
    Delay,
}

#[derive(Debug)]
struct Parked {
    release_at: Instant,
    from: SocketAddr,
    data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct NetworkSimulator {
    config: SimulationConfig,
    rng: Mutex<StdRng>,
    parked: Mutex<Vec<Parked>>,
}

impl NetworkSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            parked: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    fn with_seed(config: SimulationConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Decide what happens to `data`; delayed datagrams are copied and parked.
    pub fn intercept(&self, from: SocketAddr, data: &[u8], now: Instant) -> Verdict {
        let delay = {
            let mut rng = self.rng.lock();
            if self.config.loss_percent > 0 && rng.gen_range(0..100u8) < self.config.loss_percent {
                return Verdict::Drop;
            }
            match self.config.latency {
                Some((min, max)) if max > Duration::ZERO => {
                    let span = (max - min).as_micros() as u64;
                    let extra = if span == 0 { 0 } else { rng.gen_range(0..=span) };
                    min + Duration::from_micros(extra)
                }
                _ => return Verdict::Deliver,
            }
        };
        self.parked.lock().push(Parked {
            release_at: now + delay,
            from,
            data: data.to_vec(),
        });
        Verdict::Delay
    }

    /// Datagrams whose delay has elapsed, in release order.
    pub fn release_due(&self, now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut due = {
            let mut parked = self.parked.lock();
            let (ready, waiting): (Vec<Parked>, Vec<Parked>) =
                parked.drain(..).partition(|p| p.release_at <= now);
            *parked = waiting;
            ready
        };
        due.sort_by_key(|p| p.release_at);
        due.into_iter().map(|p| (p.from, p.data)).collect()
    }

    #[cfg(test)]
    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }
}
