//! Environment service: time and randomness.
//!
//! `now_ns` is the only time source used for delay and timeout deadlines.
//! The random helpers feed scheduling jitter and retry backoff; a seed from
//! the config makes a run reproducible.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ports::{Clock, SystemClock};

pub struct Environment {
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

impl Environment {
    pub fn new(clock: Arc<dyn Clock>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            clock,
            rng: Mutex::new(rng),
        }
    }

    /// System clock, entropy-seeded RNG.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock::new()), None)
    }

    /// Nanoseconds since the Unix epoch, non-decreasing.
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn now_us(&self) -> u64 {
        self.now_ns() / 1_000
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }

    /// Absolute deadline (`now_ns` scale) `delay` from now.
    pub fn deadline_after(&self, delay: Duration) -> u64 {
        let delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        self.now_ns().saturating_add(delay_ns)
    }

    /// Uniform integer in `[min, max]`. Bounds given in the wrong order are
    /// swapped.
    pub fn random64(&self, min: u64, max: u64) -> u64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(lo..=hi)
    }

    pub fn random32(&self, min: u32, max: u32) -> u32 {
        self.random64(min as u64, max as u64) as u32
    }

    /// Uniform value in `[0, 1]` with nine decimal digits of resolution.
    pub fn probability(&self) -> f64 {
        self.random32(0, 1_000_000_000) as f64 / 1_000_000_000.0
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::system()
    }
}
