//! Clock port - 時刻の抽象化
//!
//! All delay and timeout deadlines are computed from `Clock::now_ns`, so it
//! has to be monotonic. `SystemClock` anchors a monotonic `Instant` to the
//! wall clock once, at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;

/// Nanoseconds since the Unix epoch, never decreasing.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Production clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    epoch_ns: u64,
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let epoch_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        Self {
            epoch_ns,
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        self.epoch_ns + self.origin.elapsed().as_nanos() as u64
    }
}

/// Test clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by_ns = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .now_ns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(by_ns))
            });
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}
