//! Monotonic time source, injectable so staleness can be tested with
//! simulated time.

use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

/// Wall-clock-independent monotonic clock, measured from construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}
