//! Idle backoff for the run loop.

use std::time::Duration;

/// Exponential sleep interval for idle loop iterations, capped at
/// `base * 2^max_doublings` and reset on any activity.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_doublings: u32,
    doublings: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_doublings: u32) -> Self {
        Self {
            base,
            max_doublings,
            doublings: 0,
        }
    }

    /// Delay for this idle iteration; grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current();
        if self.doublings < self.max_doublings {
            self.doublings += 1;
        }
        delay
    }

    pub fn current(&self) -> Duration {
        self.base.saturating_mul(1u32 << self.doublings.min(31))
    }

    pub fn reset(&mut self) {
        self.doublings = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), 6)
    }
}
