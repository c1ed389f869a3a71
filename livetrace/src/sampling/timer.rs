//! Monotonic microsecond timer

use std::time::Instant;

/// Microseconds elapsed since construction
#[derive(Debug, Clone, Copy)]
pub struct UsTimer {
    start: Instant,
}

impl Default for UsTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl UsTimer {
    #[must_use]
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    #[must_use]
    pub fn now_us(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}
