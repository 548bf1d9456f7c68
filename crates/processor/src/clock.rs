//! [`Clock`] backed by tokio's timer.
//!
//! The egress limiter sleeps with `tokio::time::sleep`, so it must measure
//! its window on the same clock. Under a paused test runtime both advance
//! together and no test waits on real time.

use std::time::Instant;

use pipeline::Clock;

/// Reads `tokio::time::Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
