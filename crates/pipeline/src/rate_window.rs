//! Sliding-window event ledger shared by both rate limiters.
//!
//! A [`RateWindow`] remembers the instants of recently accepted events. An
//! event at `t` counts against the window while `now - t < window`; once
//! `now - t >= window` it is evicted. Eviction is lazy and happens on every
//! check, so the ledger never holds more than `capacity` entries.
//!
//! The window itself is not synchronised. Each limiter wraps it in a mutex
//! and performs evict + check + record as one critical section.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded, ordered ledger of accepted-event instants.
#[derive(Debug, Clone)]
pub struct RateWindow {
    capacity: usize,
    window: Duration,
    entries: VecDeque<Instant>,
}

impl RateWindow {
    /// Creates an empty window admitting `capacity` events per `window`.
    ///
    /// Returns `None` if `capacity` is zero or `window` is zero.
    #[must_use]
    pub fn new(capacity: usize, window: Duration) -> Option<Self> {
        if capacity == 0 || window.is_zero() {
            return None;
        }
        Some(Self {
            capacity,
            window,
            entries: VecDeque::with_capacity(capacity),
        })
    }

    /// Maximum events per window.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of events currently retained (call [`evict`](Self::evict) first
    /// for an exact count at a given instant).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no events are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry that has left the window as of `now`.
    pub fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.entries.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evicts, then records an event at `now` if a slot is free.
    ///
    /// On rejection returns the exact time until the oldest retained entry
    /// leaves the window; recording at `now + wait` is then guaranteed to
    /// succeed if nothing else is recorded in between.
    pub fn try_record(&mut self, now: Instant) -> Result<(), Duration> {
        self.evict(now);
        if self.entries.len() < self.capacity {
            // Keep insertion order non-decreasing even if a caller's clock lags.
            let at = match self.entries.back() {
                Some(&last) if last > now => last,
                _ => now,
            };
            self.entries.push_back(at);
            Ok(())
        } else {
            Err(self.wait_time(now))
        }
    }

    /// Time until the oldest retained entry expires, or zero when a slot is
    /// free at `now`.
    pub fn wait_time(&self, now: Instant) -> Duration {
        if self.entries.len() < self.capacity {
            return Duration::ZERO;
        }
        match self.entries.front() {
            Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}
