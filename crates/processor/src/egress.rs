//! Egress Limiter: gates outbound calls to the analysis service.
//!
//! Two guards must both pass before a call may proceed:
//!
//! 1. **Concurrency**: a counting semaphore of `concurrency` permits.
//! 2. **Rate**: a [`RateWindow`] of `capacity` calls per `window`.
//!
//! The semaphore is taken first so no caller reserves a rate slot while it
//! is still queued for a permit. The returned [`EgressPermit`] releases the
//! concurrency slot on drop, whether the call succeeded, failed or was
//! cancelled. A rate slot is recorded only once both guards pass, so a
//! cancelled waiter never consumes one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeline::{Clock, InsightsError, RateWindow};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::TokioClock;

/// Limits for outbound analysis calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressConfig {
    /// Maximum calls in flight at once (`C`).
    pub concurrency: usize,
    /// Maximum calls started per window (`N_out`).
    pub capacity: usize,
    /// Length of the trailing window (`W_out`).
    pub window: Duration,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            capacity: 10,
            window: Duration::from_secs(1),
        }
    }
}

/// The limiter was closed; no further calls will be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("egress limiter is closed")]
pub struct EgressClosed;

/// Proof that one outbound call may proceed. Dropping it frees the
/// concurrency slot.
#[derive(Debug)]
pub struct EgressPermit {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency cap plus sliding-window rate cap, shared by every caller.
#[derive(Debug)]
pub struct EgressLimiter {
    permits: Arc<Semaphore>,
    concurrency: usize,
    window: Mutex<RateWindow>,
    clock: Arc<dyn Clock>,
}

impl EgressLimiter {
    /// Creates a limiter on tokio's clock.
    pub fn new(config: EgressConfig) -> Result<Self, InsightsError> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Creates a limiter reading time from `clock`.
    ///
    /// `clock` must advance with `tokio::time`, since waits are slept on
    /// tokio's timer.
    pub fn with_clock(config: EgressConfig, clock: Arc<dyn Clock>) -> Result<Self, InsightsError> {
        if config.concurrency == 0 {
            return Err(InsightsError::ConfigurationError {
                message: "egress concurrency must be at least 1".to_string(),
            });
        }
        let window = RateWindow::new(config.capacity, config.window).ok_or_else(|| {
            InsightsError::ConfigurationError {
                message: format!(
                    "egress rate limit needs a non-zero capacity and window (got {} per {:?})",
                    config.capacity, config.window
                ),
            }
        })?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.concurrency)),
            concurrency: config.concurrency,
            window: Mutex::new(window),
            clock,
        })
    }

    /// Waits until a call may proceed.
    ///
    /// Suspends on the semaphore, then on the rate window for exactly the
    /// time until its oldest entry expires, re-checking after each wait.
    /// Dropping the returned future at any point releases everything held.
    pub async fn acquire(&self) -> Result<EgressPermit, EgressClosed> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EgressClosed)?;

        loop {
            let wait = {
                let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
                match window.try_record(self.clock.now()) {
                    Ok(()) => break,
                    Err(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "egress rate window full");
            tokio::time::sleep(wait).await;
        }

        Ok(EgressPermit { _permit: permit })
    }

    /// Number of permits currently held.
    pub fn in_flight(&self) -> usize {
        self.concurrency - self.permits.available_permits()
    }

    /// Stops admitting calls. Current and future waiters get [`EgressClosed`].
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn limiter(concurrency: usize, capacity: usize, window_ms: u64) -> Arc<EgressLimiter> {
        Arc::new(
            EgressLimiter::new(EgressConfig {
                concurrency,
                capacity,
                window: Duration::from_millis(window_ms),
            })
            .unwrap(),
        )
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(EgressLimiter::new(EgressConfig {
            concurrency: 0,
            ..EgressConfig::default()
        })
        .is_err());
        assert!(EgressLimiter::new(EgressConfig {
            capacity: 0,
            ..EgressConfig::default()
        })
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_concurrency() {
        let limiter = limiter(3, 1_000, 1_000);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_window_spaces_out_calls() {
        let limiter = limiter(100, 10, 1_000);
        let start = Instant::now();
        let mut starts = Vec::new();
        for _ in 0..25 {
            let _permit = limiter.acquire().await.unwrap();
            starts.push(Instant::now() - start);
        }
        // First 10 immediately, next 10 after one window, last 5 after two.
        assert!(starts[..10].iter().all(|d| *d == Duration::ZERO));
        assert!(starts[10..20].iter().all(|d| *d == Duration::from_secs(1)));
        assert!(starts[20..].iter().all(|d| *d == Duration::from_secs(2)));

        for (i, &s) in starts.iter().enumerate() {
            let in_window = starts[i..]
                .iter()
                .take_while(|&&t| t - s < Duration::from_secs(1))
                .count();
            assert!(in_window <= 10);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_does_not_wake_early() {
        let limiter = limiter(10, 1, 1_000);
        let start = Instant::now();
        drop(limiter.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(limiter.acquire().await.unwrap());
        assert_eq!(Instant::now() - start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn permit_released_when_holder_fails() {
        let limiter = limiter(1, 100, 1_000);
        let result: Result<(), &str> = async {
            let _permit = limiter.acquire().await.unwrap();
            Err("call failed")
        }
        .await;
        assert!(result.is_err());
        assert_eq!(limiter.in_flight(), 0);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_releases_permit_and_slot() {
        let limiter = limiter(1, 1, 1_000);
        let first = limiter.acquire().await.unwrap();
        drop(first);

        // Holds the only permit while waiting on the full rate window.
        let waiting = tokio::time::timeout(Duration::from_millis(100), limiter.acquire()).await;
        assert!(waiting.is_err());
        assert_eq!(limiter.in_flight(), 0);

        // The cancelled waiter recorded nothing: the next call is due when
        // the first call's entry expires, not later.
        let start = Instant::now();
        drop(limiter.acquire().await.unwrap());
        assert_eq!(Instant::now() - start, Duration::from_millis(900));
    }

    #[tokio::test]
    async fn closed_limiter_refuses_waiters() {
        let limiter = limiter(1, 1, 1_000);
        limiter.close();
        assert_eq!(limiter.acquire().await.unwrap_err(), EgressClosed);
    }
}
