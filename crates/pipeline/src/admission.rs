//! Admission Limiter: gates inbound work creation.
//!
//! A fixed-capacity window of recent admissions shared by every inbound
//! caller. [`AdmissionLimiter::try_acquire`] never waits; a full window
//! yields an [`AdmissionRejected`] carrying the delay after which a retry
//! would succeed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::{AdmissionRejected, Clock, InsightsError, RateWindow, SystemClock};

/// Smallest `retry_after` ever reported, so callers never spin on zero.
pub const MIN_RETRY_AFTER: Duration = Duration::from_millis(1);

/// Capacity and window of the Admission Limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Maximum admissions per window (`N_in`).
    pub capacity: usize,
    /// Length of the trailing window (`W_in`).
    pub window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            window: Duration::from_secs(1),
        }
    }
}

/// Non-blocking fixed-window admission gate.
///
/// One instance is shared (via `Arc`) by all request handlers; tests create
/// isolated instances per case.
#[derive(Debug)]
pub struct AdmissionLimiter {
    window: Mutex<RateWindow>,
    clock: Arc<dyn Clock>,
}

impl AdmissionLimiter {
    /// Creates a limiter on the system clock.
    pub fn new(config: AdmissionConfig) -> Result<Self, InsightsError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a limiter reading time from `clock`.
    pub fn with_clock(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Result<Self, InsightsError> {
        let window = RateWindow::new(config.capacity, config.window).ok_or_else(|| {
            InsightsError::ConfigurationError {
                message: format!(
                    "admission limiter needs a non-zero capacity and window (got {} per {:?})",
                    config.capacity, config.window
                ),
            }
        })?;
        Ok(Self {
            window: Mutex::new(window),
            clock,
        })
    }

    /// Admits one request or rejects it immediately.
    ///
    /// Evict, check and record happen under a single lock, so two callers
    /// can never both take the last free slot.
    pub fn try_acquire(&self) -> Result<(), AdmissionRejected> {
        let mut window = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.clock.now();
        match window.try_record(now) {
            Ok(()) => Ok(()),
            Err(wait) => {
                let retry_after = wait.max(MIN_RETRY_AFTER);
                debug!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    capacity = window.capacity(),
                    "admission rejected"
                );
                Err(AdmissionRejected { retry_after })
            }
        }
    }
}
