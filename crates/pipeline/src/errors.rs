//! Error and retry-policy types for the insights pipeline domain.
//!
//! [`InsightsError`] covers invalid configuration and invalid queries, the
//! conditions callers must fix before trying again. Component errors
//! ([`AnalysisError`] for egress calls, [`StoreError`] for persistence) live
//! beside it so every crate speaks the same vocabulary.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{WorkItemId, WorkState};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by component error types to let the Analysis Client decide
/// whether to re-issue a call or degrade to a fallback result.
///
/// - `Retryable` errors: transport failures, timeouts, rate-limit responses,
///   unparseable bodies.
/// - `NonRetryable` errors: authentication/validation rejections, responses
///   whose fields cannot be recovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Top-level errors
// ---------------------------------------------------------------------------

/// Errors a caller must correct before the operation can succeed.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum InsightsError {
    /// The runtime configuration is invalid.
    ///
    /// Produced at load time; the service never starts with an invalid config.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },

    /// An insight query's parameters are inconsistent or out of range.
    #[error("Invalid query: {message}")]
    InvalidQuery {
        /// Description of the offending parameter.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Control signal returned by the Admission Limiter when the inbound window
/// is full. Not a failure: the caller should retry after `retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission rejected; retry after {retry_after:?}")]
pub struct AdmissionRejected {
    /// Time until the oldest admission leaves the window.
    pub retry_after: Duration,
}

impl AdmissionRejected {
    /// The delay as fractional seconds.
    pub fn retry_after_seconds(&self) -> f64 {
        self.retry_after.as_secs_f64()
    }

    /// The delay rounded up to whole seconds, at least 1, as used by the
    /// HTTP `Retry-After` header.
    pub fn retry_after_whole_seconds(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }
}

// ---------------------------------------------------------------------------
// Egress
// ---------------------------------------------------------------------------

/// Failure of a single call to the external analysis service.
///
/// Never surfaced past the Analysis Client: it either retries or degrades
/// to a fallback result.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// Connection, DNS, TLS or 5xx-class failure.
    #[error("transport failure: {message}")]
    Transport {
        /// Description from the transport layer.
        message: String,
    },

    /// The attempt exceeded its per-call time limit.
    #[error("call timed out after {limit:?}")]
    Timeout {
        /// The configured limit that elapsed.
        limit: Duration,
    },

    /// The service asked us to slow down.
    #[error("rate limited by analysis service")]
    RateLimited {
        /// Server-specified delay, if the response carried one.
        retry_after: Option<Duration>,
    },

    /// The service refused the request (authentication, bad request).
    #[error("request rejected (status {status:?}): {message}")]
    Rejected {
        /// HTTP status, if the transport has one.
        status: Option<u16>,
        /// Response body or description.
        message: String,
    },

    /// The response body could not be decoded as JSON at all.
    #[error("unparseable response: {message}")]
    Unparseable {
        /// Decoder message.
        message: String,
        /// The text as received.
        raw: String,
    },

    /// The response was JSON but required fields are absent or invalid.
    #[error("malformed response: {message}")]
    Malformed {
        /// Which field could not be recovered.
        message: String,
        /// The text as received.
        raw: String,
    },
}

impl AnalysisError {
    /// Classifies this error for the retry loop.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Unparseable { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Rejected { .. } | Self::Malformed { .. } => RetryPolicy::NonRetryable,
        }
    }

    /// The response text attached to this error, if one was received.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Self::Unparseable { raw, .. } | Self::Malformed { raw, .. } => Some(raw),
            Self::Rejected { message, .. } => Some(message),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Failure of a store operation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No item with this identifier exists.
    #[error("work item {0} not found")]
    NotFound(WorkItemId),

    /// An item with this identifier was already created.
    #[error("work item {0} already exists")]
    AlreadyExists(WorkItemId),

    /// Compare-and-set failed: the item is not in the expected state.
    #[error("work item {id} is {actual}, expected {expected}")]
    StateConflict {
        /// The item.
        id: WorkItemId,
        /// State the caller expected.
        expected: WorkState,
        /// State actually stored.
        actual: WorkState,
    },

    /// The requested edge does not exist in the state machine.
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        /// Source state.
        from: WorkState,
        /// Target state.
        to: WorkState,
    },

    /// A result already exists for this item.
    #[error("work item {0} already has a result")]
    DuplicateResult(WorkItemId),

    /// The backing store could not be reached or the operation failed.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Underlying error description.
        message: String,
    },

    /// Stored data could not be decoded into domain types.
    #[error("corrupt record: {message}")]
    Corrupt {
        /// What could not be decoded.
        message: String,
    },
}

impl StoreError {
    /// Classifies this error for callers that retry store operations.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Unavailable { .. } => RetryPolicy::Retryable { after: None },
            _ => RetryPolicy::NonRetryable,
        }
    }
}
