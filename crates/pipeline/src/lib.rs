//! Core domain for the insights pipeline.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, error type and port trait used by the ingestion-to-insight pipeline.
//! Infrastructure crates implement the traits defined here; they never add
//! domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`WorkItemId`) |
//! | [`types`] | Work items, state machine, scores, categories, analysis results |
//! | [`errors`] | Error taxonomy and [`RetryPolicy`] |
//! | [`clock`] | Monotonic clock port and test double |
//! | [`rate_window`] | Sliding-window ledger shared by both limiters |
//! | [`admission`] | Admission Limiter for inbound work |
//! | [`query`] | Insight query and page types |
//! | [`ports`] | `WorkStore`, `InsightReader`, `AnalysisService` traits |

pub mod admission;
pub mod clock;
pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod query;
pub mod rate_window;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use admission::{AdmissionConfig, AdmissionLimiter, MIN_RETRY_AFTER};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{AdmissionRejected, AnalysisError, InsightsError, RetryPolicy, StoreError};
pub use identifiers::WorkItemId;
pub use ports::{AnalysisRequest, AnalysisService, InsightReader, WorkStore};
pub use query::{Insight, InsightPage, InsightQuery, SentimentFilter, DEFAULT_LIMIT, MAX_LIMIT};
pub use rate_window::RateWindow;
pub use types::{
    Analysis, AnalysisOrigin, AnalysisResult, Categories, Confidence, FallbackCause,
    PolarityScore, Timestamp, WorkItem, WorkPayload, WorkState,
};
