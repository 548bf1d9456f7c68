//! Shared value types for the insights pipeline domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (polarity is in `[-1.0, 1.0]`, confidence
//! in `[0.0, 1.0]`, category sets are never empty) and move between the
//! Orchestrator, the Analysis Client and the store.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::WorkItemId;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parses an RFC 3339 / ISO 8601 string with any offset, normalising to UTC.
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Parses ISO 8601 input as sent by HTTP clients: RFC 3339 with an
    /// offset, or a naive `YYYY-MM-DDTHH:MM:SS[.frac]` read as UTC.
    pub fn parse_iso8601(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::parse_rfc3339(value).or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| Self(naive.and_utc()))
        })
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns this timestamp moved `delta` into the past, saturating at the
    /// earliest representable instant.
    pub fn saturating_sub(self, delta: Duration) -> Self {
        chrono::Duration::from_std(delta)
            .ok()
            .and_then(|d| self.0.checked_sub_signed(d))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MIN_UTC))
    }

    /// Formats the timestamp as RFC 3339 with microsecond precision.
    ///
    /// The fixed width makes the text form sort lexically in time order,
    /// which the SQL store relies on.
    pub fn to_rfc3339(self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Work item lifecycle
// ---------------------------------------------------------------------------

/// Processing state of a [`WorkItem`].
///
/// ```text
/// pending ──► processing ──► completed
///                       └──► failed
/// ```
///
/// `pending` is set by the admission path. Only the Batch Orchestrator moves
/// an item forward, and nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    /// Admitted and waiting to be discovered.
    Pending,
    /// Claimed by a dispatch cycle; analysis in flight.
    Processing,
    /// Analysis committed together with its result.
    Completed,
    /// Could not be analysed or committed; no result exists.
    Failed,
}

impl WorkState {
    /// Returns `true` for states with no outgoing transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` if `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: WorkState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }

    /// Stable lowercase name, used for persistence and logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Inverse of [`WorkState::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------

/// Content submitted for analysis.
///
/// The pipeline never interprets the payload beyond handing `text` to the
/// Analysis Client; `author` and `metadata` are carried through for the
/// query layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPayload {
    /// The text to analyse. Never blank.
    pub text: String,

    /// Optional author or handle of the text.
    pub author: Option<String>,

    /// Arbitrary caller-supplied metadata (e.g. the original event document).
    pub metadata: Option<serde_json::Value>,
}

impl WorkPayload {
    /// Creates a payload from `text`, trimming surrounding whitespace.
    ///
    /// Returns `None` if the trimmed text is empty.
    pub fn from_text(text: impl AsRef<str>) -> Option<Self> {
        let trimmed = text.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self {
                text: trimmed.to_string(),
                author: None,
                metadata: None,
            })
        }
    }

    /// Sets the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ---------------------------------------------------------------------------

/// One unit submitted for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Immutable identity.
    pub id: WorkItemId,

    /// Opaque content handed to the Analysis Client.
    pub payload: WorkPayload,

    /// Current lifecycle state.
    pub state: WorkState,

    /// When the item was admitted. Discovery orders by this, oldest first.
    pub submitted_at: Timestamp,

    /// When the content itself was produced (defaults to `submitted_at`).
    /// Insight queries filter on this.
    pub occurred_at: Timestamp,

    /// When `state` last changed. Drives stale-claim recovery.
    pub state_changed_at: Timestamp,
}

impl WorkItem {
    /// Creates a new `pending` item with a fresh identifier.
    pub fn new(payload: WorkPayload, occurred_at: Option<Timestamp>, now: Timestamp) -> Self {
        Self {
            id: WorkItemId::new_random(),
            payload,
            state: WorkState::Pending,
            submitted_at: now,
            occurred_at: occurred_at.unwrap_or(now),
            state_changed_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Score types
// ---------------------------------------------------------------------------

/// Sentiment polarity in the range `[-1.0, 1.0]` (negative to positive).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct PolarityScore(f64);

impl PolarityScore {
    /// The neutral score used by fallback results.
    pub const NEUTRAL: Self = Self(0.0);

    /// Creates a [`PolarityScore`], returning `None` if `value` is outside
    /// `[-1.0, 1.0]` or not finite.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (-1.0..=1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Clamps `value` into range. Returns `None` only for NaN.
    #[must_use]
    pub fn clamped(value: f64) -> Option<Self> {
        if value.is_nan() {
            None
        } else {
            Some(Self(value.clamp(-1.0, 1.0)))
        }
    }

    /// Returns the score as an `f64` in `[-1.0, 1.0]`.
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for PolarityScore {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("polarity {value} outside [-1.0, 1.0]"))
    }
}

impl From<PolarityScore> for f64 {
    fn from(score: PolarityScore) -> Self {
        score.0
    }
}

impl std::fmt::Display for PolarityScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

// ---------------------------------------------------------------------------

/// Confidence of an analysis in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    /// Zero confidence, used by fallback results.
    pub const NONE: Self = Self(0.0);

    /// Creates a [`Confidence`], returning `None` if `value` is outside
    /// `[0.0, 1.0]` or not finite.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Clamps `value` into range. Returns `None` only for NaN.
    #[must_use]
    pub fn clamped(value: f64) -> Option<Self> {
        if value.is_nan() {
            None
        } else {
            Some(Self(value.clamp(0.0, 1.0)))
        }
    }

    /// Returns the confidence as an `f64` in `[0.0, 1.0]`.
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("confidence {value} outside [0.0, 1.0]"))
    }
}

impl From<Confidence> for f64 {
    fn from(confidence: Confidence) -> Self {
        confidence.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// A non-empty, order-insignificant set of topic labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Categories(BTreeSet<String>);

impl Categories {
    /// Label used when no category could be determined.
    pub const UNKNOWN: &'static str = "unknown";

    /// Builds a set from raw labels. Labels are trimmed; blank labels and
    /// duplicates are dropped.
    ///
    /// Returns `None` if no label survives.
    pub fn new<I, S>(labels: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = labels
            .into_iter()
            .map(|l| l.as_ref().trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if set.is_empty() {
            None
        } else {
            Some(Self(set))
        }
    }

    /// The `{"unknown"}` set carried by fallback results.
    pub fn unknown() -> Self {
        Self(BTreeSet::from([Self::UNKNOWN.to_string()]))
    }

    /// Returns `true` if `label` is in the set.
    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    /// Number of labels (always at least one).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; present for API symmetry with collections.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the labels in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl TryFrom<Vec<String>> for Categories {
    type Error = String;

    fn try_from(labels: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(labels).ok_or_else(|| "category set must not be empty".to_string())
    }
}

impl From<Categories> for Vec<String> {
    fn from(categories: Categories) -> Self {
        categories.0.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Analysis outcome
// ---------------------------------------------------------------------------

/// Why the Analysis Client substituted a fallback result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackCause {
    /// The service answered, but no usable analysis could be recovered.
    MalformedResponse,
    /// Every attempt failed with a transient transport or rate-limit error.
    ExhaustedRetries,
    /// The service refused the request with a non-retryable error.
    Rejected,
}

/// Where an [`Analysis`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "cause")]
pub enum AnalysisOrigin {
    /// Parsed from a well-formed service response.
    Model,
    /// Deterministic substitute; see [`FallbackCause`].
    Fallback(FallbackCause),
}

impl AnalysisOrigin {
    /// Stable name, used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Fallback(FallbackCause::MalformedResponse) => "fallback:malformed_response",
            Self::Fallback(FallbackCause::ExhaustedRetries) => "fallback:exhausted_retries",
            Self::Fallback(FallbackCause::Rejected) => "fallback:rejected",
        }
    }

    /// Inverse of [`AnalysisOrigin::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "model" => Some(Self::Model),
            "fallback:malformed_response" => Some(Self::Fallback(FallbackCause::MalformedResponse)),
            "fallback:exhausted_retries" => Some(Self::Fallback(FallbackCause::ExhaustedRetries)),
            "fallback:rejected" => Some(Self::Fallback(FallbackCause::Rejected)),
            _ => None,
        }
    }

    /// Returns `true` for fallback results.
    pub fn is_fallback(self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

// ---------------------------------------------------------------------------

/// The outcome of analysing one payload, before it is bound to a work item.
///
/// Every constructor upholds the result invariants: polarity and confidence
/// are in range by type, and `categories` is non-empty by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Sentiment polarity.
    pub polarity: PolarityScore,
    /// Topic labels.
    pub categories: Categories,
    /// Confidence in the analysis.
    pub confidence: Confidence,
    /// Free-text rationale, if any.
    pub explanation: Option<String>,
    /// Last response text received from the service (empty if none).
    pub raw_response: String,
    /// Model-derived or fallback.
    pub origin: AnalysisOrigin,
}

impl Analysis {
    /// Builds the deterministic low-confidence fallback result.
    pub fn fallback(
        cause: FallbackCause,
        explanation: impl Into<String>,
        raw_response: impl Into<String>,
    ) -> Self {
        Self {
            polarity: PolarityScore::NEUTRAL,
            categories: Categories::unknown(),
            confidence: Confidence::NONE,
            explanation: Some(explanation.into()),
            raw_response: raw_response.into(),
            origin: AnalysisOrigin::Fallback(cause),
        }
    }

    /// Binds this analysis to the item it describes.
    pub fn into_result(self, work_item_id: WorkItemId, created_at: Timestamp) -> AnalysisResult {
        AnalysisResult {
            work_item_id,
            polarity: self.polarity,
            categories: self.categories,
            confidence: self.confidence,
            explanation: self.explanation,
            raw_response: self.raw_response,
            origin: self.origin,
            created_at,
        }
    }
}

/// The persisted outcome attached to one [`WorkItem`]. Created at most once
/// per item and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// The item this result describes.
    pub work_item_id: WorkItemId,
    /// Sentiment polarity.
    pub polarity: PolarityScore,
    /// Topic labels.
    pub categories: Categories,
    /// Confidence in the analysis.
    pub confidence: Confidence,
    /// Free-text rationale, if any.
    pub explanation: Option<String>,
    /// Response text retained for diagnostics.
    pub raw_response: String,
    /// Model-derived or fallback.
    pub origin: AnalysisOrigin,
    /// When the result was committed.
    pub created_at: Timestamp,
}
