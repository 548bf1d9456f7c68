//! Insight query types shared by the stores and the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::{
    AnalysisOrigin, AnalysisResult, Categories, Confidence, InsightsError, PolarityScore,
    Timestamp, WorkItem, WorkItemId,
};

/// Default page size.
pub const DEFAULT_LIMIT: usize = 100;

/// Largest page a caller may request.
pub const MAX_LIMIT: usize = 1_000;

/// Coarse sentiment bucket derived from polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentFilter {
    /// Polarity above [`SentimentFilter::NEUTRAL_BAND`].
    Positive,
    /// Polarity below `-NEUTRAL_BAND`.
    Negative,
    /// Polarity within `[-NEUTRAL_BAND, NEUTRAL_BAND]`.
    Neutral,
}

impl SentimentFilter {
    /// Half-width of the neutral band.
    pub const NEUTRAL_BAND: f64 = 0.1;

    /// Returns `true` if `polarity` falls in this bucket.
    pub fn matches(self, polarity: PolarityScore) -> bool {
        let p = polarity.as_f64();
        match self {
            Self::Positive => p > Self::NEUTRAL_BAND,
            Self::Negative => p < -Self::NEUTRAL_BAND,
            Self::Neutral => (-Self::NEUTRAL_BAND..=Self::NEUTRAL_BAND).contains(&p),
        }
    }

    /// Parses `positive` / `negative` / `neutral`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

/// Filter over committed results.
#[derive(Debug, Clone, PartialEq)]
pub struct InsightQuery {
    /// Inclusive lower bound on the item's `occurred_at`.
    pub start: Timestamp,
    /// Inclusive upper bound on the item's `occurred_at`.
    pub end: Timestamp,
    /// Maximum insights returned.
    pub limit: usize,
    /// Drop results below this confidence.
    pub min_confidence: Option<Confidence>,
    /// Keep only this sentiment bucket.
    pub sentiment: Option<SentimentFilter>,
}

impl InsightQuery {
    /// Query over `[start, end]` with the default limit and no filters.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end,
            limit: DEFAULT_LIMIT,
            min_confidence: None,
            sentiment: None,
        }
    }

    /// Checks range ordering and the page-size bounds.
    pub fn validate(&self) -> Result<(), InsightsError> {
        if self.start > self.end {
            return Err(InsightsError::InvalidQuery {
                message: format!("start_time {} is after end_time {}", self.start, self.end),
            });
        }
        if !(1..=MAX_LIMIT).contains(&self.limit) {
            return Err(InsightsError::InvalidQuery {
                message: format!("limit must be between 1 and {MAX_LIMIT}, got {}", self.limit),
            });
        }
        Ok(())
    }

    /// In-memory predicate; SQL stores express the same conditions in SQL.
    pub fn matches(&self, item: &WorkItem, result: &AnalysisResult) -> bool {
        item.occurred_at >= self.start
            && item.occurred_at <= self.end
            && self
                .min_confidence
                .map_or(true, |min| result.confidence >= min)
            && self.sentiment.map_or(true, |s| s.matches(result.polarity))
    }
}

/// One committed result joined with the item it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// The analysed item.
    pub work_item_id: WorkItemId,
    /// When the content was produced.
    pub occurred_at: Timestamp,
    /// The analysed text.
    pub text: String,
    /// Author of the text, if known.
    pub author: Option<String>,
    /// Sentiment polarity.
    pub polarity: PolarityScore,
    /// Topic labels.
    pub categories: Categories,
    /// Confidence in the analysis.
    pub confidence: Confidence,
    /// Rationale, if any.
    pub explanation: Option<String>,
    /// Model-derived or fallback.
    pub origin: AnalysisOrigin,
}

impl Insight {
    /// Joins an item with its result.
    pub fn from_parts(item: &WorkItem, result: &AnalysisResult) -> Self {
        Self {
            work_item_id: item.id,
            occurred_at: item.occurred_at,
            text: item.payload.text.clone(),
            author: item.payload.author.clone(),
            polarity: result.polarity,
            categories: result.categories.clone(),
            confidence: result.confidence,
            explanation: result.explanation.clone(),
            origin: result.origin,
        }
    }
}

/// A page of insights plus the number of matches ignoring `limit`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsightPage {
    /// Matches, newest `occurred_at` first.
    pub insights: Vec<Insight>,
    /// Count of every match.
    pub total_count: usize,
}
