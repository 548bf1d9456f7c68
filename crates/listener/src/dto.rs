//! Wire shapes for the HTTP surface.

use pipeline::{
    Confidence, Insight, InsightPage, InsightQuery, SentimentFilter, Timestamp, WorkItemId,
    WorkPayload, DEFAULT_LIMIT,
};
use serde::{Deserialize, Serialize};

use crate::ApiError;

/// Body of `POST /api/v1/items`.
#[derive(Debug, Deserialize)]
pub struct SubmitItemRequest {
    pub text: String,
    #[serde(default)]
    pub author: Option<String>,
    /// When the content was produced (ISO 8601). Defaults to now.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, alias = "raw_data")]
    pub metadata: Option<serde_json::Value>,
}

impl SubmitItemRequest {
    /// Validates the body into a payload and optional content timestamp.
    pub fn into_parts(self) -> Result<(WorkPayload, Option<Timestamp>), ApiError> {
        let mut payload = WorkPayload::from_text(&self.text)
            .ok_or_else(|| ApiError::InvalidSchema("text cannot be empty".to_string()))?;
        if let Some(author) = self.author.map(|a| a.trim().to_string()) {
            if !author.is_empty() {
                payload = payload.with_author(author);
            }
        }
        if let Some(metadata) = self.metadata {
            payload = payload.with_metadata(metadata);
        }
        let occurred_at = self
            .timestamp
            .map(|t| {
                Timestamp::parse_iso8601(&t)
                    .ok_or_else(|| ApiError::InvalidSchema(format!("timestamp {t:?} is not ISO 8601")))
            })
            .transpose()?;
        Ok((payload, occurred_at))
    }
}

/// `202 Accepted` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitItemResponse {
    pub status: String,
    pub item_id: WorkItemId,
    pub message: String,
}

/// Raw query string of `GET /api/v1/insights`. Every field is text so that
/// parse failures produce our own `invalid_query` body.
#[derive(Debug, Default, Deserialize)]
pub struct InsightParams {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub limit: Option<String>,
    pub min_confidence: Option<String>,
    pub sentiment: Option<String>,
}

impl InsightParams {
    pub fn into_query(self) -> Result<InsightQuery, ApiError> {
        let invalid = ApiError::InvalidQuery;
        let mut query = InsightQuery::new(
            required_time("start_time", self.start_time)?,
            required_time("end_time", self.end_time)?,
        );
        query.limit = match self.limit {
            None => DEFAULT_LIMIT,
            Some(l) => l
                .trim()
                .parse()
                .map_err(|_| invalid(format!("limit {l:?} is not a positive integer")))?,
        };
        if let Some(c) = self.min_confidence {
            let value: f64 = c
                .trim()
                .parse()
                .map_err(|_| invalid(format!("min_confidence {c:?} is not a number")))?;
            query.min_confidence = Some(
                Confidence::new(value)
                    .ok_or_else(|| invalid("min_confidence must be between 0.0 and 1.0".into()))?,
            );
        }
        if let Some(s) = self.sentiment {
            query.sentiment = Some(SentimentFilter::parse(s.trim()).ok_or_else(|| {
                invalid(format!(
                    "sentiment {s:?} must be one of positive, negative, neutral"
                ))
            })?);
        }
        query
            .validate()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(query)
    }
}

fn required_time(name: &str, value: Option<String>) -> Result<Timestamp, ApiError> {
    let value = value.ok_or_else(|| ApiError::InvalidQuery(format!("{name} is required")))?;
    Timestamp::parse_iso8601(&value)
        .ok_or_else(|| ApiError::InvalidQuery(format!("{name} {value:?} is not ISO 8601")))
}

/// The analysis part of one insight.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisView {
    pub sentiment_score: f64,
    pub clusters: Vec<String>,
    pub confidence: f64,
    pub reasoning: Option<String>,
    /// `model` or `fallback:<cause>`.
    pub origin: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsightView {
    pub item_id: WorkItemId,
    pub timestamp: String,
    pub text: String,
    pub author: Option<String>,
    pub analysis: AnalysisView,
}

impl From<Insight> for InsightView {
    fn from(insight: Insight) -> Self {
        Self {
            item_id: insight.work_item_id,
            timestamp: insight.occurred_at.to_rfc3339(),
            text: insight.text,
            author: insight.author,
            analysis: AnalysisView {
                sentiment_score: insight.polarity.as_f64(),
                clusters: insight.categories.iter().map(str::to_string).collect(),
                confidence: insight.confidence.as_f64(),
                reasoning: insight.explanation,
                origin: insight.origin.as_str().to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PageMetadata {
    pub total_count: usize,
    pub returned_count: usize,
    pub start_time: String,
    pub end_time: String,
}

/// `200` body of `GET /api/v1/insights`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InsightsResponse {
    pub insights: Vec<InsightView>,
    pub metadata: PageMetadata,
}

impl InsightsResponse {
    pub fn new(query: &InsightQuery, page: InsightPage) -> Self {
        let insights: Vec<InsightView> = page.insights.into_iter().map(Into::into).collect();
        Self {
            metadata: PageMetadata {
                total_count: page.total_count,
                returned_count: insights.len(),
                start_time: query.start.to_rfc3339(),
                end_time: query.end.to_rfc3339(),
            },
            insights,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `up` when every dependency answered, otherwise `degraded`.
    pub status: String,
    pub store: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> InsightParams {
        let mut p = InsightParams::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "start_time" => p.start_time = v,
                "end_time" => p.end_time = v,
                "limit" => p.limit = v,
                "min_confidence" => p.min_confidence = v,
                "sentiment" => p.sentiment = v,
                _ => unreachable!(),
            }
        }
        p
    }

    const RANGE: [(&str, &str); 2] = [
        ("start_time", "2024-05-01T00:00:00Z"),
        ("end_time", "2024-05-02T00:00:00"),
    ];

    #[test]
    fn defaults_apply() {
        let q = params(&RANGE).into_query().unwrap();
        assert_eq!(q.limit, DEFAULT_LIMIT);
        assert!(q.min_confidence.is_none());
        assert!(q.sentiment.is_none());
    }

    #[test]
    fn rejects_bad_parameters() {
        for extra in [
            ("limit", "0"),
            ("limit", "1001"),
            ("limit", "ten"),
            ("min_confidence", "1.5"),
            ("sentiment", "angry"),
        ] {
            let mut pairs = RANGE.to_vec();
            pairs.push(extra);
            assert!(
                matches!(params(&pairs).into_query(), Err(ApiError::InvalidQuery(_))),
                "{extra:?}"
            );
        }
        assert!(params(&RANGE[..1]).into_query().is_err());
        assert!(params(&[
            ("start_time", "2024-05-02T00:00:00Z"),
            ("end_time", "2024-05-01T00:00:00Z"),
        ])
        .into_query()
        .is_err());
    }

    #[test]
    fn submit_body_is_validated() {
        let blank = SubmitItemRequest {
            text: "   ".into(),
            author: None,
            timestamp: None,
            metadata: None,
        };
        assert!(matches!(blank.into_parts(), Err(ApiError::InvalidSchema(_))));

        let body: SubmitItemRequest = serde_json::from_str(
            r#"{"text": " hi ", "author": "", "timestamp": "2024-05-01T10:00:00", "raw_data": {"k": 1}}"#,
        )
        .unwrap();
        let (payload, occurred_at) = body.into_parts().unwrap();
        assert_eq!(payload.text, "hi");
        assert!(payload.author.is_none());
        assert_eq!(payload.metadata, Some(serde_json::json!({"k": 1})));
        assert_eq!(occurred_at, Timestamp::parse_iso8601("2024-05-01T10:00:00Z"));
    }
}
