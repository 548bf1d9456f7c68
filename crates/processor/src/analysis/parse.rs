//! Structured parsing of normalised service responses into [`Analysis`].
//!
//! Accepts the object shape requested by the prompt:
//!
//! ```json
//! {"sentiment_score": 0.8, "clusters": ["praise"], "confidence": 0.9, "reasoning": "..."}
//! ```
//!
//! Scores are clamped into range. `sentiment_score` is required; a missing
//! `confidence` defaults to [`DEFAULT_CONFIDENCE`] and missing or empty
//! `clusters` become [`UNCATEGORIZED`].

use pipeline::{Analysis, AnalysisError, AnalysisOrigin, Categories, Confidence, PolarityScore};
use serde_json::{Map, Value};

/// Confidence assumed when the service omits it.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Label used when the service returns no usable cluster.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Parses `text` (already normalised) into an [`Analysis`]; `raw` is the
/// response as received and is retained on the result and on errors.
pub fn parse_analysis(text: &str, raw: &str) -> Result<Analysis, AnalysisError> {
    let value: Value = serde_json::from_str(text).map_err(|e| AnalysisError::Unparseable {
        message: e.to_string(),
        raw: raw.to_string(),
    })?;
    let malformed = |message: &str| AnalysisError::Malformed {
        message: message.to_string(),
        raw: raw.to_string(),
    };

    let Value::Object(fields) = value else {
        return Err(malformed("expected a JSON object"));
    };

    let polarity = fields
        .get("sentiment_score")
        .and_then(number)
        .and_then(PolarityScore::clamped)
        .ok_or_else(|| malformed("sentiment_score missing or not a number"))?;

    let confidence = match fields.get("confidence") {
        None | Some(Value::Null) => Confidence::new(DEFAULT_CONFIDENCE),
        Some(v) => number(v).and_then(Confidence::clamped),
    }
    .ok_or_else(|| malformed("confidence is not a number"))?;

    let categories = categories(&fields).ok_or_else(|| malformed("clusters is not a list"))?;

    let explanation = fields
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(Analysis {
        polarity,
        categories,
        confidence,
        explanation,
        raw_response: raw.to_string(),
        origin: AnalysisOrigin::Model,
    })
}

/// Reads a number, also accepting numeric strings (`"0.7"`).
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `None` only when `clusters` has an unusable type.
fn categories(fields: &Map<String, Value>) -> Option<Categories> {
    let uncategorized = || Categories::new([UNCATEGORIZED]);
    match fields.get("clusters") {
        None | Some(Value::Null) => uncategorized(),
        Some(Value::String(label)) => Categories::new([label]).or_else(uncategorized),
        Some(Value::Array(items)) => {
            Categories::new(items.iter().filter_map(Value::as_str)).or_else(uncategorized)
        }
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use pipeline::FallbackCause;

    use super::*;

    fn parse(text: &str) -> Result<Analysis, AnalysisError> {
        parse_analysis(text, text)
    }

    #[test]
    fn parses_well_formed_object() {
        let a = parse(
            r#"{"sentiment_score": 0.9, "clusters": ["praise", "product_quality"],
                "confidence": 0.85, "reasoning": "Strongly positive."}"#,
        )
        .unwrap();
        assert_eq!(a.polarity.as_f64(), 0.9);
        assert_eq!(a.confidence.as_f64(), 0.85);
        assert!(a.categories.contains("praise"));
        assert_eq!(a.explanation.as_deref(), Some("Strongly positive."));
        assert_eq!(a.origin, AnalysisOrigin::Model);
    }

    #[test]
    fn clamps_out_of_range_scores() {
        let a = parse(r#"{"sentiment_score": 3, "confidence": -2, "clusters": ["x"]}"#).unwrap();
        assert_eq!(a.polarity.as_f64(), 1.0);
        assert_eq!(a.confidence.as_f64(), 0.0);
    }

    #[test]
    fn accepts_numeric_strings() {
        let a = parse(r#"{"sentiment_score": "-0.4", "confidence": "0.6"}"#).unwrap();
        assert_eq!(a.polarity.as_f64(), -0.4);
        assert_eq!(a.confidence.as_f64(), 0.6);
    }

    #[test]
    fn fills_defaults_for_optional_fields() {
        let a = parse(r#"{"sentiment_score": 0.0}"#).unwrap();
        assert_eq!(a.confidence.as_f64(), DEFAULT_CONFIDENCE);
        assert!(a.categories.contains(UNCATEGORIZED));
        assert!(a.explanation.is_none());

        let a = parse(r#"{"sentiment_score": 0.0, "clusters": ["", 4]}"#).unwrap();
        assert!(a.categories.contains(UNCATEGORIZED));
    }

    #[test]
    fn invalid_json_is_unparseable() {
        let err = parse("{not json").unwrap_err();
        assert!(matches!(err, AnalysisError::Unparseable { .. }));
        assert!(err.retry_policy().is_retryable());
    }

    #[test]
    fn missing_score_is_malformed() {
        for text in [
            r#"{"clusters": ["x"]}"#,
            r#"{"sentiment_score": "very good"}"#,
            r#"[0.5]"#,
            r#"{"sentiment_score": 0.5, "clusters": 7}"#,
        ] {
            let err = parse(text).unwrap_err();
            assert!(matches!(err, AnalysisError::Malformed { .. }), "{text}");
            assert_eq!(err.raw_response(), Some(text));
        }
    }

    #[test]
    fn results_always_satisfy_invariants() {
        for text in [
            r#"{"sentiment_score": -99, "confidence": 99}"#,
            r#"{"sentiment_score": 1e308, "clusters": []}"#,
        ] {
            let a = parse(text).unwrap();
            assert!((-1.0..=1.0).contains(&a.polarity.as_f64()));
            assert!((0.0..=1.0).contains(&a.confidence.as_f64()));
            assert!(!a.categories.is_empty());
        }
        // Fallbacks too.
        let f = Analysis::fallback(FallbackCause::MalformedResponse, "x", "");
        assert!(!f.categories.is_empty());
    }
}
