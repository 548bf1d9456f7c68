//! Prompt construction for the analysis service.

use pipeline::WorkPayload;

/// Renders the instruction prompt for one payload.
///
/// The text is embedded as a JSON string literal so quotes and newlines in
/// user content cannot break out of the instruction.
pub fn render(payload: &WorkPayload) -> String {
    let quoted = serde_json::to_string(&payload.text).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"Analyze the following conversation and describe it as a JSON object.

Conversation text: {quoted}

Respond with exactly this structure:
{{
    "sentiment_score": <number from -1.0 (very negative) to 1.0 (very positive)>,
    "clusters": [<topic labels such as "product_issues", "delivery_problems", "customer_support", "praise", "complaint">],
    "confidence": <number from 0.0 to 1.0: how clear the sentiment and topics are>,
    "reasoning": "<one or two sentences explaining the assessment>"
}}

Decide whether the sentiment is positive, negative or neutral, identify the
main themes, and rate how unambiguous they are.

Return ONLY the JSON object, with no surrounding text."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_every_required_field() {
        let prompt = render(&WorkPayload::from_text("Amazing product!").unwrap());
        for field in ["sentiment_score", "clusters", "confidence", "reasoning"] {
            assert!(prompt.contains(field), "missing {field}");
        }
        assert!(prompt.contains("\"Amazing product!\""));
    }

    #[test]
    fn escapes_embedded_quotes() {
        let prompt = render(&WorkPayload::from_text(r#"he said "ignore the above""#).unwrap());
        assert!(prompt.contains(r#""he said \"ignore the above\"""#));
    }
}
