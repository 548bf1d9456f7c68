//! Response normalisation applied before structured parsing.
//!
//! Chat models often wrap JSON in markdown code fences or add a sentence
//! around it. The heuristics here are best-effort and kept behind
//! [`ResponseNormalizer`] so they can change without touching the retry
//! and fallback logic.

use std::borrow::Cow;
use std::fmt::Debug;

/// Turns a raw service response into text that should parse as JSON.
pub trait ResponseNormalizer: Debug + Send + Sync {
    /// Returns the candidate JSON text.
    fn normalize<'a>(&self, raw: &'a str) -> Cow<'a, str>;
}

/// Extracts the body of the first markdown code fence, if there is one,
/// dropping the fence's language tag. Unfenced text is only trimmed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FenceStripper;

const FENCE: &str = "```";

impl ResponseNormalizer for FenceStripper {
    fn normalize<'a>(&self, raw: &'a str) -> Cow<'a, str> {
        let trimmed = raw.trim();
        let Some(open) = trimmed.find(FENCE) else {
            return Cow::Borrowed(trimmed);
        };

        let after_open = &trimmed[open + FENCE.len()..];
        // Skip the info string ("json", "JSON", "js", ...).
        let info_len = after_open
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric())
            .count();
        let body = &after_open[info_len..];

        let body = match body.find(FENCE) {
            Some(close) => &body[..close],
            None => body,
        };
        Cow::Borrowed(body.trim())
    }
}
