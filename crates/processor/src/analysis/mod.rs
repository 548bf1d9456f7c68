//! Analysis Client: one payload in, one [`Analysis`] out, never an error.
//!
//! Each attempt takes an [`EgressPermit`](crate::EgressPermit), issues one
//! bounded-time call, normalises the response and parses it. Retryable
//! failures back off `backoff_base^attempt` seconds (or the server's
//! `Retry-After`, whichever is longer) before the next attempt. The permit
//! is released before any back-off, so a sleeping retry never holds a
//! concurrency slot.
//!
//! When attempts run out, or a failure is not retryable, the client returns
//! [`Analysis::fallback`] tagged with the [`FallbackCause`].

pub mod normalize;
pub mod parse;
pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use pipeline::{
    Analysis, AnalysisError, AnalysisRequest, AnalysisService, FallbackCause, InsightsError,
    RetryPolicy, WorkPayload,
};
use tracing::{debug, instrument, warn};

use crate::EgressLimiter;
use normalize::{FenceStripper, ResponseNormalizer};

/// Retry and request settings for the Analysis Client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisConfig {
    /// Total attempts per payload, including the first (`K`).
    pub max_attempts: u32,
    /// Back-off after attempt `n` is `backoff_base^n` seconds.
    pub backoff_base: f64,
    /// Upper bound on any single back-off, including server hints.
    pub max_backoff: Duration,
    /// Per-attempt limit on the external call.
    pub call_timeout: Duration,
    /// Sampling temperature sent with every request.
    pub temperature: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            max_backoff: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
            temperature: 0.3,
        }
    }
}

impl AnalysisConfig {
    /// Rejects settings under which the client could never make a call.
    pub fn validate(&self) -> Result<(), InsightsError> {
        let problem = if self.max_attempts == 0 {
            Some("analysis max_attempts must be at least 1")
        } else if !(self.backoff_base.is_finite() && self.backoff_base >= 1.0) {
            Some("analysis backoff_base must be a finite number >= 1")
        } else if self.call_timeout.is_zero() {
            Some("analysis call_timeout must be non-zero")
        } else {
            None
        };
        match problem {
            Some(message) => Err(InsightsError::ConfigurationError {
                message: message.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.backoff_base.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Wraps every call to the external analysis service.
pub struct AnalysisClient {
    service: Arc<dyn AnalysisService>,
    limiter: Arc<EgressLimiter>,
    normalizer: Arc<dyn ResponseNormalizer>,
    config: AnalysisConfig,
}

impl std::fmt::Debug for AnalysisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisClient")
            .field("service", &self.service.name())
            .field("limiter", &self.limiter)
            .field("normalizer", &self.normalizer)
            .field("config", &self.config)
            .finish()
    }
}

impl AnalysisClient {
    /// Creates a client using the default [`FenceStripper`] normaliser.
    pub fn new(
        service: Arc<dyn AnalysisService>,
        limiter: Arc<EgressLimiter>,
        config: AnalysisConfig,
    ) -> Result<Self, InsightsError> {
        config.validate()?;
        Ok(Self {
            service,
            limiter,
            normalizer: Arc::new(FenceStripper),
            config,
        })
    }

    /// Replaces the response normaliser.
    pub fn with_normalizer(mut self, normalizer: Arc<dyn ResponseNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Analyses `payload`, degrading to a fallback result rather than failing.
    #[instrument(skip_all, fields(service = self.service.name()))]
    pub async fn analyze(&self, payload: &WorkPayload) -> Analysis {
        let request = AnalysisRequest {
            prompt: prompt::render(payload),
            temperature: self.config.temperature,
        };

        let mut last_raw: Option<String> = None;
        let mut last_error: Option<AnalysisError> = None;

        for attempt in 1..=self.config.max_attempts {
            let err = match self.attempt(&request).await {
                Ok(analysis) => {
                    debug!(attempt, polarity = %analysis.polarity, "analysis succeeded");
                    return analysis;
                }
                Err(err) => err,
            };
            if let Some(raw) = err.raw_response() {
                last_raw = Some(raw.to_string());
            }

            match err.retry_policy() {
                RetryPolicy::NonRetryable => {
                    warn!(attempt, error = %err, "analysis failed permanently; using fallback");
                    return self.fallback(&err, last_raw);
                }
                RetryPolicy::Retryable { after } => {
                    if attempt < self.config.max_attempts {
                        let delay = self
                            .config
                            .backoff(attempt)
                            .max(after.unwrap_or_default())
                            .min(self.config.max_backoff);
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "analysis attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            last_error = Some(err);
        }

        let err = last_error.unwrap_or(AnalysisError::Transport {
            message: "no attempt was made".to_string(),
        });
        warn!(
            attempts = self.config.max_attempts,
            error = %err,
            "analysis retries exhausted; using fallback"
        );
        self.fallback(&err, last_raw)
    }

    async fn attempt(&self, request: &AnalysisRequest) -> Result<Analysis, AnalysisError> {
        let permit = self
            .limiter
            .acquire()
            .await
            .map_err(|closed| AnalysisError::Rejected {
                status: None,
                message: closed.to_string(),
            })?;

        let limit = self.config.call_timeout;
        let raw = tokio::time::timeout(limit, self.service.complete(request))
            .await
            .map_err(|_| AnalysisError::Timeout { limit })??;
        drop(permit);

        let text = self.normalizer.normalize(&raw);
        parse::parse_analysis(&text, &raw)
    }

    fn fallback(&self, err: &AnalysisError, last_raw: Option<String>) -> Analysis {
        let cause = match err {
            AnalysisError::Unparseable { .. } | AnalysisError::Malformed { .. } => {
                FallbackCause::MalformedResponse
            }
            AnalysisError::Rejected { .. } => FallbackCause::Rejected,
            AnalysisError::Transport { .. }
            | AnalysisError::Timeout { .. }
            | AnalysisError::RateLimited { .. } => FallbackCause::ExhaustedRetries,
        };
        Analysis::fallback(
            cause,
            format!("Fallback result: {err}"),
            last_raw.unwrap_or_default(),
        )
    }
}
