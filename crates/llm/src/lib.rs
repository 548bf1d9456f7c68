//! Analysis service adapter.
//!
//! Implements [`pipeline::AnalysisService`] for OpenAI-style
//! `POST {base_url}/chat/completions` endpoints, with xAI's Grok as the
//! default target. One call to [`AnalysisService::complete`] is exactly one
//! HTTP request; retry, back-off and rate limiting belong to the caller.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, status
//! classification and `Retry-After` handling live here. The `processor`
//! crate sees only [`pipeline::AnalysisService`].

use std::time::Duration;

use async_trait::async_trait;
use pipeline::{AnalysisError, AnalysisRequest, AnalysisService, InsightsError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Default endpoint root.
pub const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";

/// Default model name.
pub const DEFAULT_MODEL: &str = "grok-4-latest";

/// Longest error body kept in an [`AnalysisError::Rejected`] message.
const MAX_ERROR_BODY: usize = 512;

/// Connection settings for [`ChatCompletionsProvider`].
#[derive(Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    /// Transport-level limit; the Analysis Client applies its own per-call
    /// timeout on top.
    pub request_timeout: Duration,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ProviderConfig {
    /// Settings for the default endpoint and model.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Chat-completions client.
#[derive(Debug, Clone)]
pub struct ChatCompletionsProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl ChatCompletionsProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, InsightsError> {
        let configuration = |message: String| InsightsError::ConfigurationError { message };

        let api_key = config.api_key.trim();
        if api_key.is_empty() {
            return Err(configuration("analysis service API key is missing".into()));
        }
        if config.model.trim().is_empty() {
            return Err(configuration("analysis model name is missing".into()));
        }

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| configuration("analysis service API key is not a valid header".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AnalysisService for ChatCompletionsProvider {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        let body = ChatRequest {
            model: &self.model,
            stream: false,
            temperature: request.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            debug!(%status, "analysis service returned an error status");
            return Err(classify_status(status, retry_after, &text));
        }

        let text = response.text().await.map_err(transport)?;
        extract_content(&text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

fn transport(err: reqwest::Error) -> AnalysisError {
    AnalysisError::Transport {
        message: err.to_string(),
    }
}

/// Maps a non-success status to the error the retry loop understands:
/// 429 is a rate limit, 408 and 5xx are transient, every other 4xx is a
/// rejection.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> AnalysisError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return AnalysisError::RateLimited { retry_after };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return AnalysisError::Transport {
            message: format!("status {status}"),
        };
    }
    let mut message = body.trim().to_string();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    AnalysisError::Rejected {
        status: Some(status.as_u16()),
        message,
    }
}

/// Reads a delta-seconds `Retry-After` header. HTTP-date values, negative
/// numbers and values too large for a [`Duration`] are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = value.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Pulls `choices[0].message.content` out of a success body.
pub fn extract_content(body: &str) -> Result<String, AnalysisError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| AnalysisError::Unparseable {
            message: format!("chat completion envelope: {e}"),
            raw: body.to_string(),
        })?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| AnalysisError::Unparseable {
            message: "response carried no message content".to_string(),
            raw: body.to_string(),
        })
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}
