//! HTTP error mapping.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use pipeline::{AdmissionRejected, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Everything a handler can fail with, each mapped to one status and one
/// machine-readable `error` code.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The admission window is full.
    #[error("rate limit exceeded")]
    RateLimited(AdmissionRejected),

    /// The submitted body does not describe a valid item.
    #[error("invalid item: {0}")]
    InvalidSchema(String),

    /// Query parameters are missing, malformed or inconsistent.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<f64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::RateLimited(rejected) => {
                let body = ErrorBody {
                    error: "rate_limit_exceeded",
                    details: None,
                    retry_after: Some(rejected.retry_after_seconds()),
                };
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(rejected.retry_after_whole_seconds()),
                );
                response
            }
            Self::InvalidSchema(details) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "invalid_schema",
                    details: Some(details),
                    retry_after: None,
                }),
            )
                .into_response(),
            Self::InvalidQuery(details) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "invalid_query",
                    details: Some(details),
                    retry_after: None,
                }),
            )
                .into_response(),
            Self::Store(err) => {
                error!(error = %err, "store operation failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorBody {
                        error: "store_unavailable",
                        details: Some(err.to_string()),
                        retry_after: None,
                    }),
                )
                    .into_response()
            }
        }
    }
}
