//! HTTP surface of the insights pipeline.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /api/v1/items` | Admit one item for analysis (`202`), or `429` when the admission window is full |
//! | `POST /api/v1/conversations` | Same handler, kept for clients of the earlier route name |
//! | `GET /api/v1/insights` | Page of committed results filtered by time, confidence and sentiment |
//! | `GET /health` | Store reachability |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Request parsing, status codes and wire shapes live
//! here. Admission is decided by [`pipeline::AdmissionLimiter`]; persistence
//! goes through [`pipeline::WorkStore`] and [`pipeline::InsightReader`].

pub mod dto;
pub mod error;

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use pipeline::{AdmissionLimiter, InsightReader, Timestamp, WorkItem, WorkStore};
use tracing::{info, instrument, warn};

pub use dto::{
    HealthResponse, InsightParams, InsightsResponse, SubmitItemRequest, SubmitItemResponse,
};
pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Where admitted items are created; also pinged by `/health`.
    pub store: Arc<dyn WorkStore>,
    /// Read side for `/api/v1/insights`.
    pub insights: Arc<dyn InsightReader>,
    /// Fixed-window limiter consulted before each submission.
    pub admission: Arc<AdmissionLimiter>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn WorkStore>,
        insights: Arc<dyn InsightReader>,
        admission: Arc<AdmissionLimiter>,
    ) -> Self {
        Self {
            store,
            insights,
            admission,
        }
    }
}

/// Builds the HTTP surface over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/items", post(submit_item))
        .route("/api/v1/conversations", post(submit_item))
        .route("/api/v1/insights", get(list_insights))
        .route("/health", get(health))
        .with_state(state)
}

/// Admission is checked before the body is looked at, so an over-limit
/// client gets `429` even for a malformed request.
#[instrument(skip_all)]
async fn submit_item(
    State(state): State<AppState>,
    body: Result<Json<SubmitItemRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitItemResponse>), ApiError> {
    if let Err(rejected) = state.admission.try_acquire() {
        return Err(ApiError::RateLimited(rejected));
    }

    let Json(body) = body.map_err(|e| ApiError::InvalidSchema(e.body_text()))?;
    let (payload, occurred_at) = body.into_parts()?;
    let item = WorkItem::new(payload, occurred_at, Timestamp::now());
    let item_id = item.id;
    state.store.create(item).await?;

    info!(%item_id, "item queued for analysis");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitItemResponse {
            status: "accepted".to_string(),
            item_id,
            message: "Item queued for analysis".to_string(),
        }),
    ))
}

async fn list_insights(
    State(state): State<AppState>,
    params: Result<Query<InsightParams>, QueryRejection>,
) -> Result<Json<InsightsResponse>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::InvalidQuery(e.body_text()))?;
    let query = params.into_query()?;
    let page = state.insights.query_insights(&query).await?;
    Ok(Json(InsightsResponse::new(&query, page)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    match state.store.ping().await {
        Ok(()) => Json(HealthResponse {
            status: "up".to_string(),
            store: "up".to_string(),
            error: None,
        }),
        Err(err) => {
            warn!(error = %err, "store health check failed");
            Json(HealthResponse {
                status: "degraded".to_string(),
                store: "down".to_string(),
                error: Some(err.to_string()),
            })
        }
    }
}
