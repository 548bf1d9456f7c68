//! Port traits implemented by infrastructure crates.
//!
//! The pipeline defines *what* it needs from persistence and from the
//! external analysis service; the `store` and `llm` crates define *how*.
//! All traits are object-safe so the composition root can hold them as
//! `Arc<dyn …>`.

use async_trait::async_trait;

use crate::{
    AnalysisError, AnalysisResult, InsightPage, InsightQuery, StoreError, Timestamp, WorkItem,
    WorkItemId, WorkState,
};

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Durable home of work items and their results.
///
/// Implementations must give the Orchestrator read-your-writes consistency
/// for its own claim → dispatch → commit sequence.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Inserts a new item. The item is expected to be `pending`.
    async fn create(&self, item: WorkItem) -> Result<(), StoreError>;

    /// Fetches one item.
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Returns up to `limit` items in `state`, oldest `submitted_at` first.
    async fn find_by_state(&self, state: WorkState, limit: usize)
        -> Result<Vec<WorkItem>, StoreError>;

    /// Compare-and-set state transition.
    ///
    /// Fails with [`StoreError::InvalidTransition`] if `expected → next` is not
    /// a state-machine edge, and with [`StoreError::StateConflict`] if the
    /// stored state is not `expected`. Updates `state_changed_at`.
    async fn update_state(
        &self,
        id: WorkItemId,
        expected: WorkState,
        next: WorkState,
    ) -> Result<(), StoreError>;

    /// Persists a result. Fails with [`StoreError::DuplicateResult`] if the
    /// item already has one.
    async fn create_result(&self, result: AnalysisResult) -> Result<(), StoreError>;

    /// Fetches the result attached to an item, if any.
    async fn result_for(&self, id: WorkItemId) -> Result<Option<AnalysisResult>, StoreError>;

    /// Persists `result` and moves its item `processing → completed`.
    ///
    /// The default runs the two steps in sequence; transactional stores
    /// override it so both land or neither does.
    async fn complete(&self, result: AnalysisResult) -> Result<(), StoreError> {
        let id = result.work_item_id;
        self.create_result(result).await?;
        self.update_state(id, WorkState::Processing, WorkState::Completed)
            .await
    }

    /// Moves every `processing` item whose `state_changed_at` is at or before
    /// `older_than` back to `pending`, returning the affected identifiers.
    ///
    /// This is the crash-recovery path and the only way back to `pending`.
    async fn requeue_stale(&self, older_than: Timestamp) -> Result<Vec<WorkItemId>, StoreError>;

    /// Cheap reachability check for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read side used by the insight query surface.
#[async_trait]
pub trait InsightReader: Send + Sync {
    /// Returns the page of insights matching `query`, newest first.
    async fn query_insights(&self, query: &InsightQuery) -> Result<InsightPage, StoreError>;
}

// ---------------------------------------------------------------------------
// External analysis service
// ---------------------------------------------------------------------------

/// One structured request to the analysis service.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    /// Fully rendered instruction prompt.
    pub prompt: String,
    /// Sampling temperature; kept low for repeatable output.
    pub temperature: f32,
}

/// A single request/response exchange with the external analysis service.
///
/// Implementations perform exactly one attempt; retry, back-off, rate
/// limiting and fallback belong to the caller.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Sends `request` and returns the response text (possibly fenced JSON).
    async fn complete(&self, request: &AnalysisRequest) -> Result<String, AnalysisError>;

    /// Short provider name for logs.
    fn name(&self) -> &str;
}
