//! Batch Orchestrator: drives pending work items to a terminal state.
//!
//! Each cycle discovers up to `batch_size` pending items (oldest first),
//! claims each with a compare-and-set `pending → processing`, fans the
//! claimed items out to the [`AnalysisClient`] concurrently and commits
//! every outcome independently. One item's failure never affects another.
//!
//! The background loop runs a cycle immediately on start, then sleeps
//! `busy_delay` after a full batch (more work is probably waiting) or
//! `poll_interval` otherwise. On stop, in-flight items get
//! `shutdown_grace` to finish; anything still running after that is
//! abandoned in `processing`.
//!
//! The loop assumes it is the only processor of its store. On start it
//! requeues every `processing` item, since none of them can still be in
//! flight. While running it sweeps items stuck in `processing` for longer
//! than `stale_after`, which covers item tasks that died without
//! recording an outcome.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeline::{
    AnalysisOrigin, AnalysisResult, FallbackCause, InsightsError, StoreError, Timestamp, WorkItem,
    WorkItemId, WorkState, WorkStore,
};
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::AnalysisClient;

/// Attempts per store write when the store reports itself unavailable.
const STORE_WRITE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Scheduling and disposition settings for the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum items discovered and dispatched per cycle.
    pub batch_size: usize,
    /// Sleep after a cycle that found less than a full batch.
    pub poll_interval: Duration,
    /// Sleep after a full batch.
    pub busy_delay: Duration,
    /// How long stop waits for in-flight items before abandoning them.
    pub shutdown_grace: Duration,
    /// `processing` items untouched for this long are requeued by the
    /// periodic sweep, which runs once per `stale_after`. `None` disables
    /// the periodic sweep; the startup requeue always runs.
    pub stale_after: Option<Duration>,
    /// Commit fallback results for items whose service was unreachable or
    /// refused the request, instead of marking them `failed`.
    pub complete_unreachable: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            busy_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            stale_after: Some(Duration::from_secs(600)),
            complete_unreachable: false,
        }
    }
}

impl BatchConfig {
    /// Rejects a zero `batch_size` or `poll_interval`.
    pub fn validate(&self) -> Result<(), InsightsError> {
        if self.batch_size == 0 {
            return Err(InsightsError::ConfigurationError {
                message: "batch_size must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(InsightsError::ConfigurationError {
                message: "poll_interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// A cycle that could not run at all. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("discovering pending items failed: {0}")]
    Discovery(#[source] StoreError),

    #[error("claiming pending items failed: {0}")]
    Claim(#[source] StoreError),
}

/// Counts from one cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Pending items returned by discovery.
    pub discovered: usize,
    /// Items this cycle moved to `processing`.
    pub claimed: usize,
    /// Items committed as `completed`.
    pub completed: usize,
    /// Of `completed`, how many carry a fallback result.
    pub fallbacks: usize,
    /// Items moved to `failed`.
    pub failed: usize,
    /// Items whose outcome could not be recorded; they stay `processing`.
    pub uncommitted: usize,
    /// Items still running when the shutdown grace expired.
    pub abandoned: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed { fallback } => {
                self.completed += 1;
                if fallback {
                    self.fallbacks += 1;
                }
            }
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Uncommitted => self.uncommitted += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed { fallback: bool },
    Failed,
    Uncommitted,
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn WorkStore>,
    client: Arc<AnalysisClient>,
    config: BatchConfig,
}

/// Owns the processing loop for one store.
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl BatchOrchestrator {
    /// Validates `config` and wires the orchestrator to its store and
    /// analysis client. Nothing runs until [`start`](Self::start).
    pub fn new(
        store: Arc<dyn WorkStore>,
        client: Arc<AnalysisClient>,
        config: BatchConfig,
    ) -> Result<Self, InsightsError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                client,
                config,
            }),
            running: Mutex::new(None),
        })
    }

    /// Spawns the background loop on the current tokio runtime.
    ///
    /// Calling `start` while already running does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.is_some() {
            warn!("batch orchestrator already running");
            return;
        }
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.inner).run(shutdown.clone()));
        *running = Some(Running { shutdown, task });
        info!(
            batch_size = self.inner.config.batch_size,
            "batch orchestrator started"
        );
    }

    /// Signals the loop to stop and waits for it, including the shutdown
    /// grace for in-flight items.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(Running { shutdown, task }) = running else {
            return;
        };
        shutdown.cancel();
        if let Err(err) = task.await {
            error!(error = %err, "batch orchestrator task ended abnormally");
        }
        info!("batch orchestrator stopped");
    }

    /// Whether the background loop has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Runs one discovery → claim → dispatch → commit cycle to completion.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        self.inner.run_cycle(&CancellationToken::new()).await
    }

    /// Requeues `processing` items whose claim is older than
    /// `stale_after`. Does nothing when the sweep is disabled.
    pub async fn recover_stale(&self) -> Result<Vec<WorkItemId>, StoreError> {
        self.inner.recover_stale().await
    }
}

impl Inner {
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        match self.store.requeue_stale(Timestamp::now()).await {
            Ok(requeued) if !requeued.is_empty() => {
                info!(count = requeued.len(), "requeued items left processing by an earlier run");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "startup requeue failed; continuing"),
        }

        let mut last_sweep = Instant::now();
        loop {
            if let Some(stale_after) = self.config.stale_after {
                if last_sweep.elapsed() >= stale_after {
                    last_sweep = Instant::now();
                    if let Err(err) = self.recover_stale().await {
                        warn!(error = %err, "stale sweep failed; continuing");
                    }
                }
            }

            let delay = match self.run_cycle(&shutdown).await {
                Ok(report) if report.discovered >= self.config.batch_size => {
                    self.config.busy_delay
                }
                Ok(_) => self.config.poll_interval,
                Err(err) => {
                    error!(error = %err, "batch cycle failed");
                    self.config.poll_interval
                }
            };
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn recover_stale(&self) -> Result<Vec<WorkItemId>, StoreError> {
        let Some(stale_after) = self.config.stale_after else {
            return Ok(Vec::new());
        };
        let cutoff = Timestamp::now().saturating_sub(stale_after);
        let requeued = self.store.requeue_stale(cutoff).await?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "requeued stale processing items");
        }
        Ok(requeued)
    }

    #[instrument(skip_all)]
    async fn run_cycle(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::default();

        let pending = self
            .store
            .find_by_state(WorkState::Pending, self.config.batch_size)
            .await
            .map_err(CycleError::Discovery)?;
        report.discovered = pending.len();
        if pending.is_empty() {
            return Ok(report);
        }

        let mut claimed = Vec::with_capacity(pending.len());
        for mut item in pending {
            match self
                .store
                .update_state(item.id, WorkState::Pending, WorkState::Processing)
                .await
            {
                Ok(()) => {
                    item.state = WorkState::Processing;
                    claimed.push(item);
                }
                Err(StoreError::StateConflict { .. } | StoreError::NotFound(_)) => {
                    debug!(item_id = %item.id, "item claimed elsewhere; skipping");
                }
                Err(err) if claimed.is_empty() => return Err(CycleError::Claim(err)),
                Err(err) => {
                    warn!(error = %err, "claim failed; dispatching items claimed so far");
                    break;
                }
            }
        }
        report.claimed = claimed.len();

        let mut tasks = JoinSet::new();
        for item in claimed {
            tasks.spawn(process_item(Arc::clone(self), item));
        }

        let finished = {
            let collect = collect_outcomes(&mut tasks, &mut report);
            tokio::pin!(collect);
            tokio::select! {
                () = &mut collect => true,
                () = shutdown.cancelled() => {
                    info!(
                        grace_ms = self.config.shutdown_grace.as_millis() as u64,
                        "shutdown requested; waiting for in-flight items"
                    );
                    tokio::time::timeout(self.config.shutdown_grace, &mut collect)
                        .await
                        .is_ok()
                }
            }
        };
        if !finished {
            report.abandoned = tasks.len();
            warn!(
                count = report.abandoned,
                "shutdown grace expired; abandoning in-flight items"
            );
            tasks.abort_all();
        }

        info!(
            discovered = report.discovered,
            claimed = report.claimed,
            completed = report.completed,
            fallbacks = report.fallbacks,
            failed = report.failed,
            "batch cycle finished"
        );
        Ok(report)
    }
}

async fn collect_outcomes(tasks: &mut JoinSet<ItemOutcome>, report: &mut CycleReport) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => report.record(outcome),
            Err(err) => {
                error!(error = %err, "item task panicked");
                report.record(ItemOutcome::Uncommitted);
            }
        }
    }
}

#[instrument(skip_all, fields(item_id = %item.id))]
async fn process_item(inner: Arc<Inner>, item: WorkItem) -> ItemOutcome {
    let analysis = inner.client.analyze(&item.payload).await;

    let unreachable = matches!(
        analysis.origin,
        AnalysisOrigin::Fallback(FallbackCause::ExhaustedRetries | FallbackCause::Rejected)
    );
    if unreachable && !inner.config.complete_unreachable {
        warn!(
            origin = analysis.origin.as_str(),
            "analysis service unreachable; marking failed"
        );
        return mark_failed(inner.store.as_ref(), item.id).await;
    }

    let fallback = analysis.origin.is_fallback();
    let result = analysis.into_result(item.id, Timestamp::now());
    let store = inner.store.as_ref();
    match with_store_retries(|| commit(store, result.clone())).await {
        Ok(()) => {
            debug!(fallback, "item completed");
            ItemOutcome::Completed { fallback }
        }
        Err(err) => {
            warn!(error = %err, "commit failed; marking failed");
            mark_failed(inner.store.as_ref(), item.id).await
        }
    }
}

/// Stores the result and completes the item. A result already present
/// from an earlier, interrupted attempt is kept and the item completed.
async fn commit(store: &dyn WorkStore, result: AnalysisResult) -> Result<(), StoreError> {
    let id = result.work_item_id;
    match store.complete(result).await {
        Err(StoreError::DuplicateResult(_)) => {
            debug!("result already stored; completing item");
            match store
                .update_state(id, WorkState::Processing, WorkState::Completed)
                .await
            {
                // An attempt reported as unavailable had in fact committed.
                Err(StoreError::StateConflict {
                    actual: WorkState::Completed,
                    ..
                }) => Ok(()),
                other => other,
            }
        }
        other => other,
    }
}

/// Runs a store write, repeating it while the store reports a retryable
/// error, up to [`STORE_WRITE_ATTEMPTS`] times.
async fn with_store_retries<F, Fut>(mut write: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 1;
    loop {
        match write().await {
            Err(err) if err.retry_policy().is_retryable() && attempt < STORE_WRITE_ATTEMPTS => {
                debug!(attempt, error = %err, "store unavailable; retrying write");
                tokio::time::sleep(STORE_RETRY_DELAY).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn mark_failed(store: &dyn WorkStore, id: WorkItemId) -> ItemOutcome {
    match with_store_retries(|| {
        store.update_state(id, WorkState::Processing, WorkState::Failed)
    })
    .await
    {
        Ok(()) => ItemOutcome::Failed,
        Err(err) => {
            error!(error = %err, "could not mark item failed; leaving it processing");
            ItemOutcome::Uncommitted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_tallies_outcomes() {
        let mut report = CycleReport::default();
        report.record(ItemOutcome::Completed { fallback: false });
        report.record(ItemOutcome::Completed { fallback: true });
        report.record(ItemOutcome::Failed);
        report.record(ItemOutcome::Uncommitted);
        assert_eq!(report.completed, 2);
        assert_eq!(report.fallbacks, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.uncommitted, 1);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = BatchConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(BatchConfig::default().validate().is_ok());
    }
}
