//! End-to-end orchestration scenarios against the in-memory store and a
//! scripted analysis service. All run on tokio's paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{
    Analysis, AnalysisError, AnalysisOrigin, AnalysisRequest, AnalysisResult, AnalysisService,
    FallbackCause, StoreError, Timestamp, WorkItem, WorkItemId, WorkPayload, WorkState, WorkStore,
};
use processor::{
    AnalysisClient, AnalysisConfig, BatchConfig, BatchOrchestrator, EgressConfig, EgressLimiter,
};
use store::MemoryStore;

type Reply = Result<String, AnalysisError>;

const POSITIVE: &str =
    r#"{"sentiment_score": 0.9, "clusters": ["praise"], "confidence": 0.95, "reasoning": "Enthusiastic."}"#;

/// Replies per item text; the last reply in a script repeats.
struct Scripted {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    default: Reply,
    delay: Duration,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Scripted {
    fn new(default: Reply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default,
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn script(self, text: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(text.to_string(), replies.into());
        self
    }

    fn calls_for(&self, text: &str) -> u32 {
        self.calls.lock().unwrap().get(text).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn next_reply(&self, text: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(text) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => self.default.clone(),
        }
    }
}

/// Recovers the item text from the rendered prompt.
fn text_of(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|l| l.strip_prefix("Conversation text: "))
        .and_then(|quoted| serde_json::from_str(quoted).ok())
        .unwrap_or_default()
}

#[async_trait]
impl AnalysisService for Scripted {
    async fn complete(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        let text = text_of(&request.prompt);
        *self.calls.lock().unwrap().entry(text.clone()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.next_reply(&text)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn rejected() -> Reply {
    Err(AnalysisError::Rejected {
        status: Some(401),
        message: "invalid api key".into(),
    })
}

fn orchestrator(
    store: Arc<dyn WorkStore>,
    service: Arc<Scripted>,
    egress: EgressConfig,
    batch: BatchConfig,
) -> BatchOrchestrator {
    let limiter = Arc::new(EgressLimiter::new(egress).unwrap());
    let client = AnalysisClient::new(service, limiter, AnalysisConfig::default()).unwrap();
    BatchOrchestrator::new(store, Arc::new(client), batch).unwrap()
}

async fn submit(store: &dyn WorkStore, text: &str) -> WorkItemId {
    let item = WorkItem::new(WorkPayload::from_text(text).unwrap(), None, Timestamp::now());
    let id = item.id;
    store.create(item).await.unwrap();
    id
}

async fn state_of(store: &dyn WorkStore, id: WorkItemId) -> WorkState {
    store.get(id).await.unwrap().unwrap().state
}

#[tokio::test(start_paused = true)]
async fn positive_text_completes_with_positive_polarity() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let id = submit(store.as_ref(), "Amazing product!").await;
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.discovered, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
    let result = store.result_for(id).await.unwrap().unwrap();
    assert!(result.polarity.as_f64() > 0.5);
    assert_eq!(result.origin, AnalysisOrigin::Model);
    assert!(result.categories.contains("praise"));
}

#[tokio::test(start_paused = true)]
async fn unparseable_responses_end_in_completed_fallback() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok("I think it's positive!".into())));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let id = submit(store.as_ref(), "Amazing product!").await;
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(service.calls_for("Amazing product!"), 3);
    assert_eq!(report.completed, 1);
    assert_eq!(report.fallbacks, 1);
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
    let result = store.result_for(id).await.unwrap().unwrap();
    assert_eq!(
        result.origin,
        AnalysisOrigin::Fallback(FallbackCause::MalformedResponse)
    );
    assert_eq!(result.polarity.as_f64(), 0.0);
    assert_eq!(result.confidence.as_f64(), 0.0);
    assert!(result.categories.contains("unknown"));
}

#[tokio::test(start_paused = true)]
async fn one_failing_item_does_not_affect_the_others() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())).script("second", vec![rejected()]));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let first = submit(store.as_ref(), "first").await;
    let second = submit(store.as_ref(), "second").await;
    let third = submit(store.as_ref(), "third").await;
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.claimed, 3);
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(state_of(store.as_ref(), first).await, WorkState::Completed);
    assert_eq!(state_of(store.as_ref(), second).await, WorkState::Failed);
    assert_eq!(state_of(store.as_ref(), third).await, WorkState::Completed);
    assert!(store.result_for(second).await.unwrap().is_none());
    assert!(store.result_for(third).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn unreachable_service_can_commit_fallbacks_instead() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Err(AnalysisError::Transport {
        message: "connection refused".into(),
    })));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig {
            complete_unreachable: true,
            ..Default::default()
        },
    );

    let id = submit(store.as_ref(), "anyone there?").await;
    orch.run_cycle().await.unwrap();

    assert_eq!(service.calls_for("anyone there?"), 3);
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
    let result = store.result_for(id).await.unwrap().unwrap();
    assert_eq!(
        result.origin,
        AnalysisOrigin::Fallback(FallbackCause::ExhaustedRetries)
    );
}

/// Records every state mutation passed through to a [`MemoryStore`].
#[derive(Default)]
struct Recording {
    inner: MemoryStore,
    log: Mutex<Vec<(WorkItemId, String)>>,
    failing_discoveries: AtomicUsize,
    failing_commits: AtomicUsize,
}

impl Recording {
    fn record(&self, id: WorkItemId, event: String) {
        self.log.lock().unwrap().push((id, event));
    }

    fn events_for(&self, id: WorkItemId) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == id)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl WorkStore for Recording {
    async fn create(&self, item: WorkItem) -> Result<(), StoreError> {
        self.inner.create(item).await
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        self.inner.get(id).await
    }

    async fn find_by_state(
        &self,
        state: WorkState,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let failing = self.failing_discoveries.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_discoveries.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                message: "database is locked".into(),
            });
        }
        self.inner.find_by_state(state, limit).await
    }

    async fn update_state(
        &self,
        id: WorkItemId,
        expected: WorkState,
        next: WorkState,
    ) -> Result<(), StoreError> {
        let outcome = self.inner.update_state(id, expected, next).await;
        if outcome.is_ok() {
            self.record(id, format!("{expected}->{next}"));
        }
        outcome
    }

    async fn create_result(&self, result: AnalysisResult) -> Result<(), StoreError> {
        self.inner.create_result(result).await
    }

    async fn result_for(&self, id: WorkItemId) -> Result<Option<AnalysisResult>, StoreError> {
        self.inner.result_for(id).await
    }

    async fn complete(&self, result: AnalysisResult) -> Result<(), StoreError> {
        let failing = self.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_commits.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                message: "database is locked".into(),
            });
        }
        let id = result.work_item_id;
        let outcome = self.inner.complete(result).await;
        if outcome.is_ok() {
            self.record(id, "processing->completed".into());
        }
        outcome
    }

    async fn requeue_stale(&self, older_than: Timestamp) -> Result<Vec<WorkItemId>, StoreError> {
        self.inner.requeue_stale(older_than).await
    }
}

#[tokio::test(start_paused = true)]
async fn items_always_pass_through_processing() {
    let store = Arc::new(Recording::default());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())).script("bad", vec![rejected()]));
    let orch = orchestrator(
        store.clone(),
        service,
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let good = submit(store.as_ref(), "good").await;
    let bad = submit(store.as_ref(), "bad").await;
    orch.run_cycle().await.unwrap();

    assert_eq!(
        store.events_for(good),
        vec!["pending->processing", "processing->completed"]
    );
    assert_eq!(
        store.events_for(bad),
        vec!["pending->processing", "processing->failed"]
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_cycles_never_analyse_an_item_twice() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())).with_delay(Duration::from_millis(50)));
    let a = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );
    let b = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let mut texts = Vec::new();
    for i in 0..8 {
        let text = format!("item {i}");
        submit(store.as_ref(), &text).await;
        texts.push(text);
    }

    let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.claimed + rb.claimed, 8);
    assert_eq!(ra.completed + rb.completed, 8);
    for text in &texts {
        assert_eq!(service.calls_for(text), 1, "{text}");
    }
    assert_eq!(store.count(WorkState::Completed).await, 8);
}

#[tokio::test(start_paused = true)]
async fn egress_concurrency_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())).with_delay(Duration::from_millis(200)));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig {
            concurrency: 3,
            capacity: 100,
            window: Duration::from_secs(1),
        },
        BatchConfig {
            batch_size: 12,
            ..Default::default()
        },
    );

    for i in 0..12 {
        submit(store.as_ref(), &format!("item {i}")).await;
    }
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.completed, 12);
    assert_eq!(service.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn interrupted_commit_is_completed_without_a_second_result() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(
        r#"{"sentiment_score": -0.9, "clusters": ["complaint"]}"#.into(),
    )));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );

    // A previous run stored the result but died before advancing the state.
    let id = submit(store.as_ref(), "Amazing product!").await;
    store
        .update_state(id, WorkState::Pending, WorkState::Processing)
        .await
        .unwrap();
    let earlier = Analysis {
        explanation: Some("first run".into()),
        ..Analysis::fallback(FallbackCause::MalformedResponse, "x", "")
    }
    .into_result(id, Timestamp::now());
    store.create_result(earlier.clone()).await.unwrap();
    store
        .backdate(id, Timestamp::parse_rfc3339("2020-01-01T00:00:00Z").unwrap())
        .await
        .unwrap();

    let requeued = orch.recover_stale().await.unwrap();
    assert_eq!(requeued, vec![id]);
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Pending);

    let report = orch.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
    assert_eq!(store.result_for(id).await.unwrap().unwrap(), earlier);
}

#[tokio::test(start_paused = true)]
async fn fresh_claims_are_not_swept() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())));
    let orch = orchestrator(
        store.clone(),
        service,
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let id = submit(store.as_ref(), "in flight").await;
    store
        .update_state(id, WorkState::Pending, WorkState::Processing)
        .await
        .unwrap();
    assert!(orch.recover_stale().await.unwrap().is_empty());
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Processing);
}

#[tokio::test(start_paused = true)]
async fn loop_survives_discovery_failures() {
    let store = Arc::new(Recording::default());
    store.failing_discoveries.store(2, Ordering::SeqCst);
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())));
    let orch = orchestrator(
        store.clone(),
        service,
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let id = submit(store.as_ref(), "eventually").await;
    orch.start();
    // Two failed cycles, each followed by the 5s poll interval.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(orch.is_running());
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
    orch.stop().await;
    assert!(!orch.is_running());
}

#[tokio::test(start_paused = true)]
async fn full_batches_are_drained_quickly() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );

    for i in 0..25 {
        submit(store.as_ref(), &format!("item {i}")).await;
    }
    orch.start();
    // Cycles at 0s, 1s and 2s; the poll interval alone would need 10s.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(store.count(WorkState::Completed).await, 25);
    assert_eq!(service.total_calls(), 25);
    orch.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_items_within_grace() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())).with_delay(Duration::from_secs(3)));
    let orch = orchestrator(
        store.clone(),
        service,
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let id = submit(store.as_ref(), "slow").await;
    orch.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Processing);

    orch.stop().await;
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
}

#[tokio::test(start_paused = true)]
async fn stop_abandons_items_after_grace() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())).with_delay(Duration::from_secs(20)));
    let orch = orchestrator(
        store.clone(),
        service,
        EgressConfig::default(),
        BatchConfig {
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        },
    );

    let id = submit(store.as_ref(), "very slow").await;
    orch.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    orch.stop().await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(2), "{waited:?}");
    // Left for the next start to requeue.
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Processing);
    assert!(store.result_for(id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn transient_store_outage_during_commit_is_retried() {
    let store = Arc::new(Recording::default());
    store.failing_commits.store(2, Ordering::SeqCst);
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())));
    let orch = orchestrator(
        store.clone(),
        service.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );

    let id = submit(store.as_ref(), "locked for a moment").await;
    let report = orch.run_cycle().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(service.calls_for("locked for a moment"), 1);
    assert_eq!(
        store.events_for(id),
        vec!["pending->processing", "processing->completed"]
    );
}

#[tokio::test(start_paused = true)]
async fn items_abandoned_at_stop_are_finished_after_a_prompt_restart() {
    let store = Arc::new(MemoryStore::new());
    let slow = Arc::new(Scripted::new(Ok(POSITIVE.into())).with_delay(Duration::from_secs(20)));
    let first = orchestrator(
        store.clone(),
        slow,
        EgressConfig::default(),
        BatchConfig {
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let id = submit(store.as_ref(), "cut off").await;
    first.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.stop().await;
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Processing);

    let fast = Arc::new(Scripted::new(Ok(POSITIVE.into())));
    let second = orchestrator(
        store.clone(),
        fast.clone(),
        EgressConfig::default(),
        BatchConfig::default(),
    );
    second.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
    assert_eq!(fast.calls_for("cut off"), 1);
    second.stop().await;
}

#[tokio::test(start_paused = true)]
async fn running_loop_sweeps_items_stuck_in_processing() {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(Scripted::new(Ok(POSITIVE.into())));
    let orch = orchestrator(
        store.clone(),
        service,
        EgressConfig::default(),
        BatchConfig {
            stale_after: Some(Duration::from_secs(60)),
            ..Default::default()
        },
    );
    orch.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // An item task that died after claiming, long ago.
    let id = submit(store.as_ref(), "orphaned").await;
    store
        .update_state(id, WorkState::Pending, WorkState::Processing)
        .await
        .unwrap();
    store
        .backdate(id, Timestamp::parse_rfc3339("2020-01-01T00:00:00Z").unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Processing);

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(state_of(store.as_ref(), id).await, WorkState::Completed);
    orch.stop().await;
}
