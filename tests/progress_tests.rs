use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tradecouncil::progress::{
    estimate_total_duration, generate_steps, ProgressTracker, RunStatus, TrackerRegistry,
};
use tradecouncil::roles::RoleRegistry;
use tradecouncil::store::{load_snapshot, KvStore, MemoryStore, StoreError};

/// Store wrapper counting writes, for the throttling assertions.
struct CountingStore {
    inner: MemoryStore,
    writes: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            writes: AtomicUsize::new(0),
        }
    }

    fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(key).await
    }

    async fn append(&self, stream_key: &str, record: &[u8]) -> Result<(), StoreError> {
        self.inner.append(stream_key, record).await
    }

    async fn read_log(&self, stream_key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.inner.read_log(stream_key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_keys(prefix).await
    }
}

fn roles() -> RoleRegistry {
    RoleRegistry::default()
}

fn agents(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

fn tracker_with_store(store: Arc<dyn KvStore>, agent_keys: &[&str], depth: u8) -> ProgressTracker {
    let registry = Arc::new(TrackerRegistry::new());
    ProgressTracker::new(
        "analysis_test",
        generate_steps(&agents(agent_keys), depth, &roles()),
        120.0,
        store,
        Duration::from_secs(3600),
        Arc::downgrade(&registry),
    )
}

#[test]
fn step_weights_always_sum_to_one() {
    for (keys, depth) in [
        (vec!["technical_analyst"], 1u8),
        (vec!["technical_analyst", "news_hunter", "fundamental_expert"], 2),
        (vec!["technical_analyst", "news_hunter"], 3),
        (vec!["risk_manager"], 5),
    ] {
        let steps = generate_steps(&agents(&keys), depth, &roles());
        let total: f64 = steps.iter().map(|s| s.weight).sum();
        assert!(
            (total - 1.0).abs() < 1e-6,
            "weights for depth {} sum to {}",
            depth,
            total
        );
    }
}

#[test]
fn stage_counts_follow_depth() {
    // Depth 1: five prep stages, one analyst, advice, risk notice, report.
    let steps = generate_steps(&agents(&["technical_analyst"]), 1, &roles());
    assert_eq!(steps.len(), 9);

    // Depth 2 adds bull, bear, and synthesis stages.
    let steps = generate_steps(&agents(&["technical_analyst"]), 2, &roles());
    assert_eq!(steps.len(), 12);

    // Depth 3 swaps the risk notice for four strategy/risk stages.
    let steps = generate_steps(&agents(&["technical_analyst"]), 3, &roles());
    assert_eq!(steps.len(), 15);
}

#[test]
fn duration_estimate_scales_with_team_and_depth() {
    let quick = estimate_total_duration(1, 1, None);
    let deep = estimate_total_duration(3, 3, None);
    assert!(deep > quick);
    // DeepSeek is the fast provider, Google the slow one.
    assert!(estimate_total_duration(2, 2, Some("deepseek")) < estimate_total_duration(2, 2, Some("google")));
}

#[tokio::test]
async fn progress_is_monotonic_even_for_stale_messages() {
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker_with_store(store.clone(), &["technical_analyst"], 1);

    tracker.update("Validating stock symbol", Some(0)).await;
    tracker.update("module started: Technical Analyst", None).await;
    let mid = tracker.snapshot().await.progress_percent;

    // A message that maps to an earlier step must not regress the counter.
    tracker.update("Environment check again", None).await;
    let after = tracker.snapshot().await.progress_percent;
    assert!(after >= mid);

    tracker.update("Generating investment advice", None).await;
    let advice = tracker.snapshot().await.progress_percent;
    assert!(advice >= after);
}

#[tokio::test]
async fn streaming_messages_are_throttled() {
    let store = Arc::new(CountingStore::new());
    let tracker = tracker_with_store(store.clone(), &["technical_analyst"], 1);

    let base = store.write_count();
    tracker.update("[stream] token one", None).await;
    tracker.update("[stream] token two", None).await;
    tracker.update("[stream] token three", None).await;
    // Only the first streaming write goes through inside the window.
    assert_eq!(store.write_count(), base + 1);

    // Non-streaming messages always write.
    tracker.update("Configuring parameters", None).await;
    assert_eq!(store.write_count(), base + 2);
}

#[tokio::test]
async fn terminal_state_freezes_the_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker_with_store(store.clone(), &["technical_analyst"], 1);

    tracker.update("module started: Technical Analyst", None).await;
    tracker
        .mark_completed("Analysis completed", Some(serde_json::json!({"answer": 42})))
        .await;

    let done = load_snapshot(store.as_ref(), "analysis_test").await.unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!((done.progress_percent - 100.0).abs() < 1e-9);
    assert_eq!(done.remaining_sec, 0.0);
    assert_eq!(done.raw_results, Some(serde_json::json!({"answer": 42})));

    // Late streaming fragments change nothing.
    tracker.update("[stream] leftover token", None).await;
    let after = load_snapshot(store.as_ref(), "analysis_test").await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Completed);
    assert_eq!(after.progress_percent, done.progress_percent);
    assert_eq!(after.last_message, done.last_message);
}

#[tokio::test]
async fn mark_failed_keeps_partial_progress() {
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker_with_store(store.clone(), &["technical_analyst"], 1);

    tracker.update("module started: Technical Analyst", None).await;
    let before = tracker.snapshot().await.progress_percent;
    tracker.mark_failed("provider outage").await;

    let snapshot = load_snapshot(store.as_ref(), "analysis_test").await.unwrap().unwrap();
    assert_eq!(snapshot.status, RunStatus::Failed);
    assert!(snapshot.last_message.contains("provider outage"));
    assert!(snapshot.progress_percent >= before);
    assert!(snapshot.progress_percent < 100.0);
}

#[tokio::test]
async fn completed_tracker_leaves_the_registry() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(TrackerRegistry::new());
    let tracker = Arc::new(ProgressTracker::new(
        "analysis_reg",
        generate_steps(&agents(&["technical_analyst"]), 1, &roles()),
        60.0,
        store,
        Duration::from_secs(3600),
        Arc::downgrade(&registry),
    ));
    registry.insert(Arc::clone(&tracker));
    assert_eq!(registry.active_count(), 1);

    tracker.mark_completed("Analysis completed", None).await;
    assert_eq!(registry.active_count(), 0);
}

#[tokio::test]
async fn snapshot_round_trips_through_the_store() {
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker_with_store(store.clone(), &["technical_analyst", "news_hunter"], 2);
    tracker.update("module started: News Hunter", None).await;

    let live = tracker.snapshot().await;
    let loaded = load_snapshot(store.as_ref(), "analysis_test").await.unwrap().unwrap();
    assert_eq!(loaded.analysis_id, live.analysis_id);
    assert_eq!(loaded.current_step_index, live.current_step_index);
    assert_eq!(loaded.steps, live.steps);
    assert_eq!(loaded.total_steps, live.total_steps);
}
