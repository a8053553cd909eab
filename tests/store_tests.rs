use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tradecouncil::store::{
    analysis_key, progress_key, session_key, FileStore, KvStore, LayeredStore, MemoryStore,
    StoreError, USAGE_LOG,
};
use tradecouncil::usage::{BudgetStatus, UsageRecord, UsageTracker};

/// A primary that is always down, to exercise the fallback path.
struct DeadStore;

#[async_trait]
impl KvStore for DeadStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> Result<(), StoreError> {
        Err(StoreError("connection refused".to_string()))
    }

    async fn del(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError("connection refused".to_string()))
    }

    async fn append(&self, _stream_key: &str, _record: &[u8]) -> Result<(), StoreError> {
        Err(StoreError("connection refused".to_string()))
    }

    async fn read_log(&self, _stream_key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Err(StoreError("connection refused".to_string()))
    }

    async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError("connection refused".to_string()))
    }
}

#[tokio::test]
async fn memory_store_honours_ttl() {
    let store = MemoryStore::new();
    store
        .set("progress:a", b"{}", Some(Duration::from_millis(40)))
        .await
        .unwrap();
    assert!(store.get("progress:a").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store.get("progress:a").await.unwrap().is_none());
    assert!(store.list_keys("progress:").await.unwrap().is_empty());
}

#[tokio::test]
async fn memory_store_set_replaces_atomically() {
    let store = MemoryStore::new();
    store.set("session:t", b"first", None).await.unwrap();
    store.set("session:t", b"second", None).await.unwrap();
    assert_eq!(store.get("session:t").await.unwrap().unwrap(), b"second");
}

#[tokio::test]
async fn file_store_round_trips_and_sanitises_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path()).unwrap();

    let key = progress_key("analysis_20250115_abc");
    store.set(&key, br#"{"x":1}"#, None).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap().unwrap(), br#"{"x":1}"#);

    // Colons never reach the filesystem.
    assert!(dir.path().join("progress_analysis_20250115_abc.json").exists());

    let keys = store.list_keys("progress:").await.unwrap();
    assert_eq!(keys, vec![key.clone()]);

    store.del(&key).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn file_store_appends_jsonl_logs() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path()).unwrap();

    store.append(USAGE_LOG, br#"{"n":1}"#).await.unwrap();
    store.append(USAGE_LOG, br#"{"n":2}"#).await.unwrap();

    let records = store.read_log(USAGE_LOG).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], br#"{"n":1}"#);
    assert_eq!(records[1], br#"{"n":2}"#);
    assert!(dir.path().join("usage.log").exists());
}

#[tokio::test]
async fn file_store_sweeps_entries_past_their_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path()).unwrap();

    store
        .set(&session_key("old"), b"{}", Some(Duration::from_secs(0)))
        .await
        .unwrap();
    store.set(&analysis_key("fresh"), b"{}", None).await.unwrap();

    // Ages are measured in whole seconds.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let removed = store.sweep_expired();
    assert_eq!(removed, 1);
    assert!(store.get(&session_key("old")).await.unwrap().is_none());
    assert!(store.get(&analysis_key("fresh")).await.unwrap().is_some());
}

#[tokio::test]
async fn layered_store_degrades_to_files_when_primary_is_down() {
    let dir = tempfile::tempdir().unwrap();
    let layered = LayeredStore::new(
        Some(Arc::new(DeadStore)),
        FileStore::new(dir.path()).unwrap(),
    );

    layered.set("progress:x", b"{}", None).await.unwrap();
    assert_eq!(layered.get("progress:x").await.unwrap().unwrap(), b"{}");

    layered.append(USAGE_LOG, br#"{"n":1}"#).await.unwrap();
    assert_eq!(layered.read_log(USAGE_LOG).await.unwrap().len(), 1);

    // The data really lives in the fallback files.
    assert!(dir.path().join("progress_x.json").exists());
}

#[tokio::test]
async fn layered_store_prefers_the_primary() {
    let dir = tempfile::tempdir().unwrap();
    let primary = Arc::new(MemoryStore::new());
    let layered = LayeredStore::new(Some(primary.clone()), FileStore::new(dir.path()).unwrap());

    layered.set("session:s", b"hello", None).await.unwrap();
    assert_eq!(primary.get("session:s").await.unwrap().unwrap(), b"hello");
    // Nothing was written to disk: the primary accepted the write.
    assert!(!dir.path().join("session_s.json").exists());
}

#[tokio::test]
async fn usage_tracker_sums_per_session() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let tracker = UsageTracker::new(store);

    tracker
        .record(&UsageRecord::new("google", "gemini-2.5-pro", 100, 50, 0.2, "s1", "multi_model_general"))
        .await;
    tracker
        .record(&UsageRecord::new("siliconflow", "deepseek-ai/DeepSeek-V3", 80, 40, 0.1, "s1", "multi_model_general"))
        .await;
    tracker
        .record(&UsageRecord::new("google", "gemini-2.5-pro", 10, 5, 0.9, "s2", "multi_model_general"))
        .await;

    assert!((tracker.session_cost("s1").await - 0.3).abs() < 1e-9);
    assert!((tracker.session_cost("s2").await - 0.9).abs() < 1e-9);
    assert_eq!(tracker.session_records("s1").await.len(), 2);

    assert_eq!(tracker.check_budget("s1", Some(1.0)).await, BudgetStatus::Ok);
    assert_eq!(tracker.check_budget("s1", Some(0.25)).await, BudgetStatus::Exceeded);
    assert_eq!(tracker.check_budget("s1", None).await, BudgetStatus::Ok);
}
