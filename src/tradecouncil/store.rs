//! Pluggable key-value persistence with TTL.
//!
//! The engine persists progress snapshots, session records, analysis runs,
//! and two append-only logs through the [`KvStore`] trait. Two
//! implementations ship: [`MemoryStore`], the in-process stand-in for a
//! networked cache, and [`FileStore`], one JSON file per key under a data
//! directory. [`LayeredStore`] composes them: writes go to the primary first
//! and degrade to the file fallback transparently, reads check the primary
//! then the fallback. Local files survive restarts even without a primary.
//!
//! Snapshot writes are single-shot replacements; a reader never observes a
//! partially written value.

use crate::tradecouncil::progress::ProgressSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Storage failure. The layered store treats any of these as a signal to
/// fall back; callers above the store see them only when both layers fail.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl Error for StoreError {}

/// Well-known key builders matching the persisted layout.
pub fn progress_key(analysis_id: &str) -> String {
    format!("progress:{}", analysis_id)
}

pub fn session_key(token: &str) -> String {
    format!("session:{}", token)
}

pub fn analysis_key(analysis_id: &str) -> String {
    format!("analysis:{}", analysis_id)
}

pub fn model_perf_key(model: &str, task_type: &str) -> String {
    format!("model_perf:{},{}", model, task_type)
}

pub const USAGE_LOG: &str = "usage.log";
pub const ROUTING_LOG: &str = "routing_decisions";

/// Per-key-class retention used by both store layers.
#[derive(Debug, Clone, Copy)]
pub struct StoreTtls {
    pub progress: Duration,
    pub session: Duration,
    pub analysis: Duration,
}

impl Default for StoreTtls {
    fn default() -> Self {
        Self {
            progress: Duration::from_secs(3600),
            session: Duration::from_secs(24 * 3600),
            analysis: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl StoreTtls {
    /// Retention for a key inferred from its prefix; `None` means keep.
    pub fn for_key(&self, key: &str) -> Option<Duration> {
        if key.starts_with("progress:") {
            Some(self.progress)
        } else if key.starts_with("session:") {
            Some(self.session)
        } else if key.starts_with("analysis:") {
            Some(self.analysis)
        } else {
            None
        }
    }
}

/// Minimal KV contract the engine depends on.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Append one record to an ordered log stream.
    async fn append(&self, stream_key: &str, record: &[u8]) -> Result<(), StoreError>;
    /// Read every record of a log stream, in append order.
    async fn read_log(&self, stream_key: &str) -> Result<Vec<Vec<u8>>, StoreError>;
    /// Keys currently live under a prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

struct MemEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryInner {
    entries: HashMap<String, MemEntry>,
    logs: HashMap<String, Vec<Vec<u8>>>,
}

/// In-memory KV with TTL. Stands in for a networked cache in production
/// wiring and doubles as the test store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock().await;
        let expired = inner
            .entries
            .get(key)
            .map(|e| e.expires_at.is_some_and(|at| at <= Instant::now()));
        match expired {
            None => Ok(None),
            Some(true) => {
                inner.entries.remove(key);
                Ok(None)
            }
            Some(false) => Ok(inner.entries.get(key).map(|e| e.data.clone())),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            key.to_string(),
            MemEntry {
                data: value.to_vec(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().await.entries.remove(key);
        Ok(())
    }

    async fn append(&self, stream_key: &str, record: &[u8]) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .logs
            .entry(stream_key.to_string())
            .or_default()
            .push(record.to_vec());
        Ok(())
    }

    async fn read_log(&self, stream_key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .logs
            .get(stream_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// On-disk envelope for one KV entry. Carrying the original key inside the
/// file makes prefix listing unambiguous even though `:` is not allowed in
/// file names.
#[derive(Serialize, Deserialize)]
struct FileEntry {
    key: String,
    stored_at: i64,
    ttl_sec: Option<u64>,
    value: String,
}

/// File-backed fallback store: one JSON file per key, JSON-lines log files.
///
/// Key files are written to a temp path and renamed into place so readers
/// never see a torn value.
pub struct FileStore {
    root: PathBuf,
    ttls: StoreTtls,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_ttls(root, StoreTtls::default())
    }

    pub fn with_ttls(root: impl AsRef<Path>, ttls: StoreTtls) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| StoreError(e.to_string()))?;
        Ok(Self { root, ttls })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key.replace(':', "_")))
    }

    fn log_path(&self, stream_key: &str) -> PathBuf {
        if stream_key.ends_with(".log") {
            self.root.join(stream_key)
        } else {
            self.root.join(format!("{}.log", stream_key))
        }
    }

    fn read_entry(path: &Path) -> Option<FileEntry> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn entry_expired(&self, entry: &FileEntry) -> bool {
        let age_sec = (chrono::Utc::now().timestamp() - entry.stored_at).max(0) as u64;
        let limit = entry
            .ttl_sec
            .or_else(|| self.ttls.for_key(&entry.key).map(|d| d.as_secs()));
        limit.is_some_and(|l| age_sec > l)
    }

    /// Garbage-collect entries past their retention. Returns the number of
    /// files removed.
    pub fn sweep_expired(&self) -> usize {
        let Ok(dir) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for file in dir.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = Self::read_entry(&path) {
                if self.entry_expired(&entry) && std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::debug!("file store swept {} expired entries", removed);
        }
        removed
    }
}

#[async_trait::async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        match Self::read_entry(&path) {
            Some(entry) if !self.entry_expired(&entry) => Ok(Some(entry.value.into_bytes())),
            Some(_) => {
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
            None => Err(StoreError(format!("unreadable entry at {:?}", path))),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = FileEntry {
            key: key.to_string(),
            stored_at: chrono::Utc::now().timestamp(),
            ttl_sec: ttl.map(|d| d.as_secs()),
            value: String::from_utf8_lossy(value).into_owned(),
        };
        let path = self.key_path(key);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(&entry).map_err(|e| StoreError(e.to_string()))?;
        std::fs::write(&tmp, body).map_err(|e| StoreError(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let path = self.key_path(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StoreError(e.to_string()))?;
        }
        Ok(())
    }

    async fn append(&self, stream_key: &str, record: &[u8]) -> Result<(), StoreError> {
        use std::io::Write;
        let path = self.log_path(stream_key);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError(e.to_string()))?;
        file.write_all(record).map_err(|e| StoreError(e.to_string()))?;
        file.write_all(b"\n").map_err(|e| StoreError(e.to_string()))
    }

    async fn read_log(&self, stream_key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let path = self.log_path(stream_key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| StoreError(e.to_string()))?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.as_bytes().to_vec())
            .collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = std::fs::read_dir(&self.root).map_err(|e| StoreError(e.to_string()))?;
        let mut keys = Vec::new();
        for file in dir.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = Self::read_entry(&path) {
                if entry.key.starts_with(prefix) && !self.entry_expired(&entry) {
                    keys.push(entry.key);
                }
            }
        }
        Ok(keys)
    }
}

/// Primary-plus-fallback composition.
///
/// Writers always attempt the primary first; when it fails the write degrades
/// to the file store with a logged warning. Readers consult the primary, then
/// the fallback.
pub struct LayeredStore {
    primary: Option<std::sync::Arc<dyn KvStore>>,
    fallback: FileStore,
}

impl LayeredStore {
    pub fn new(primary: Option<std::sync::Arc<dyn KvStore>>, fallback: FileStore) -> Self {
        Self { primary, fallback }
    }

    /// File-only layout, used when no networked cache is configured.
    pub fn file_only(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            primary: None,
            fallback: FileStore::new(root)?,
        })
    }

    pub fn sweep_expired(&self) -> usize {
        self.fallback.sweep_expired()
    }
}

#[async_trait::async_trait]
impl KvStore for LayeredStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => log::warn!("primary store read failed for '{}': {}", key, e),
            }
        }
        self.fallback.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        if let Some(primary) = &self.primary {
            match primary.set(key, value, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("primary store write failed for '{}', using fallback: {}", key, e)
                }
            }
        }
        self.fallback.set(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.del(key).await {
                log::warn!("primary store delete failed for '{}': {}", key, e);
            }
        }
        self.fallback.del(key).await
    }

    async fn append(&self, stream_key: &str, record: &[u8]) -> Result<(), StoreError> {
        if let Some(primary) = &self.primary {
            match primary.append(stream_key, record).await {
                Ok(()) => return Ok(()),
                Err(e) => log::warn!(
                    "primary store append failed for '{}', using fallback: {}",
                    stream_key,
                    e
                ),
            }
        }
        self.fallback.append(stream_key, record).await
    }

    async fn read_log(&self, stream_key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.read_log(stream_key).await {
                Ok(records) if !records.is_empty() => return Ok(records),
                Ok(_) => {}
                Err(e) => log::warn!("primary store log read failed for '{}': {}", stream_key, e),
            }
        }
        self.fallback.read_log(stream_key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        if let Some(primary) = &self.primary {
            match primary.list_keys(prefix).await {
                Ok(primary_keys) => keys.extend(primary_keys),
                Err(e) => log::warn!("primary store listing failed for '{}': {}", prefix, e),
            }
        }
        for key in self.fallback.list_keys(prefix).await? {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Typed helpers for the progress snapshot key, shared by the tracker and the
/// lifecycle queries.
pub async fn load_snapshot(
    store: &dyn KvStore,
    analysis_id: &str,
) -> Result<Option<ProgressSnapshot>, StoreError> {
    match store.get(&progress_key(analysis_id)).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError(format!("corrupt progress snapshot: {}", e))),
        None => Ok(None),
    }
}
