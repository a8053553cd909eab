//! Worker lifecycle tracking and cooperative cancellation.
//!
//! Every spawned analysis worker registers here under its analysis id. The
//! tracker answers liveness queries, reconciles status against the persisted
//! progress snapshot, and hands out the per-run [`RunControl`] used for
//! pause, resume, and cancel. All mutations go through a single mutex.

use crate::tradecouncil::error::TaskError;
use crate::tradecouncil::progress::RunStatus;
use crate::tradecouncil::store::{load_snapshot, KvStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cooperative control flags for one run.
///
/// Cancellation and pause are advisory: the coordinator and manager consult
/// them between tasks, backoff sleeps, and debate rounds. In-flight adapter
/// calls are never interrupted; their results are simply discarded.
#[derive(Default)]
pub struct RunControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Sleep for up to `duration`, waking early on cancellation. Returns true
    /// when the sleep ended because the run was cancelled.
    pub async fn sleep_cancellable(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.is_cancelled();
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(50))).await;
        }
    }

    /// Gate between units of work: waits while paused, errors when cancelled.
    /// Paused runs start no new tasks until resumed.
    pub async fn checkpoint(&self) -> Result<(), TaskError> {
        loop {
            if self.is_cancelled() {
                return Err(TaskError::cancelled());
            }
            if !self.is_paused() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Handle to one spawned worker.
pub struct WorkerHandle {
    pub control: Arc<RunControl>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn new(control: Arc<RunControl>, join: tokio::task::JoinHandle<()>) -> Self {
        Self { control, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Status answered to callers polling a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

/// Registry of in-flight workers plus status reconciliation against the
/// store.
pub struct LifecycleTracker {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    store: Arc<dyn KvStore>,
}

impl LifecycleTracker {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn register(&self, analysis_id: &str, handle: WorkerHandle) {
        self.workers
            .lock()
            .unwrap()
            .insert(analysis_id.to_string(), handle);
        log::debug!("registered worker for {}", analysis_id);
    }

    pub fn unregister(&self, analysis_id: &str) {
        self.workers.lock().unwrap().remove(analysis_id);
    }

    /// Whether a live worker exists for the run. Finished workers are
    /// removed on the way out.
    pub fn is_alive(&self, analysis_id: &str) -> bool {
        let mut workers = self.workers.lock().unwrap();
        match workers.get(analysis_id) {
            Some(handle) if handle.is_finished() => {
                workers.remove(analysis_id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn control(&self, analysis_id: &str) -> Option<Arc<RunControl>> {
        self.workers
            .lock()
            .unwrap()
            .get(analysis_id)
            .map(|h| Arc::clone(&h.control))
    }

    /// Idempotent cancel. Returns true when a live worker received the
    /// signal.
    pub fn cancel(&self, analysis_id: &str) -> bool {
        match self.control(analysis_id) {
            Some(control) => {
                control.cancel();
                true
            }
            None => false,
        }
    }

    pub fn pause(&self, analysis_id: &str) -> bool {
        match self.control(analysis_id) {
            Some(control) => {
                control.pause();
                true
            }
            None => false,
        }
    }

    pub fn resume(&self, analysis_id: &str) -> bool {
        match self.control(analysis_id) {
            Some(control) => {
                control.resume();
                true
            }
            None => false,
        }
    }

    /// Reconciled status: a live worker means running; otherwise the stored
    /// snapshot decides. A snapshot still marked running with no live worker
    /// is an abnormal termination and reads as failed.
    pub async fn status(&self, analysis_id: &str) -> LifecycleStatus {
        if self.is_alive(analysis_id) {
            return LifecycleStatus::Running;
        }
        match load_snapshot(self.store.as_ref(), analysis_id).await {
            Ok(Some(snapshot)) => match snapshot.status {
                RunStatus::Completed => LifecycleStatus::Completed,
                RunStatus::Cancelled => LifecycleStatus::Cancelled,
                RunStatus::Failed => LifecycleStatus::Failed,
                RunStatus::Pending | RunStatus::Running | RunStatus::Paused => {
                    LifecycleStatus::Failed
                }
            },
            Ok(None) => LifecycleStatus::NotFound,
            Err(e) => {
                log::warn!("status lookup for {} hit a store error: {}", analysis_id, e);
                LifecycleStatus::NotFound
            }
        }
    }

    /// Most recently updated runs, newest first, capped at `limit`.
    pub async fn list_latest(&self, limit: usize) -> Vec<(String, RunStatus, f64)> {
        let keys = match self.store.list_keys("progress:").await {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("could not list progress keys: {}", e);
                return Vec::new();
            }
        };
        let mut entries = Vec::new();
        for key in keys {
            let Some(analysis_id) = key.strip_prefix("progress:") else {
                continue;
            };
            if let Ok(Some(snapshot)) = load_snapshot(self.store.as_ref(), analysis_id).await {
                entries.push((
                    snapshot.analysis_id,
                    snapshot.status,
                    snapshot.last_update_epoch,
                ));
            }
        }
        entries.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(limit);
        entries
    }

    /// The most recently updated analysis id, if any. Lets a UI recover its
    /// session after a reload.
    pub async fn latest_analysis_id(&self) -> Option<String> {
        self.list_latest(1).await.into_iter().next().map(|(id, _, _)| id)
    }
}
