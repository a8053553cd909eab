//! Weighted progress tracking for a running analysis.
//!
//! Every analysis owns a [`ProgressTracker`] that maintains one
//! [`ProgressSnapshot`] and publishes it to the store under
//! `progress:{analysis_id}`. Stages are generated dynamically from the
//! selected agents and the research depth; each carries a weight and the
//! weights always normalise to 1.0, so the reported percentage is a weighted
//! prefix sum.
//!
//! Progress never regresses. High-frequency streaming messages (prefix
//! `[stream]`) are coalesced to at most one store write per 500 ms, and after
//! a terminal state they are ignored entirely.

use crate::tradecouncil::roles::RoleRegistry;
use crate::tradecouncil::store::{progress_key, KvStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Weak handle back to the registry so terminal transitions can de-register
/// without creating a reference cycle.
pub type TrackerWeak = std::sync::Weak<TrackerRegistry>;

/// Externally visible state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage of the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStep {
    pub name: String,
    pub description: String,
    pub weight: f64,
}

/// Snapshot persisted for UI polling and crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub analysis_id: String,
    pub status: RunStatus,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub current_step_name: String,
    pub current_step_description: String,
    pub progress_percent: f64,
    pub elapsed_sec: f64,
    pub estimated_total_sec: f64,
    pub remaining_sec: f64,
    pub last_message: String,
    pub last_update_epoch: f64,
    pub steps: Vec<ProgressStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_results: Option<serde_json::Value>,
}

fn step(name: &str, description: &str, weight: f64) -> ProgressStep {
    ProgressStep {
        name: name.to_string(),
        description: description.to_string(),
        weight,
    }
}

/// Build the stage list for a run. Weights are normalised so they always sum
/// to exactly 1.0.
pub fn generate_steps(agents: &[String], research_depth: u8, roles: &RoleRegistry) -> Vec<ProgressStep> {
    let mut steps = vec![
        step("Preparation", "Validate the stock symbol and check data source availability", 0.05),
        step("Environment check", "Verify API key configuration and data access", 0.02),
        step("Cost estimate", "Project the API cost for the chosen research depth", 0.01),
        step("Parameter setup", "Configure analysis parameters and model selection", 0.02),
        step("Engine startup", "Initialise the analysis engine", 0.05),
    ];

    let per_agent = 0.60 / agents.len().max(1) as f64;
    for agent in agents {
        let display = roles.display_name(agent);
        steps.push(step(
            &display,
            &format!("{} works through its specialist view", display),
            per_agent,
        ));
    }

    if research_depth >= 2 {
        steps.push(step("Bull view", "Argue the upside case and upside potential", 0.06));
        steps.push(step("Bear view", "Argue the downside case and key vulnerabilities", 0.06));
        steps.push(step("View synthesis", "Reconcile bull and bear views into a balanced stance", 0.05));
    }

    steps.push(step("Investment advice", "Turn the analysis into concrete buy/sell guidance", 0.06));

    if research_depth >= 3 {
        steps.push(step("Aggressive strategy", "Evaluate the high-risk, high-reward approach", 0.03));
        steps.push(step("Conservative strategy", "Evaluate the low-risk, capital-preserving approach", 0.03));
        steps.push(step("Balanced strategy", "Evaluate the risk-balanced approach", 0.03));
        steps.push(step("Risk controls", "Define stop-loss levels and risk control measures", 0.04));
    } else {
        steps.push(step("Risk notice", "Identify the principal risks of the position", 0.05));
    }

    steps.push(step("Report assembly", "Assemble the final analysis report", 0.04));

    let total: f64 = steps.iter().map(|s| s.weight).sum();
    for s in &mut steps {
        s.weight /= total;
    }
    steps
}

/// Expected wall-clock for a run, in seconds, from the team size, the depth,
/// and the preferred provider's typical speed.
pub fn estimate_total_duration(num_analysts: usize, research_depth: u8, provider_pref: Option<&str>) -> f64 {
    let base = 60.0;
    let per_analyst = match research_depth {
        0 | 1 => 120.0,
        2 => 180.0,
        _ => 240.0,
    };
    let provider_factor = match provider_pref {
        Some("deepseek") => 0.7,
        Some("google") => 1.3,
        _ => 1.0,
    };
    let depth_factor = match research_depth {
        0 | 1 => 0.8,
        2 => 1.0,
        _ => 1.3,
    };
    (base + num_analysts as f64 * per_analyst) * provider_factor * depth_factor
}

enum StepTarget {
    Index(usize),
    Named(&'static str),
    Next,
    Hold,
}

/// Keyword table for legacy log-string step detection. Kept data-driven so
/// the rules live in one place; the typed update path (explicit `step`
/// argument) is preferred.
const STEP_KEYWORDS: &[(&str, StepTarget)] = &[
    ("validat", StepTarget::Index(0)),
    ("data source", StepTarget::Index(0)),
    ("environment", StepTarget::Index(1)),
    ("api key", StepTarget::Index(1)),
    ("cost estimate", StepTarget::Index(2)),
    ("configur", StepTarget::Index(3)),
    ("parameter", StepTarget::Index(3)),
    ("initialis", StepTarget::Index(4)),
    ("initializ", StepTarget::Index(4)),
    ("engine", StepTarget::Index(4)),
    ("bull", StepTarget::Named("Bull view")),
    ("bear", StepTarget::Named("Bear view")),
    ("view synthesis", StepTarget::Named("View synthesis")),
    ("investment advice", StepTarget::Named("Investment advice")),
    ("risk control", StepTarget::Named("Risk controls")),
    ("risk notice", StepTarget::Named("Risk notice")),
    ("report", StepTarget::Named("Report assembly")),
    ("module completed", StepTarget::Next),
    ("tool call", StepTarget::Hold),
];

struct TrackState {
    status: RunStatus,
    current_step: usize,
    estimated_total: f64,
    last_message: String,
    max_percent: f64,
    explicitly_done: bool,
    last_stream_write: Option<Instant>,
    raw_results: Option<serde_json::Value>,
}

/// Publishes weighted progress for one analysis.
pub struct ProgressTracker {
    analysis_id: String,
    steps: Vec<ProgressStep>,
    store: Arc<dyn KvStore>,
    ttl: Duration,
    started: Instant,
    registry: TrackerWeak,
    state: Mutex<TrackState>,
}

/// Minimum spacing between store writes triggered by streaming messages.
const STREAM_WRITE_INTERVAL: Duration = Duration::from_millis(500);

impl ProgressTracker {
    pub fn new(
        analysis_id: &str,
        steps: Vec<ProgressStep>,
        estimated_total_sec: f64,
        store: Arc<dyn KvStore>,
        ttl: Duration,
        registry: TrackerWeak,
    ) -> Self {
        Self {
            analysis_id: analysis_id.to_string(),
            steps,
            store,
            ttl,
            started: Instant::now(),
            registry,
            state: Mutex::new(TrackState {
                status: RunStatus::Running,
                current_step: 0,
                estimated_total: estimated_total_sec,
                last_message: String::new(),
                max_percent: 0.0,
                explicitly_done: false,
                last_stream_write: None,
                raw_results: None,
            }),
        }
    }

    pub fn analysis_id(&self) -> &str {
        &self.analysis_id
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Record a progress event. When `step` is absent the step is detected
    /// from the message via the keyword table; the step index never moves
    /// backwards.
    pub async fn update(&self, message: &str, step: Option<usize>) {
        let is_stream = message.starts_with("[stream]");
        let mut state = self.state.lock().await;
        if (state.explicitly_done || state.status.is_terminal()) && is_stream {
            return;
        }
        if state.status.is_terminal() {
            return;
        }

        let detected = step.or_else(|| self.detect_step(message, state.current_step));
        if let Some(idx) = detected {
            let idx = idx.min(self.steps.len().saturating_sub(1));
            if idx >= state.current_step {
                state.current_step = idx;
            }
        }
        state.last_message = message.to_string();

        if is_stream {
            let now = Instant::now();
            let throttled = state
                .last_stream_write
                .is_some_and(|at| now.duration_since(at) < STREAM_WRITE_INTERVAL);
            if throttled {
                return;
            }
            state.last_stream_write = Some(now);
        }

        let snapshot = self.build_snapshot(&mut state, message);
        drop(state);
        self.save(&snapshot).await;
    }

    fn detect_step(&self, message: &str, current: usize) -> Option<usize> {
        let lower = message.to_lowercase();

        // Analyst markers: "module started: <display name>" advances to the
        // step named after that analyst.
        if let Some(rest) = lower.split("module started:").nth(1) {
            let marker = rest.trim();
            return self
                .steps
                .iter()
                .position(|s| s.name.to_lowercase().contains(marker));
        }

        for (keyword, target) in STEP_KEYWORDS {
            if !lower.contains(keyword) {
                continue;
            }
            return match target {
                StepTarget::Index(idx) => Some(*idx),
                StepTarget::Named(name) => self.steps.iter().position(|s| s.name == *name),
                StepTarget::Next => Some((current + 1).min(self.steps.len() - 1)),
                StepTarget::Hold => None,
            };
        }
        None
    }

    fn build_snapshot(&self, state: &mut TrackState, message: &str) -> ProgressSnapshot {
        let last = self.steps.len().saturating_sub(1);
        let computed = if state.current_step >= last {
            100.0
        } else {
            let done: f64 = self.steps[..state.current_step].iter().map(|s| s.weight).sum();
            let total: f64 = self.steps.iter().map(|s| s.weight).sum();
            (done / total * 100.0).min(100.0)
        };
        let percent = computed.max(state.max_percent);
        state.max_percent = percent;

        let elapsed = self.started.elapsed().as_secs_f64();
        let mut remaining = (state.estimated_total - elapsed).max(0.0);
        if remaining <= 0.0 && percent > 0.0 {
            state.estimated_total = elapsed / (percent / 100.0);
            remaining = (state.estimated_total - elapsed).max(0.0);
        }

        let info = &self.steps[state.current_step.min(last)];
        let lower = message.to_lowercase();
        let description = if lower.contains("tool call") {
            "Calling analysis tools...".to_string()
        } else if lower.contains("module started") {
            format!("Starting {}...", info.name)
        } else if lower.contains("module completed") {
            format!("{} completed", info.name)
        } else {
            info.description.clone()
        };

        ProgressSnapshot {
            analysis_id: self.analysis_id.clone(),
            status: state.status,
            current_step_index: state.current_step,
            total_steps: self.steps.len(),
            current_step_name: info.name.clone(),
            current_step_description: description,
            progress_percent: percent,
            elapsed_sec: elapsed,
            estimated_total_sec: state.estimated_total,
            remaining_sec: remaining,
            last_message: state.last_message.clone(),
            last_update_epoch: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            steps: self.steps.clone(),
            raw_results: state.raw_results.clone(),
        }
    }

    async fn save(&self, snapshot: &ProgressSnapshot) {
        match serde_json::to_vec(snapshot) {
            Ok(bytes) => {
                if let Err(e) = self
                    .store
                    .set(&progress_key(&self.analysis_id), &bytes, Some(self.ttl))
                    .await
                {
                    log::error!("could not persist progress for {}: {}", self.analysis_id, e);
                }
            }
            Err(e) => log::error!("could not serialise progress snapshot: {}", e),
        }
    }

    /// Terminal success. Progress jumps to 100, remaining time to zero, and
    /// the tracker leaves the active registry. Later streaming updates are
    /// ignored.
    pub async fn mark_completed(&self, message: &str, results: Option<serde_json::Value>) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.explicitly_done = true;
            state.status = RunStatus::Completed;
            state.current_step = self.steps.len().saturating_sub(1);
            state.last_message = message.to_string();
            state.max_percent = 100.0;
            if let Some(results) = results {
                state.raw_results = Some(results);
            }
            let mut snapshot = self.build_snapshot(&mut state, message);
            snapshot.progress_percent = 100.0;
            snapshot.remaining_sec = 0.0;
            snapshot
        };
        self.save(&snapshot).await;
        self.deregister();
        log::info!("analysis {} completed", self.analysis_id);
    }

    /// Terminal failure; the snapshot keeps the last progress value.
    pub async fn mark_failed(&self, error_message: &str) {
        let message = format!("Analysis failed: {}", error_message);
        let snapshot = {
            let mut state = self.state.lock().await;
            state.explicitly_done = true;
            state.status = RunStatus::Failed;
            state.last_message = message.clone();
            self.build_snapshot(&mut state, &message)
        };
        self.save(&snapshot).await;
        self.deregister();
        log::error!("analysis {} failed: {}", self.analysis_id, error_message);
    }

    /// Terminal cancellation.
    pub async fn mark_cancelled(&self, message: &str) {
        let snapshot = {
            let mut state = self.state.lock().await;
            state.explicitly_done = true;
            state.status = RunStatus::Cancelled;
            state.last_message = message.to_string();
            self.build_snapshot(&mut state, message)
        };
        self.save(&snapshot).await;
        self.deregister();
        log::info!("analysis {} cancelled", self.analysis_id);
    }

    /// Reflect a pause or resume in the persisted status without touching
    /// progress.
    pub async fn set_paused(&self, paused: bool) {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.status.is_terminal() {
                return;
            }
            state.status = if paused { RunStatus::Paused } else { RunStatus::Running };
            let message = state.last_message.clone();
            self.build_snapshot(&mut state, &message)
        };
        self.save(&snapshot).await;
    }

    /// Current snapshot without touching the store.
    pub async fn snapshot(&self) -> ProgressSnapshot {
        let mut state = self.state.lock().await;
        let message = state.last_message.clone();
        self.build_snapshot(&mut state, &message)
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.analysis_id);
        }
    }
}

/// Thread-safe registry of the trackers for in-flight analyses, keyed by
/// analysis id. Owned by the orchestrator root; trackers remove themselves on
/// terminal transitions.
#[derive(Default)]
pub struct TrackerRegistry {
    inner: std::sync::Mutex<std::collections::HashMap<String, Arc<ProgressTracker>>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tracker: Arc<ProgressTracker>) {
        self.inner
            .lock()
            .unwrap()
            .insert(tracker.analysis_id().to_string(), tracker);
    }

    pub fn get(&self, analysis_id: &str) -> Option<Arc<ProgressTracker>> {
        self.inner.lock().unwrap().get(analysis_id).cloned()
    }

    pub fn remove(&self, analysis_id: &str) {
        self.inner.lock().unwrap().remove(analysis_id);
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
