//! The orchestration root and its caller-facing API.
//!
//! An [`Orchestrator`] owns every sub-component: the model catalog, the
//! router, the manager, the coordinator, the layered store, the progress
//! registry, and the lifecycle tracker. There are no globals; callers hold
//! one `Orchestrator` value and drive analyses through it.
//!
//! [`Orchestrator::start_analysis`] validates the request, spawns a worker,
//! and returns immediately with an analysis id. Callers then poll
//! [`get_progress`](Orchestrator::get_progress) and fetch the final
//! [`AnalysisRun`] with [`get_result`](Orchestrator::get_result) once the
//! run completes. `pause`, `resume`, and `cancel` are idempotent and
//! cooperative.

use crate::tradecouncil::adapter::ProviderAdapter;
use crate::tradecouncil::adapters::deepseek::DeepSeekAdapter;
use crate::tradecouncil::adapters::gemini::GeminiAdapter;
use crate::tradecouncil::adapters::siliconflow::SiliconFlowAdapter;
use crate::tradecouncil::catalog::ModelCatalog;
use crate::tradecouncil::config::OrchestratorConfig;
use crate::tradecouncil::coordinator::{CollaborationMode, Coordinator};
use crate::tradecouncil::error::{ErrorKind, TaskError};
use crate::tradecouncil::lifecycle::{LifecycleStatus, LifecycleTracker, RunControl, WorkerHandle};
use crate::tradecouncil::manager::{ModelManager, TaskContext};
use crate::tradecouncil::progress::{
    estimate_total_duration, generate_steps, ProgressSnapshot, ProgressTracker, RunStatus,
    TrackerRegistry,
};
use crate::tradecouncil::roles::{PolicyConfig, RoleRegistry, RuntimeOverrides};
use crate::tradecouncil::routing::SmartRouter;
use crate::tradecouncil::store::{
    analysis_key, load_snapshot, progress_key, session_key, FileStore, KvStore, LayeredStore,
};
use crate::tradecouncil::usage::UsageTracker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Markets the analysis request can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Us,
    CnA,
    Hk,
    Global,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Us => "us",
            Market::CnA => "cn_a",
            Market::Hk => "hk",
            Market::Global => "global",
        }
    }
}

impl FromStr for Market {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "us" => Ok(Market::Us),
            "cn_a" | "cn" | "a" => Ok(Market::CnA),
            "hk" => Ok(Market::Hk),
            "global" => Ok(Market::Global),
            other => Err(TaskError::validation(format!("unknown market '{}'", other))),
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub stock_symbol: String,
    pub market: Market,
    /// ISO date the analysis refers to.
    pub analysis_date: String,
    pub selected_agents: Vec<String>,
    pub collaboration_mode: CollaborationMode,
    /// 1..=5; out-of-range values are clamped and logged.
    pub research_depth: u8,
    #[serde(default)]
    pub budget_cap: Option<f64>,
    #[serde(default)]
    pub provider_pref: Option<String>,
    #[serde(default)]
    pub runtime_overrides: Option<RuntimeOverrides>,
    /// Optional `provider:model` entries tried in order after the routed
    /// primary.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub max_debate_rounds: Option<u32>,
}

/// The top-level, user-visible record of one analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub analysis_id: String,
    pub stock_symbol: String,
    pub market: Market,
    pub analysis_date: String,
    pub selected_agents: Vec<String>,
    pub collaboration_mode: CollaborationMode,
    pub research_depth: u8,
    pub provider_pref: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: serde_json::Value,
    pub results_summary: Option<String>,
}

/// Session record enabling UI recovery across reloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub analysis_id: String,
    pub status: RunStatus,
    pub symbol: String,
    pub market: Market,
    pub form_config: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Root value wiring the whole engine together.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn KvStore>,
    layered: Arc<LayeredStore>,
    catalog: Arc<ModelCatalog>,
    manager: Arc<ModelManager>,
    coordinator: Arc<Coordinator>,
    trackers: Arc<TrackerRegistry>,
    lifecycle: Arc<LifecycleTracker>,
    roles: RoleRegistry,
}

impl Orchestrator {
    /// Wire up from configuration, building an adapter per configured
    /// provider key.
    pub fn new(config: OrchestratorConfig) -> Result<Self, TaskError> {
        let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();
        if let Some(key) = &config.deepseek_api_key {
            adapters.push(Arc::new(DeepSeekAdapter::new(key)));
        }
        if let Some(key) = &config.google_api_key {
            adapters.push(Arc::new(GeminiAdapter::new(key)));
        }
        if let Some(key) = &config.siliconflow_api_key {
            adapters.push(Arc::new(SiliconFlowAdapter::new(key)));
        }
        Self::with_adapters(config, adapters, None)
    }

    /// Wire up with explicit adapters and an optional primary store. This is
    /// the seam tests and embedders use.
    pub fn with_adapters(
        config: OrchestratorConfig,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        primary: Option<Arc<dyn KvStore>>,
    ) -> Result<Self, TaskError> {
        let fallback = FileStore::with_ttls(&config.data_dir, config.ttls)
            .map_err(|e| TaskError::internal(format!("could not open data dir: {}", e)))?;
        let layered = Arc::new(LayeredStore::new(primary, fallback));
        let store: Arc<dyn KvStore> = layered.clone();

        let roles = RoleRegistry::default();
        let catalog = Arc::new(ModelCatalog::new(adapters));
        let router = Arc::new(SmartRouter::new(
            config.routing_config(),
            PolicyConfig::default(),
            Some(Arc::clone(&store)),
        ));
        let usage = Arc::new(UsageTracker::new(Arc::clone(&store)));
        let manager = Arc::new(ModelManager::new(
            Arc::clone(&catalog),
            router,
            usage,
            roles.clone(),
            config.manager_config(),
        ));
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&manager)));
        let lifecycle = Arc::new(LifecycleTracker::new(Arc::clone(&store)));

        Ok(Self {
            config,
            store,
            layered,
            catalog,
            manager,
            coordinator,
            trackers: Arc::new(TrackerRegistry::new()),
            lifecycle,
            roles,
        })
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Validate a request, spawn its worker, and return the new analysis id.
    pub async fn start_analysis(&self, request: AnalysisConfig) -> Result<String, TaskError> {
        if !self.config.enabled {
            return Err(TaskError::validation("multi-model analysis is disabled"));
        }
        validate_symbol(&request.stock_symbol)?;
        if request.selected_agents.is_empty() {
            return Err(TaskError::validation("no analyst agents selected"));
        }
        if request.collaboration_mode == CollaborationMode::Debate
            && request.selected_agents.len() < 2
        {
            return Err(TaskError::validation("debate requires >= 2 participants"));
        }
        let depth = request.research_depth.clamp(1, 5);
        if depth != request.research_depth {
            log::warn!(
                "research depth {} out of range, clamped to {}",
                request.research_depth,
                depth
            );
        }

        self.catalog.refresh_health().await;

        let analysis_id = format!(
            "analysis_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let steps = generate_steps(&request.selected_agents, depth, &self.roles);
        let estimated = estimate_total_duration(
            request.selected_agents.len(),
            depth,
            request.provider_pref.as_deref(),
        );
        let tracker = Arc::new(ProgressTracker::new(
            &analysis_id,
            steps,
            estimated,
            Arc::clone(&self.store),
            self.config.ttls.progress,
            Arc::downgrade(&self.trackers),
        ));
        self.trackers.insert(Arc::clone(&tracker));
        tracker
            .update("Validating stock symbol and data sources", Some(0))
            .await;

        let run = AnalysisRun {
            analysis_id: analysis_id.clone(),
            stock_symbol: request.stock_symbol.clone(),
            market: request.market,
            analysis_date: request.analysis_date.clone(),
            selected_agents: request.selected_agents.clone(),
            collaboration_mode: request.collaboration_mode,
            research_depth: depth,
            provider_pref: request.provider_pref.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            updated_at: Utc::now(),
            config: serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
            results_summary: None,
        };
        self.save_run(&run).await;
        self.save_session(
            &analysis_id,
            &SessionState {
                analysis_id: analysis_id.clone(),
                status: RunStatus::Running,
                symbol: request.stock_symbol.clone(),
                market: request.market,
                form_config: serde_json::to_value(&request).unwrap_or(serde_json::Value::Null),
                timestamp: Utc::now(),
            },
        )
        .await;

        let control = Arc::new(RunControl::new());
        let worker = AnalysisWorker {
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            tracker: Arc::clone(&tracker),
            control: Arc::clone(&control),
            ttl: self.config.ttls.analysis,
            run,
            request: AnalysisConfig {
                research_depth: depth,
                ..request
            },
        };
        let join = tokio::spawn(worker.run());
        self.lifecycle
            .register(&analysis_id, WorkerHandle::new(control, join));

        log::info!("analysis {} started", analysis_id);
        Ok(analysis_id)
    }

    /// Latest persisted snapshot for a run.
    pub async fn get_progress(&self, analysis_id: &str) -> Result<ProgressSnapshot, TaskError> {
        match load_snapshot(self.store.as_ref(), analysis_id).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(TaskError::validation(format!(
                "unknown analysis id '{}'",
                analysis_id
            ))),
            Err(e) => Err(TaskError::internal(e.to_string())),
        }
    }

    /// Final record for a run; for terminal runs the answer is stable.
    pub async fn get_result(&self, analysis_id: &str) -> Result<AnalysisRun, TaskError> {
        let bytes = self
            .store
            .get(&analysis_key(analysis_id))
            .await
            .map_err(|e| TaskError::internal(e.to_string()))?
            .ok_or_else(|| {
                TaskError::validation(format!("unknown analysis id '{}'", analysis_id))
            })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TaskError::internal(format!("corrupt analysis record: {}", e)))
    }

    /// Reconciled run status (live worker beats stored snapshot).
    pub async fn status(&self, analysis_id: &str) -> LifecycleStatus {
        self.lifecycle.status(analysis_id).await
    }

    /// Cooperative cancel. Idempotent; a run with no live worker but a
    /// non-terminal snapshot is marked cancelled directly.
    pub async fn cancel(&self, analysis_id: &str) -> Result<(), TaskError> {
        if self.lifecycle.cancel(analysis_id) {
            return Ok(());
        }
        if let Ok(Some(mut snapshot)) = load_snapshot(self.store.as_ref(), analysis_id).await {
            if !snapshot.status.is_terminal() {
                snapshot.status = RunStatus::Cancelled;
                snapshot.last_message = "Analysis cancelled".to_string();
                snapshot.last_update_epoch = Utc::now().timestamp_millis() as f64 / 1000.0;
                if let Ok(bytes) = serde_json::to_vec(&snapshot) {
                    let _ = self
                        .store
                        .set(
                            &progress_key(analysis_id),
                            &bytes,
                            Some(self.config.ttls.progress),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Idempotent pause; in-flight tasks finish, no new tasks start.
    pub async fn pause(&self, analysis_id: &str) -> Result<(), TaskError> {
        self.lifecycle.pause(analysis_id);
        if let Some(tracker) = self.trackers.get(analysis_id) {
            tracker.set_paused(true).await;
        }
        Ok(())
    }

    /// Idempotent resume.
    pub async fn resume(&self, analysis_id: &str) -> Result<(), TaskError> {
        self.lifecycle.resume(analysis_id);
        if let Some(tracker) = self.trackers.get(analysis_id) {
            tracker.set_paused(false).await;
        }
        Ok(())
    }

    /// Most recently updated runs, newest first.
    pub async fn list_latest(&self, limit: usize) -> Vec<(String, RunStatus, f64)> {
        self.lifecycle.list_latest(limit).await
    }

    pub async fn latest_analysis_id(&self) -> Option<String> {
        self.lifecycle.latest_analysis_id().await
    }

    /// Persist a session record for UI recovery.
    pub async fn save_session(&self, token: &str, state: &SessionState) {
        match serde_json::to_vec(state) {
            Ok(bytes) => {
                if let Err(e) = self
                    .store
                    .set(&session_key(token), &bytes, Some(self.config.ttls.session))
                    .await
                {
                    log::warn!("could not persist session '{}': {}", token, e);
                }
            }
            Err(e) => log::warn!("could not serialise session state: {}", e),
        }
    }

    pub async fn load_session(&self, token: &str) -> Option<SessionState> {
        let bytes = self.store.get(&session_key(token)).await.ok()??;
        serde_json::from_slice(&bytes).ok()
    }

    /// Garbage-collect expired fallback files.
    pub fn sweep_expired(&self) -> usize {
        self.layered.sweep_expired()
    }

    async fn save_run(&self, run: &AnalysisRun) {
        save_run_record(self.store.as_ref(), run, self.config.ttls.analysis).await;
    }
}

/// The spawned per-analysis worker: prep stages, collaboration, terminal
/// bookkeeping.
struct AnalysisWorker {
    store: Arc<dyn KvStore>,
    coordinator: Arc<Coordinator>,
    tracker: Arc<ProgressTracker>,
    control: Arc<RunControl>,
    ttl: std::time::Duration,
    run: AnalysisRun,
    request: AnalysisConfig,
}

impl AnalysisWorker {
    async fn run(mut self) {
        let tracker = &self.tracker;
        tracker
            .update("Environment check: verifying API key configuration", None)
            .await;
        tracker
            .update("Cost estimate: projecting API usage for this depth", None)
            .await;
        tracker
            .update("Configuring analysis parameters and model selection", None)
            .await;
        tracker.update("Initialising analysis engine", None).await;

        let description = format!(
            "Analyse stock {} on the {} market as of {}. Research depth {} of 5. \
             Provide a structured assessment from each specialist perspective, ending \
             with actionable guidance.",
            self.request.stock_symbol,
            self.request.market,
            self.request.analysis_date,
            self.request.research_depth,
        );

        let ctx = TaskContext {
            session_id: Some(self.run.analysis_id.clone()),
            budget_cap: self.request.budget_cap,
            overrides: self.request.runtime_overrides.clone(),
            fallback_chain: normalize_fallback_chain(&self.request.fallback_chain),
            control: Some(Arc::clone(&self.control)),
            progress: Some(Arc::clone(&self.tracker)),
            max_debate_rounds: self.request.max_debate_rounds,
            ..TaskContext::default()
        };

        let outcome = self
            .coordinator
            .execute_collaborative_analysis(
                &description,
                &self.request.selected_agents,
                self.request.collaboration_mode,
                &ctx,
            )
            .await;

        self.run.updated_at = Utc::now();
        if self.control.is_cancelled() || outcome.error_kind == Some(ErrorKind::Cancelled) {
            self.run.status = RunStatus::Cancelled;
            save_run_record(self.store.as_ref(), &self.run, self.ttl).await;
            tracker.mark_cancelled("Analysis cancelled").await;
            return;
        }

        if outcome.success {
            self.run.status = RunStatus::Completed;
            self.run.results_summary = Some(outcome.final_text.clone());
            save_run_record(self.store.as_ref(), &self.run, self.ttl).await;
            tracker.update("Assembling the final report", None).await;
            let results = serde_json::json!({
                "final_text": outcome.final_text,
                "participating_models": outcome.participating_models,
                "mode": outcome.mode.as_str(),
                "total_cost": outcome.total_cost,
                "total_time_ms": outcome.total_time_ms,
            });
            tracker.mark_completed("Analysis completed", Some(results)).await;
        } else {
            let message = outcome
                .error_message
                .clone()
                .unwrap_or_else(|| "analysis failed".to_string());
            self.run.status = RunStatus::Failed;
            self.run.results_summary = partial_summary(&outcome);
            save_run_record(self.store.as_ref(), &self.run, self.ttl).await;
            tracker.mark_failed(&message).await;
        }
    }
}

/// Keep whatever per-agent output exists so a failed run still has
/// retrievable partial results.
fn partial_summary(
    outcome: &crate::tradecouncil::coordinator::CollaborationResult,
) -> Option<String> {
    let texts: Vec<&str> = outcome
        .individual_results
        .iter()
        .filter(|r| r.success && !r.text.is_empty())
        .map(|r| r.text.as_str())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n\n"))
    }
}

async fn save_run_record(store: &dyn KvStore, run: &AnalysisRun, ttl: std::time::Duration) {
    match serde_json::to_vec(run) {
        Ok(bytes) => {
            if let Err(e) = store.set(&analysis_key(&run.analysis_id), &bytes, Some(ttl)).await {
                log::warn!("could not persist analysis record {}: {}", run.analysis_id, e);
            }
        }
        Err(e) => log::warn!("could not serialise analysis record: {}", e),
    }
}

/// `provider:model` entries become bare model names; bare names pass
/// through.
fn normalize_fallback_chain(chain: &[String]) -> Vec<String> {
    chain
        .iter()
        .map(|entry| {
            entry
                .split_once(':')
                .map(|(_, model)| model.to_string())
                .unwrap_or_else(|| entry.clone())
        })
        .collect()
}

fn validate_symbol(symbol: &str) -> Result<(), TaskError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return Err(TaskError::validation("stock symbol is empty"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(TaskError::validation(format!(
            "stock symbol '{}' has an invalid format",
            symbol
        )));
    }
    Ok(())
}
