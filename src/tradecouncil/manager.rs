//! Multi-model task execution with fallback, backoff, and budget gating.
//!
//! The manager runs a single `(agent role, prompt, task type)` unit end to
//! end: it consults the budget tracker, asks the router for a model (or
//! honours a caller override), executes through the owning adapter, and walks
//! a bounded fallback chain with exponential backoff when attempts fail. A
//! circuit breaker drops repeatedly failing models from consideration, and a
//! last-resort simplified mode trades depth for availability.
//!
//! Every terminal result feeds the session metrics and, on success, one
//! usage record; per-attempt outcomes feed the router's performance
//! averages.

use crate::tradecouncil::adapter::{
    approx_usage, TaskComplexity, TaskOptions, TaskResult, TaskSpec,
};
use crate::tradecouncil::catalog::{ModelCatalog, ModelSpec};
use crate::tradecouncil::error::ErrorKind;
use crate::tradecouncil::lifecycle::RunControl;
use crate::tradecouncil::progress::ProgressTracker;
use crate::tradecouncil::roles::{RoleRegistry, RuntimeOverrides};
use crate::tradecouncil::routing::{
    estimate_task_cost, ModelSelection, RouteContext, RoutingStrategy, SmartRouter,
};
use crate::tradecouncil::usage::{BudgetStatus, UsageRecord, UsageTracker};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

/// Manager tuning knobs.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Default per-session budget cap; a request-scoped cap wins when set.
    pub max_cost_per_session: Option<f64>,
    /// Upper bound on concurrent adapter calls.
    pub max_concurrent_tasks: usize,
    /// How many submissions may wait for a pool slot before new ones are
    /// rejected with `system_overload`.
    pub queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_cost_per_session: None,
            max_concurrent_tasks: 5,
            queue_depth: 32,
        }
    }
}

/// Request-scoped execution context threaded from the orchestration API down
/// to individual tasks.
#[derive(Clone, Default)]
pub struct TaskContext {
    pub session_id: Option<String>,
    /// Pin the model for this task, bypassing routing. Aliases like
    /// `gemini-api/gemini-2.5-pro` or `deepseek-v3` are normalised.
    pub model_override: Option<String>,
    pub budget_cap: Option<f64>,
    pub overrides: Option<RuntimeOverrides>,
    /// Explicit fallback chain, `model` names tried in order after the
    /// primary.
    pub fallback_chain: Vec<String>,
    pub options: TaskOptions,
    pub control: Option<Arc<RunControl>>,
    pub progress: Option<Arc<ProgressTracker>>,
    /// Degraded mode: one attempt per task, no intra-task fallback.
    pub single_attempt: bool,
    /// Debate rounds for collaborative runs; the coordinator default applies
    /// when unset.
    pub max_debate_rounds: Option<u32>,
    pub code_generation_required: bool,
    pub long_context: bool,
    pub requires_speed: bool,
}

/// Per-session accounting updated on every terminal task result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub total_cost: f64,
    pub total_time_ms: u64,
    pub models_used: HashMap<String, u64>,
    pub avg_confidence: f64,
}

/// Consecutive failures within this window trip the breaker for a model.
const BREAKER_WINDOW: Duration = Duration::from_secs(60);
const BREAKER_THRESHOLD: usize = 5;
/// Primary plus at most this many fallback attempts.
const MAX_FALLBACK_ATTEMPTS: usize = 3;

pub struct ModelManager {
    catalog: Arc<ModelCatalog>,
    router: Arc<SmartRouter>,
    usage: Arc<UsageTracker>,
    roles: RoleRegistry,
    config: ManagerConfig,
    sessions: Mutex<HashMap<String, SessionMetrics>>,
    breaker: StdMutex<HashMap<String, VecDeque<Instant>>>,
    pool: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl ModelManager {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        router: Arc<SmartRouter>,
        usage: Arc<UsageTracker>,
        roles: RoleRegistry,
        config: ManagerConfig,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            catalog,
            router,
            usage,
            roles,
            config,
            sessions: Mutex::new(HashMap::new()),
            breaker: StdMutex::new(HashMap::new()),
            pool,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn router(&self) -> &SmartRouter {
        &self.router
    }

    pub async fn session_metrics(&self, session_id: &str) -> Option<SessionMetrics> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Execute one task end to end. Failures are encoded in the returned
    /// [`TaskResult`], never raised.
    pub async fn execute_task(
        &self,
        agent_role: &str,
        prompt: &str,
        task_type: &str,
        complexity: TaskComplexity,
        ctx: &TaskContext,
    ) -> TaskResult {
        let session_id = ctx
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session_{}", uuid::Uuid::new_v4().simple()));

        if ctx.control.as_ref().is_some_and(|c| c.is_cancelled()) {
            return self
                .finish(&session_id, TaskResult::failed(ErrorKind::Cancelled, "task cancelled"), 0.0)
                .await;
        }

        // Budget gate: rejected tasks never reach an adapter.
        let cap = ctx.budget_cap.or(self.config.max_cost_per_session);
        if self.usage.check_budget(&session_id, cap).await == BudgetStatus::Exceeded {
            let message = format!(
                "session {} reached its budget cap of {:.4}",
                session_id,
                cap.unwrap_or_default()
            );
            return self
                .finish(&session_id, TaskResult::failed(ErrorKind::BudgetExceeded, message), 0.0)
                .await;
        }

        let Some(_permit) = self.acquire_slot().await else {
            return self
                .finish(
                    &session_id,
                    TaskResult::failed(
                        ErrorKind::SystemOverload,
                        "worker pool and wait queue are saturated",
                    ),
                    0.0,
                )
                .await;
        };

        let available = self.catalog.available_models();
        if available.is_empty() {
            return self
                .finish(
                    &session_id,
                    TaskResult::failed(ErrorKind::NoModelAvailable, "no model passed health checks"),
                    0.0,
                )
                .await;
        }

        let task_spec = self.build_task_spec(task_type, complexity, prompt, ctx);

        let selection = if let Some(override_name) = &ctx.model_override {
            let resolved = resolve_model_alias(override_name, &available)
                .and_then(|name| available.get(&name).cloned());
            match resolved {
                Some(spec) => {
                    let estimated_cost = estimate_task_cost(&spec, &task_spec);
                    let reasoning = format!("caller pinned model '{}'", spec.name);
                    ModelSelection {
                        model: spec,
                        confidence: 1.0,
                        reasoning,
                        estimated_cost,
                        estimated_time_ms: 3000,
                        alternatives: Vec::new(),
                        strategy: RoutingStrategy::Locked,
                        selection_id: uuid::Uuid::new_v4().to_string(),
                    }
                }
                None => {
                    return self
                        .finish(
                            &session_id,
                            TaskResult::failed(
                                ErrorKind::ModelUnavailable,
                                format!("requested model '{}' is not available", override_name),
                            ),
                            0.0,
                        )
                        .await;
                }
            }
        } else {
            let route_ctx = RouteContext {
                session_id: Some(session_id.clone()),
                locked_model: None,
                overrides: ctx.overrides.clone(),
                code_generation_required: ctx.code_generation_required,
                long_context: ctx.long_context,
            };
            match self
                .router
                .route_task(prompt, agent_role, &task_spec, &available, &route_ctx)
                .await
            {
                Some(selection) => selection,
                None => {
                    return self
                        .finish(
                            &session_id,
                            TaskResult::failed(ErrorKind::NoModelAvailable, "catalog is empty"),
                            0.0,
                        )
                        .await;
                }
            }
        };

        let attempts = self.assemble_attempts(agent_role, &selection, ctx, &available);
        let mut last_failure: Option<TaskResult> = None;

        for (i, model_name) in attempts.iter().enumerate() {
            if i > 0 {
                let backoff = Duration::from_secs(1u64 << (i - 1));
                log::info!("waiting {:?} before fallback model {}", backoff, model_name);
                match &ctx.control {
                    Some(control) => {
                        if control.sleep_cancellable(backoff).await {
                            return self
                                .finish(
                                    &session_id,
                                    TaskResult::failed(ErrorKind::Cancelled, "task cancelled"),
                                    selection.confidence,
                                )
                                .await;
                        }
                    }
                    None => tokio::time::sleep(backoff).await,
                }
            }
            if self.breaker_tripped(model_name) {
                log::warn!("circuit breaker open for {}, skipping", model_name);
                continue;
            }
            let Some(adapter) = self.catalog.adapter_for(model_name) else {
                last_failure = Some(TaskResult::failed(
                    ErrorKind::ModelUnavailable,
                    format!("no adapter serves '{}'", model_name),
                ));
                continue;
            };
            let mut options = ctx.options.clone();
            if ctx.single_attempt && options.timeout.is_none() {
                options.timeout = Some(Duration::from_secs(30));
            }

            let result = adapter
                .execute_task(model_name, prompt, &task_spec, &options)
                .await;
            self.router
                .update_model_performance(model_name, task_type, result.execution_time_ms, result.success)
                .await;

            if result.success {
                if i > 0 {
                    log::info!("fallback model {} succeeded", model_name);
                }
                let result = self.finalize_success(result, prompt, &session_id, task_type).await;
                return self.finish(&session_id, result, selection.confidence).await;
            }

            log::warn!(
                "model {} failed: {}",
                model_name,
                result.error_message.as_deref().unwrap_or("unknown")
            );
            self.breaker_record(model_name);
            let abort = result.error_kind.is_some_and(|k| !k.is_retryable());
            last_failure = Some(result);
            if abort || ctx.single_attempt {
                break;
            }
        }

        if !ctx.single_attempt {
            let abort = last_failure
                .as_ref()
                .and_then(|r| r.error_kind)
                .is_some_and(|k| !k.is_retryable());
            if !abort {
                if let Some(result) = self
                    .simplified_fallback(agent_role, prompt, &session_id, task_type, ctx)
                    .await
                {
                    return self.finish(&session_id, result, selection.confidence).await;
                }
            }
        }

        let mut result = last_failure.unwrap_or_else(|| {
            TaskResult::failed(ErrorKind::InternalError, "no execution attempt produced a result")
        });
        if let (Some(kind), Some(message)) = (result.error_kind, result.error_message.clone()) {
            result.error_message = Some(
                crate::tradecouncil::error::TaskError::new(kind, message).user_friendly(),
            );
        }
        self.finish(&session_id, result, selection.confidence).await
    }

    /// Bounded admission: a free pool slot is taken immediately, otherwise
    /// the call waits in the FIFO queue unless the queue itself is full.
    async fn acquire_slot(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() {
            return Some(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.config.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        let permit = Arc::clone(&self.pool).acquire_owned().await.ok();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        permit
    }

    fn build_task_spec(
        &self,
        task_type: &str,
        complexity: TaskComplexity,
        prompt: &str,
        ctx: &TaskContext,
    ) -> TaskSpec {
        let mut spec = TaskSpec::new(task_type, complexity, estimate_prompt_tokens(prompt));
        spec.requires_reasoning = requires_reasoning(task_type, prompt);
        spec.requires_chinese = chinese_ratio(prompt) > 0.3;
        spec.requires_speed = ctx.requires_speed;
        spec
    }

    /// Primary plus deduplicated fallbacks. Precedence: the request's
    /// explicit chain, then the agent binding's chain, then the router's
    /// alternatives, then the fixed defaults.
    fn assemble_attempts(
        &self,
        agent_role: &str,
        selection: &ModelSelection,
        ctx: &TaskContext,
        available: &HashMap<String, ModelSpec>,
    ) -> Vec<String> {
        let mut attempts = vec![selection.model.name.clone()];
        let binding_chain = self
            .router
            .policy()
            .agent_bindings
            .get(agent_role)
            .map(|b| b.fallback_chain.clone())
            .unwrap_or_default();

        let raw: Vec<String> = if !ctx.fallback_chain.is_empty() {
            ctx.fallback_chain.clone()
        } else if !binding_chain.is_empty() {
            binding_chain
        } else if !selection.alternatives.is_empty() {
            selection.alternatives.clone()
        } else {
            self.router.config().default_chain.clone()
        };

        for name in raw {
            let name = strip_provider_prefix(&name);
            if attempts.len() > MAX_FALLBACK_ATTEMPTS {
                break;
            }
            if available.contains_key(&name) && !attempts.contains(&name) {
                attempts.push(name);
            }
        }
        attempts
    }

    /// Fill in estimated usage and cost when the adapter omitted them, then
    /// append the usage record.
    async fn finalize_success(
        &self,
        mut result: TaskResult,
        prompt: &str,
        session_id: &str,
        task_type: &str,
    ) -> TaskResult {
        if result.token_usage.is_empty() {
            result.token_usage = approx_usage(prompt, &result.text);
        }
        if result.actual_cost == 0.0 {
            if let Some(spec) = &result.model_used {
                result.actual_cost =
                    result.token_usage.total_tokens as f64 / 1000.0 * spec.cost_per_1k_tokens;
            }
        }
        if let Some(spec) = &result.model_used {
            self.usage
                .record(&UsageRecord::new(
                    spec.provider.as_str(),
                    &spec.name,
                    result.token_usage.prompt_tokens,
                    result.token_usage.completion_tokens,
                    result.actual_cost,
                    session_id,
                    &format!("multi_model_{}", task_type),
                ))
                .await;
        }
        result
    }

    /// Last resort: a short candidate list, a simplified role prompt, and up
    /// to three low-cost attempts with the usual backoff.
    async fn simplified_fallback(
        &self,
        agent_role: &str,
        prompt: &str,
        session_id: &str,
        task_type: &str,
        ctx: &TaskContext,
    ) -> Option<TaskResult> {
        log::info!("entering simplified fallback for {}", agent_role);
        let candidates = [
            "gemini-2.5-pro",
            "gemini-2.5-flash",
            "deepseek-ai/DeepSeek-V3",
            "zai-org/GLM-4.5",
        ];
        let available = self.catalog.available_models();
        let simplified = self.roles.simplified_prompt(agent_role, prompt);
        let mut spec = TaskSpec::new(
            "general",
            TaskComplexity::Low,
            (simplified.chars().count() as u32 / 2).clamp(1, 1000),
        );
        spec.requires_speed = true;

        let options = TaskOptions {
            temperature: Some(0.7),
            max_tokens: Some(1000),
            ..TaskOptions::default()
        };

        for attempt in 0..3u32 {
            if attempt > 0 {
                let backoff = Duration::from_secs(1u64 << (attempt - 1));
                match &ctx.control {
                    Some(control) => {
                        if control.sleep_cancellable(backoff).await {
                            return None;
                        }
                    }
                    None => tokio::time::sleep(backoff).await,
                }
            }
            for candidate in candidates {
                if !available.contains_key(candidate) || self.breaker_tripped(candidate) {
                    continue;
                }
                let Some(adapter) = self.catalog.adapter_for(candidate) else {
                    continue;
                };
                let mut result = adapter
                    .execute_task(candidate, &simplified, &spec, &options)
                    .await;
                if result.success {
                    result.text = format!(
                        "[simplified mode] {}\n\nNote: this analysis ran in simplified mode because of system load; the result may be less detailed.",
                        result.text
                    );
                    log::info!("simplified fallback succeeded on {} (attempt {})", candidate, attempt + 1);
                    return Some(self.finalize_success(result, prompt, session_id, task_type).await);
                }
                self.breaker_record(candidate);
            }
        }
        log::error!("every simplified fallback attempt failed");
        None
    }

    /// Fold a terminal result into the session metrics and return it.
    async fn finish(&self, session_id: &str, result: TaskResult, confidence: f64) -> TaskResult {
        let mut sessions = self.sessions.lock().await;
        let metrics = sessions.entry(session_id.to_string()).or_default();
        metrics.total_tasks += 1;
        metrics.total_time_ms += result.execution_time_ms;
        if result.success {
            metrics.successful_tasks += 1;
            metrics.total_cost += result.actual_cost;
            if let Some(spec) = &result.model_used {
                *metrics.models_used.entry(spec.name.clone()).or_insert(0) += 1;
            }
        }
        let n = metrics.total_tasks as f64;
        metrics.avg_confidence = (metrics.avg_confidence * (n - 1.0) + confidence) / n;
        result
    }

    fn breaker_record(&self, model_name: &str) {
        let mut breaker = self.breaker.lock().unwrap();
        let window = breaker.entry(model_name.to_string()).or_default();
        let now = Instant::now();
        window.push_back(now);
        while window
            .front()
            .is_some_and(|at| now.duration_since(*at) > BREAKER_WINDOW)
        {
            window.pop_front();
        }
    }

    fn breaker_tripped(&self, model_name: &str) -> bool {
        let mut breaker = self.breaker.lock().unwrap();
        let Some(window) = breaker.get_mut(model_name) else {
            return false;
        };
        let now = Instant::now();
        while window
            .front()
            .is_some_and(|at| now.duration_since(*at) > BREAKER_WINDOW)
        {
            window.pop_front();
        }
        window.len() >= BREAKER_THRESHOLD
    }
}

/// Normalise caller-supplied model names: strip gateway prefixes like
/// `gemini-api/` and expand the short aliases users actually type.
pub fn resolve_model_alias(name: &str, available: &HashMap<String, ModelSpec>) -> Option<String> {
    if available.contains_key(name) {
        return Some(name.to_string());
    }
    let stripped = strip_provider_prefix(name);
    if available.contains_key(&stripped) {
        return Some(stripped);
    }
    let alias = match name.to_lowercase().as_str() {
        "deepseek-v3" => "deepseek-ai/DeepSeek-V3",
        "glm-4.5" => "zai-org/GLM-4.5",
        "qwen3-235b" => "Qwen/Qwen3-235B-A22B-Instruct-2507",
        _ => return None,
    };
    available.contains_key(alias).then(|| alias.to_string())
}

fn strip_provider_prefix(name: &str) -> String {
    name.strip_prefix("gemini-api/").unwrap_or(name).to_string()
}

/// Token estimate for a prompt: Chinese characters weigh 1.2, latin words
/// 1.3, floored at one token.
pub fn estimate_prompt_tokens(text: &str) -> u32 {
    let chinese = text
        .chars()
        .filter(|c| (*c >= '\u{4e00}' && *c <= '\u{9fff}'))
        .count() as f64;
    let words = text
        .split_whitespace()
        .filter(|w| w.chars().any(|c| c.is_ascii_alphanumeric()))
        .count() as f64;
    ((1.2 * chinese + 1.3 * words) as u32).max(1)
}

fn chinese_ratio(text: &str) -> f64 {
    let total = text.chars().count().max(1);
    let chinese = text
        .chars()
        .filter(|c| (*c >= '\u{4e00}' && *c <= '\u{9fff}'))
        .count();
    chinese as f64 / total as f64
}

fn requires_reasoning(task_type: &str, prompt: &str) -> bool {
    if matches!(
        task_type,
        "financial_report" | "risk_assessment" | "decision_making" | "fundamental_analysis" | "policy_analysis"
    ) {
        return true;
    }
    let lower = prompt.to_lowercase();
    ["evaluate", "reasoning", "decide", "判断", "推理", "决策"]
        .iter()
        .any(|k| lower.contains(k))
}
