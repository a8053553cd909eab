//! Smart routing engine: one model per task, explained.
//!
//! For each `(agent role, task)` pair the router picks exactly one model from
//! the catalog plus a prioritised alternatives list, and produces a
//! human-readable reasoning string for the decision. Strategies are tried in
//! a fixed order and the first to yield a result wins:
//!
//! 1. locked-model short-circuit (request context, runtime overrides, then
//!    the agent binding),
//! 2. diversity override when one model dominates recent selections,
//! 3. flagship-pool routing over the configured pool map,
//! 4. traditional weighted capability scoring,
//! 5. a fixed default fallback.
//!
//! Routing never fails: internal problems degrade to the fallback strategy,
//! and only a completely empty catalog yields `None` (which the manager
//! surfaces as `no_model_available`). Every decision is appended to the
//! `routing_decisions` log.

use crate::tradecouncil::adapter::{TaskComplexity, TaskSpec};
use crate::tradecouncil::catalog::{Capability, ModelSpec};
use crate::tradecouncil::roles::{PolicyConfig, RuntimeOverrides};
use crate::tradecouncil::store::{model_perf_key, KvStore, ROUTING_LOG};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Which branch of the routing pipeline produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Locked,
    FlagshipPool,
    Diversity,
    Traditional,
    Fallback,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Locked => "locked",
            RoutingStrategy::FlagshipPool => "flagship_pool",
            RoutingStrategy::Diversity => "diversity",
            RoutingStrategy::Traditional => "traditional",
            RoutingStrategy::Fallback => "fallback",
        }
    }
}

/// A routing decision: the chosen model plus the evidence for choosing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSelection {
    pub model: ModelSpec,
    /// Selection confidence in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable explanation of the decision.
    pub reasoning: String,
    pub estimated_cost: f64,
    pub estimated_time_ms: u64,
    /// Next-best model names, best first.
    pub alternatives: Vec<String>,
    pub strategy: RoutingStrategy,
    pub selection_id: String,
}

/// Scoring weights for traditional routing. Quality dominates by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingWeights {
    pub quality: f64,
    pub performance: f64,
    pub cost: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            quality: 0.6,
            performance: 0.3,
            cost: 0.1,
        }
    }
}

/// One policy pool: a flagship model plus the roles and task types that
/// prefer it. Pools are configuration, not code; add more without touching
/// the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub flagship_model: String,
    /// Pool members used as alternatives when the flagship is picked.
    pub members: Vec<String>,
    pub target_agents: Vec<String>,
    pub task_types: Vec<String>,
}

pub const DEEP_REASONING_POOL: &str = "deep_reasoning";
pub const TECHNICAL_LONGSEQ_POOL: &str = "technical_longseq";

/// Tunable routing behaviour.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub weights: RoutingWeights,
    pub diversity_enabled: bool,
    /// Dominant-share floor above which the diversity selector kicks in.
    pub diversity_threshold: f64,
    /// Weight of the usage score versus capability score in diversity mode.
    pub diversity_weight: f64,
    pub pools: Vec<PoolConfig>,
    /// task type -> pool name -> affinity in `[0, 1]`, each row summing to 1.
    pub task_pool_affinity: HashMap<String, HashMap<String, f64>>,
    /// Fixed-priority defaults for the final fallback branch.
    pub default_chain: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let pools = vec![
            PoolConfig {
                name: DEEP_REASONING_POOL.to_string(),
                flagship_model: "gemini-2.5-pro".to_string(),
                members: vec![
                    "Qwen/Qwen3-235B-A22B-Instruct-2507".to_string(),
                    "gemini-1.5-pro".to_string(),
                    "deepseek-reasoner".to_string(),
                ],
                target_agents: [
                    "fundamental_expert",
                    "chief_decision_officer",
                    "risk_manager",
                    "policy_researcher",
                    "compliance_officer",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                task_types: [
                    "financial_report",
                    "risk_assessment",
                    "decision_making",
                    "policy_analysis",
                    "compliance_check",
                    "fundamental_analysis",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            },
            PoolConfig {
                name: TECHNICAL_LONGSEQ_POOL.to_string(),
                flagship_model: "deepseek-ai/DeepSeek-V3".to_string(),
                members: vec![
                    "deepseek-ai/DeepSeek-R1".to_string(),
                    "moonshotai/Kimi-K2-Instruct".to_string(),
                    "Pro/Qwen/Qwen2.5-72B-Instruct".to_string(),
                    "deepseek-chat".to_string(),
                ],
                target_agents: [
                    "technical_analyst",
                    "news_hunter",
                    "sentiment_analyst",
                    "tool_engineer",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                task_types: [
                    "technical_analysis",
                    "news_analysis",
                    "sentiment_analysis",
                    "tool_development",
                    "code_generation",
                    "backtesting",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            },
        ];

        let affinity_rows: [(&str, f64, f64); 13] = [
            ("financial_report", 0.9, 0.1),
            ("technical_analysis", 0.1, 0.9),
            ("news_analysis", 0.1, 0.9),
            ("sentiment_analysis", 0.1, 0.9),
            ("risk_assessment", 0.8, 0.2),
            ("decision_making", 0.7, 0.3),
            ("policy_analysis", 0.9, 0.1),
            ("code_generation", 0.05, 0.95),
            ("tool_development", 0.1, 0.9),
            ("backtesting", 0.1, 0.9),
            ("compliance_check", 1.0, 0.0),
            ("fundamental_analysis", 0.9, 0.1),
            ("general", 0.6, 0.4),
        ];
        let task_pool_affinity = affinity_rows
            .iter()
            .map(|(task, deep, tech)| {
                (
                    task.to_string(),
                    [
                        (DEEP_REASONING_POOL.to_string(), *deep),
                        (TECHNICAL_LONGSEQ_POOL.to_string(), *tech),
                    ]
                    .into_iter()
                    .collect(),
                )
            })
            .collect();

        Self {
            weights: RoutingWeights::default(),
            diversity_enabled: true,
            diversity_threshold: 0.4,
            diversity_weight: 0.8,
            pools,
            task_pool_affinity,
            default_chain: vec![
                "Qwen/Qwen3-235B-A22B-Instruct-2507".to_string(),
                "gemini-2.5-flash".to_string(),
                "deepseek-ai/DeepSeek-V3".to_string(),
                "zai-org/GLM-4.5".to_string(),
            ],
        }
    }
}

/// Request-scoped inputs to one routing call.
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    pub session_id: Option<String>,
    /// Highest-precedence lock, set directly by the caller.
    pub locked_model: Option<String>,
    pub overrides: Option<RuntimeOverrides>,
    pub code_generation_required: bool,
    pub long_context: bool,
}

/// Persisted moving averages for one `(model, task type)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPerfRecord {
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub total_calls: u64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Serialize)]
struct RoutingDecisionRow<'a> {
    selection_id: &'a str,
    timestamp: DateTime<Utc>,
    session_id: Option<&'a str>,
    agent_role: &'a str,
    task_type: &'a str,
    model: &'a str,
    provider: &'a str,
    strategy: &'a str,
    confidence: f64,
    reasoning: &'a str,
}

/// Signals extracted from the task before scoring.
#[derive(Debug, Clone, Default)]
struct TaskProfile {
    reasoning: f64,
    speed: f64,
    chinese: f64,
    cost_sensitivity: f64,
    multimodal: f64,
    long_context: f64,
    code_generation: f64,
}

pub struct SmartRouter {
    config: RoutingConfig,
    policy: PolicyConfig,
    store: Option<Arc<dyn KvStore>>,
    /// Diversity counter; halved whenever the total reaches 50 so the window
    /// decays instead of accumulating forever.
    usage_counts: StdMutex<HashMap<String, u64>>,
    perf: Mutex<HashMap<(String, String), ModelPerfRecord>>,
}

impl SmartRouter {
    pub fn new(config: RoutingConfig, policy: PolicyConfig, store: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            config,
            policy,
            store,
            usage_counts: StdMutex::new(HashMap::new()),
            perf: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Pick one model for the task. Returns `None` only when the available
    /// set is empty.
    pub async fn route_task(
        &self,
        description: &str,
        agent_role: &str,
        task_spec: &TaskSpec,
        available: &HashMap<String, ModelSpec>,
        ctx: &RouteContext,
    ) -> Option<ModelSelection> {
        if available.is_empty() {
            log::warn!("routing requested with an empty model catalog");
            return None;
        }

        let candidates = self.filter_by_policy(agent_role, &task_spec.task_type, available, ctx);

        let selection = if let Some(sel) = self.locked_route(agent_role, task_spec, &candidates, ctx)
        {
            sel
        } else if self.config.diversity_enabled && self.should_diversify(available) {
            match self
                .diversity_route(description, task_spec, &candidates, ctx)
                .await
            {
                Some(sel) => sel,
                None => self.fallback_selection(available, task_spec),
            }
        } else if let Some(sel) = self.pool_route(agent_role, task_spec, &candidates, ctx).await {
            sel
        } else if let Some(sel) = self
            .traditional_route(description, task_spec, &candidates, ctx)
            .await
        {
            sel
        } else {
            self.fallback_selection(available, task_spec)
        };

        if self.config.diversity_enabled && selection.strategy != RoutingStrategy::Locked {
            self.bump_usage(&selection.model.name);
        }
        self.log_decision(&selection, agent_role, &task_spec.task_type, ctx)
            .await;
        log::info!(
            "routed {}/{} -> {} via {} (confidence {:.3})",
            agent_role,
            task_spec.task_type,
            selection.model.name,
            selection.strategy.as_str(),
            selection.confidence
        );
        Some(selection)
    }

    /// Intersect the available set with the agent and task allow-lists (each
    /// applied only when non-empty), then subtract both deny-lists. An empty
    /// result falls back to the full available set with a warning.
    fn filter_by_policy(
        &self,
        agent_role: &str,
        task_type: &str,
        available: &HashMap<String, ModelSpec>,
        ctx: &RouteContext,
    ) -> HashMap<String, ModelSpec> {
        let mut allowed: HashMap<String, ModelSpec> = available.clone();

        let override_allow: Option<&HashSet<String>> = ctx.overrides.as_ref().and_then(|o| {
            if o.enable_allowed_models_by_role {
                o.allowed_models_by_role.get(agent_role)
            } else {
                None
            }
        });
        let binding = self.policy.agent_bindings.get(agent_role);
        let task_binding = self.policy.task_bindings.get(task_type);

        let agent_allow = override_allow.or(binding.map(|b| &b.allow_models));
        if let Some(allow) = agent_allow {
            if !allow.is_empty() {
                allowed.retain(|name, _| allow.contains(name));
            }
        }
        if let Some(task) = task_binding {
            if !task.allow_models.is_empty() {
                allowed.retain(|name, _| task.allow_models.contains(name));
            }
        }
        if let Some(b) = binding {
            allowed.retain(|name, _| !b.deny_models.contains(name));
        }
        if let Some(task) = task_binding {
            allowed.retain(|name, _| !task.deny_models.contains(name));
        }

        if allowed.is_empty() {
            log::warn!(
                "policy filter for {}/{} removed every candidate, falling back to the full set",
                agent_role,
                task_type
            );
            return available.clone();
        }
        allowed
    }

    /// Locked-model short-circuit. Precedence: request context, then runtime
    /// overrides, then the static agent binding. The lock only applies when
    /// the model survived policy filtering.
    fn locked_route(
        &self,
        agent_role: &str,
        task_spec: &TaskSpec,
        candidates: &HashMap<String, ModelSpec>,
        ctx: &RouteContext,
    ) -> Option<ModelSelection> {
        let locked = ctx
            .locked_model
            .clone()
            .or_else(|| {
                ctx.overrides.as_ref().and_then(|o| {
                    if o.enable_model_lock {
                        o.model_overrides.get(agent_role).cloned()
                    } else {
                        None
                    }
                })
            })
            .or_else(|| {
                self.policy
                    .agent_bindings
                    .get(agent_role)
                    .and_then(|b| b.locked_model.clone())
            })?;
        let spec = candidates.get(&locked)?;
        Some(self.build_selection(
            spec.clone(),
            0.95,
            format!("model '{}' locked for role {}", locked, agent_role),
            task_spec,
            Vec::new(),
            RoutingStrategy::Locked,
        ))
    }

    // --- diversity ---------------------------------------------------------

    /// True when the dominant model's share of recent selections exceeds the
    /// dynamic threshold `max(configured, 1/|models| + 0.15)`.
    fn should_diversify(&self, available: &HashMap<String, ModelSpec>) -> bool {
        let counts = self.usage_counts.lock().unwrap();
        let total: u64 = counts.values().sum();
        if total < 2 {
            return false;
        }
        let Some((dominant, dominant_count)) = counts.iter().max_by_key(|(_, c)| **c) else {
            return false;
        };
        let share = *dominant_count as f64 / total as f64;
        let ideal = 1.0 / available.len().max(1) as f64;
        let threshold = self.config.diversity_threshold.max(ideal + 0.15);
        let trigger = share > threshold;
        if trigger {
            log::info!(
                "diversity override: {} holds {:.0}% of recent selections (threshold {:.0}%)",
                dominant,
                share * 100.0,
                threshold * 100.0
            );
        }
        trigger
    }

    async fn diversity_route(
        &self,
        description: &str,
        task_spec: &TaskSpec,
        candidates: &HashMap<String, ModelSpec>,
        ctx: &RouteContext,
    ) -> Option<ModelSelection> {
        let profile = analyze_task(description, task_spec, ctx);
        let perf = self.perf.lock().await.clone();
        let (counts, total) = {
            let counts = self.usage_counts.lock().unwrap();
            let total: u64 = counts.values().sum();
            (counts.clone(), total.max(1))
        };

        let mut scored: Vec<(String, f64, f64, u64)> = candidates
            .iter()
            .map(|(name, spec)| {
                let usage_count = counts.get(name).copied().unwrap_or(0);
                let usage_score = 1.0 - usage_count as f64 / total as f64;
                let capability = self.score_model(spec, &profile, task_spec, &perf);
                let combined = usage_score * self.config.diversity_weight
                    + capability * (1.0 - self.config.diversity_weight);
                (name.clone(), combined, usage_score, usage_count)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best_name, best_score, usage_score, usage_count) = scored.first()?.clone();
        let spec = candidates.get(&best_name)?.clone();
        let alternatives: Vec<String> = scored.iter().skip(1).take(3).map(|(n, ..)| n.clone()).collect();
        let reasoning = format!(
            "diversity selection of {}: used {} times recently (usage score {:.2}), balancing the dominant model",
            best_name, usage_count, usage_score
        );
        Some(self.build_selection(
            spec,
            best_score.min(0.9),
            reasoning,
            task_spec,
            alternatives,
            RoutingStrategy::Diversity,
        ))
    }

    fn bump_usage(&self, model_name: &str) {
        let mut counts = self.usage_counts.lock().unwrap();
        *counts.entry(model_name.to_string()).or_insert(0) += 1;
        let total: u64 = counts.values().sum();
        if total >= 50 {
            for value in counts.values_mut() {
                *value = (*value / 2).max(1);
            }
            log::debug!("diversity counters halved to keep a decaying window");
        }
    }

    /// Snapshot of the diversity counters, for observability.
    pub fn diversity_counts(&self) -> HashMap<String, u64> {
        self.usage_counts.lock().unwrap().clone()
    }

    /// Clear the diversity window, e.g. after a catalog change.
    pub fn reset_diversity_tracker(&self) {
        self.usage_counts.lock().unwrap().clear();
    }

    // --- flagship pools ----------------------------------------------------

    fn pick_pool(&self, agent_role: &str, task_spec: &TaskSpec, ctx: &RouteContext) -> Option<&PoolConfig> {
        if let Some(pool) = self
            .config
            .pools
            .iter()
            .find(|p| p.target_agents.iter().any(|a| a == agent_role))
        {
            return Some(pool);
        }
        if let Some(affinities) = self.config.task_pool_affinity.get(&task_spec.task_type) {
            let best = affinities
                .iter()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(name, _)| name.clone());
            if let Some(name) = best {
                if let Some(pool) = self.config.pools.iter().find(|p| p.name == name) {
                    return Some(pool);
                }
            }
        }
        let code_task = matches!(
            task_spec.task_type.as_str(),
            "code_generation" | "tool_development" | "backtesting"
        );
        if ctx.code_generation_required || code_task {
            return self.pool_by_name(TECHNICAL_LONGSEQ_POOL);
        }
        if ctx.long_context || task_spec.estimated_tokens > 20_000 {
            return self.pool_by_name(TECHNICAL_LONGSEQ_POOL);
        }
        if task_spec.requires_reasoning || task_spec.complexity == TaskComplexity::High {
            return self.pool_by_name(DEEP_REASONING_POOL);
        }
        self.pool_by_name(DEEP_REASONING_POOL)
    }

    fn pool_by_name(&self, name: &str) -> Option<&PoolConfig> {
        self.config.pools.iter().find(|p| p.name == name)
    }

    fn pool_confidence(&self, pool: &PoolConfig, agent_role: &str, task_spec: &TaskSpec) -> f64 {
        let mut confidence: f64 = 0.7;
        if pool.target_agents.iter().any(|a| a == agent_role) {
            confidence += 0.15;
        }
        if let Some(affinities) = self.config.task_pool_affinity.get(&task_spec.task_type) {
            confidence += affinities.get(&pool.name).copied().unwrap_or(0.0) * 0.15;
        }
        let code_task = matches!(
            task_spec.task_type.as_str(),
            "code_generation" | "tool_development" | "backtesting"
        );
        if pool.name == DEEP_REASONING_POOL && task_spec.complexity == TaskComplexity::High {
            confidence += 0.1;
        } else if pool.name == TECHNICAL_LONGSEQ_POOL && task_spec.estimated_tokens > 10_000 {
            confidence += 0.1;
        } else if pool.name == TECHNICAL_LONGSEQ_POOL && code_task {
            confidence += 0.15;
        }
        confidence.min(0.95)
    }

    fn pool_reasoning(&self, pool: &PoolConfig, agent_role: &str, task_spec: &TaskSpec) -> String {
        let base = match pool.name.as_str() {
            DEEP_REASONING_POOL => format!(
                "deep-reasoning pool flagship {}: strongest multimodal reasoning and financial analysis",
                pool.flagship_model
            ),
            TECHNICAL_LONGSEQ_POOL => format!(
                "technical/long-sequence pool flagship {}: long context, Chinese-optimised, code-capable",
                pool.flagship_model
            ),
            other => format!("{} pool flagship {}", other, pool.flagship_model),
        };
        let mut reasons = Vec::new();
        if pool.target_agents.iter().any(|a| a == agent_role) {
            reasons.push(format!("tuned for the {} role", agent_role));
        }
        if task_spec.complexity == TaskComplexity::High && pool.name == DEEP_REASONING_POOL {
            reasons.push("high-complexity task needs the strongest reasoning".to_string());
        }
        if task_spec.estimated_tokens > 20_000 && pool.name == TECHNICAL_LONGSEQ_POOL {
            reasons.push(format!("long context ({} tokens)", task_spec.estimated_tokens));
        }
        if matches!(
            task_spec.task_type.as_str(),
            "code_generation" | "tool_development" | "backtesting"
        ) && pool.name == TECHNICAL_LONGSEQ_POOL
        {
            reasons.push("code generation and tooling task".to_string());
        }
        if reasons.is_empty() {
            base
        } else {
            format!("{}; selected because: {}", base, reasons.join(", "))
        }
    }

    async fn pool_route(
        &self,
        agent_role: &str,
        task_spec: &TaskSpec,
        candidates: &HashMap<String, ModelSpec>,
        ctx: &RouteContext,
    ) -> Option<ModelSelection> {
        let pool = self.pick_pool(agent_role, task_spec, ctx)?;
        let spec = candidates.get(&pool.flagship_model)?.clone();
        let confidence = self.pool_confidence(pool, agent_role, task_spec);
        let reasoning = self.pool_reasoning(pool, agent_role, task_spec);
        let alternatives: Vec<String> = pool
            .members
            .iter()
            .filter(|m| candidates.contains_key(*m) && **m != pool.flagship_model)
            .take(3)
            .cloned()
            .collect();
        let estimated_time_ms = flagship_time_estimate(&spec.name, task_spec);
        let mut selection = self.build_selection(
            spec,
            confidence,
            reasoning,
            task_spec,
            alternatives,
            RoutingStrategy::FlagshipPool,
        );
        selection.estimated_time_ms = estimated_time_ms;
        Some(selection)
    }

    // --- traditional scoring -----------------------------------------------

    async fn traditional_route(
        &self,
        description: &str,
        task_spec: &TaskSpec,
        candidates: &HashMap<String, ModelSpec>,
        ctx: &RouteContext,
    ) -> Option<ModelSelection> {
        let profile = analyze_task(description, task_spec, ctx);
        let perf = self.perf.lock().await.clone();

        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|(name, spec)| (name.clone(), self.score_model(spec, &profile, task_spec, &perf)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best_name, best_score) = scored.first()?.clone();
        let spec = candidates.get(&best_name)?.clone();
        let alternatives: Vec<String> = scored.iter().skip(1).take(3).map(|(n, _)| n.clone()).collect();

        let mut reasons = Vec::new();
        if profile.reasoning > 0.7 && spec.capability(Capability::Reasoning) > 0.8 {
            reasons.push(format!("{} reasons strongly", best_name));
        }
        if profile.speed > 0.7 && spec.capability(Capability::Speed) > 0.8 {
            reasons.push("response speed prioritised".to_string());
        }
        if profile.chinese > 0.7 && spec.capability(Capability::Chinese) > 0.8 {
            reasons.push("optimised for Chinese content".to_string());
        }
        if profile.cost_sensitivity > 0.7 && spec.capability(Capability::CostEfficiency) > 0.8 {
            reasons.push("good cost efficiency".to_string());
        }
        let mut reasoning = format!("weighted scoring picked {} ({:.2})", best_name, best_score);
        if !reasons.is_empty() {
            reasoning.push_str(&format!("; {}", reasons.join(", ")));
        }
        if !alternatives.is_empty() {
            reasoning.push_str(&format!("; alternatives: {}", alternatives.join(", ")));
        }

        Some(self.build_selection(
            spec,
            best_score.min(0.95),
            reasoning,
            task_spec,
            alternatives,
            RoutingStrategy::Traditional,
        ))
    }

    fn score_model(
        &self,
        spec: &ModelSpec,
        profile: &TaskProfile,
        task_spec: &TaskSpec,
        perf: &HashMap<(String, String), ModelPerfRecord>,
    ) -> f64 {
        let cap_or = |cap: Capability, default: f64| {
            if spec.capabilities.contains_key(&cap) {
                spec.capability(cap)
            } else {
                default
            }
        };
        let w = self.config.weights;

        let reasoning = spec.capability(Capability::Reasoning) * profile.reasoning;
        let code = spec.capability(Capability::CodeGeneration) * profile.code_generation;
        let multimodal = spec.capability(Capability::Multimodal) * profile.multimodal;
        let long_context = spec.capability(Capability::LongContext) * profile.long_context;
        let financial = spec.capability(Capability::FinancialAnalysis)
            * if matches!(
                task_spec.task_type.as_str(),
                "financial_report" | "fundamental_analysis"
            ) {
                1.0
            } else {
                0.0
            };
        let speed = cap_or(Capability::Speed, 0.5) * profile.speed;
        let reliability = cap_or(Capability::Reliability, 0.8) * 0.8;
        let chinese = cap_or(Capability::Chinese, 0.5) * profile.chinese;
        let cost = cap_or(Capability::CostEfficiency, 0.5) * profile.cost_sensitivity;

        let mut score = (reasoning + code + multimodal + financial + long_context) * w.quality
            + (speed + reliability) * w.performance
            + chinese * w.performance * 0.5
            + cost * w.cost;

        if let Some(record) = perf.get(&(spec.name.clone(), task_spec.task_type.clone())) {
            let factor = record.success_rate * 0.6
                + (record.avg_response_time_ms / 10_000.0).min(1.0) * 0.4;
            score *= factor;
        }
        score.clamp(0.0, 1.0)
    }

    // --- fallback ----------------------------------------------------------

    fn fallback_selection(
        &self,
        available: &HashMap<String, ModelSpec>,
        task_spec: &TaskSpec,
    ) -> ModelSelection {
        let spec = self
            .config
            .default_chain
            .iter()
            .find_map(|name| available.get(name))
            .cloned()
            .or_else(|| {
                let mut names: Vec<&String> = available.keys().collect();
                names.sort();
                names.first().and_then(|n| available.get(*n)).cloned()
            })
            .expect("fallback_selection requires a non-empty available set");
        self.build_selection(
            spec.clone(),
            0.3,
            format!("no strategy matched, using default model {}", spec.name),
            task_spec,
            Vec::new(),
            RoutingStrategy::Fallback,
        )
    }

    fn build_selection(
        &self,
        spec: ModelSpec,
        confidence: f64,
        reasoning: String,
        task_spec: &TaskSpec,
        alternatives: Vec<String>,
        strategy: RoutingStrategy,
    ) -> ModelSelection {
        let estimated_cost = estimate_task_cost(&spec, task_spec);
        let estimated_time_ms = estimate_execution_time(&spec, task_spec);
        ModelSelection {
            model: spec,
            confidence,
            reasoning,
            estimated_cost,
            estimated_time_ms,
            alternatives,
            strategy,
            selection_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    async fn log_decision(
        &self,
        selection: &ModelSelection,
        agent_role: &str,
        task_type: &str,
        ctx: &RouteContext,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let row = RoutingDecisionRow {
            selection_id: &selection.selection_id,
            timestamp: Utc::now(),
            session_id: ctx.session_id.as_deref(),
            agent_role,
            task_type,
            model: &selection.model.name,
            provider: selection.model.provider.as_str(),
            strategy: selection.strategy.as_str(),
            confidence: selection.confidence,
            reasoning: &selection.reasoning,
        };
        if let Ok(line) = serde_json::to_vec(&row) {
            if let Err(e) = store.append(ROUTING_LOG, &line).await {
                log::warn!("could not log routing decision: {}", e);
            }
        }
    }

    // --- performance feedback ----------------------------------------------

    /// Fold one execution outcome into the `(model, task type)` moving
    /// averages and persist the record.
    pub async fn update_model_performance(
        &self,
        model_name: &str,
        task_type: &str,
        execution_time_ms: u64,
        success: bool,
    ) {
        let record = {
            let mut perf = self.perf.lock().await;
            let record = perf
                .entry((model_name.to_string(), task_type.to_string()))
                .or_insert(ModelPerfRecord {
                    avg_response_time_ms: 0.0,
                    success_rate: 0.0,
                    total_calls: 0,
                    last_updated: Utc::now(),
                });
            let n = record.total_calls as f64;
            record.avg_response_time_ms =
                (record.avg_response_time_ms * n + execution_time_ms as f64) / (n + 1.0);
            record.success_rate =
                (record.success_rate * n + if success { 1.0 } else { 0.0 }) / (n + 1.0);
            record.total_calls += 1;
            record.last_updated = Utc::now();
            record.clone()
        };
        if let Some(store) = &self.store {
            if let Ok(bytes) = serde_json::to_vec(&record) {
                let key = model_perf_key(model_name, task_type);
                if let Err(e) = store.set(&key, &bytes, None).await {
                    log::debug!("could not persist perf record for {}: {}", key, e);
                }
            }
        }
    }

    pub async fn performance(&self, model_name: &str, task_type: &str) -> Option<ModelPerfRecord> {
        self.perf
            .lock()
            .await
            .get(&(model_name.to_string(), task_type.to_string()))
            .cloned()
    }
}

/// Extract routing signals from the task description and spec.
fn analyze_task(description: &str, task_spec: &TaskSpec, ctx: &RouteContext) -> TaskProfile {
    let mut profile = TaskProfile {
        reasoning: 0.5,
        speed: 0.5,
        chinese: 0.5,
        cost_sensitivity: 0.5,
        multimodal: 0.0,
        long_context: 0.0,
        code_generation: 0.0,
    };

    match task_spec.task_type.as_str() {
        "financial_report" => {
            profile.reasoning = profile.reasoning.max(0.9);
            profile.multimodal = profile.multimodal.max(0.8);
        }
        "technical_analysis" => {
            profile.reasoning = profile.reasoning.max(0.8);
            profile.long_context = profile.long_context.max(0.7);
            profile.chinese = profile.chinese.max(0.8);
        }
        "news_analysis" => {
            profile.speed = profile.speed.max(0.8);
            profile.long_context = profile.long_context.max(0.6);
            profile.chinese = profile.chinese.max(0.9);
        }
        "sentiment_analysis" => {
            profile.chinese = profile.chinese.max(0.9);
            profile.speed = profile.speed.max(0.7);
        }
        "risk_assessment" => {
            profile.reasoning = profile.reasoning.max(0.9);
        }
        "decision_making" => {
            profile.reasoning = profile.reasoning.max(0.95);
            profile.multimodal = profile.multimodal.max(0.7);
        }
        "code_generation" => {
            profile.code_generation = profile.code_generation.max(0.95);
            profile.reasoning = profile.reasoning.max(0.7);
        }
        "tool_development" => {
            profile.code_generation = profile.code_generation.max(0.9);
            profile.reasoning = profile.reasoning.max(0.8);
        }
        "policy_analysis" => {
            profile.reasoning = profile.reasoning.max(0.8);
            profile.chinese = profile.chinese.max(0.95);
        }
        _ => {}
    }

    match task_spec.complexity {
        TaskComplexity::High => {
            profile.reasoning = (profile.reasoning * 1.2).min(1.0);
            profile.cost_sensitivity *= 0.8;
        }
        TaskComplexity::Low => {
            profile.speed = (profile.speed * 1.2).min(1.0);
            profile.cost_sensitivity = (profile.cost_sensitivity * 1.2).min(1.0);
        }
        TaskComplexity::Medium => {}
    }

    let lower = description.to_lowercase();
    let chinese_chars = description
        .chars()
        .filter(|c| (*c >= '\u{4e00}' && *c <= '\u{9fff}'))
        .count();
    let total_chars = description.chars().count().max(1);
    if chinese_chars as f64 > total_chars as f64 * 0.3 {
        profile.chinese = (profile.chinese * 1.3).min(1.0);
    }

    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));
    if contains_any(&["analysis", "reasoning", "evaluate", "分析", "推理", "判断", "评估", "决策"]) {
        profile.reasoning = (profile.reasoning * 1.2).min(1.0);
    }
    if contains_any(&["quick", "fast", "urgent", "快速", "急", "立即"]) {
        profile.speed = (profile.speed * 1.3).min(1.0);
    }
    if contains_any(&["code", "script", "python", "function", "代码", "编程", "脚本"]) {
        profile.code_generation = (profile.code_generation.max(0.5) * 1.5).min(1.0);
    }
    if contains_any(&["image", "chart", "table", "pdf", "图片", "图表", "表格"]) {
        profile.multimodal = (profile.multimodal.max(0.5) * 1.5).min(1.0);
    }

    if task_spec.estimated_tokens > 20_000 {
        profile.long_context = 0.8;
    } else if task_spec.estimated_tokens > 10_000 {
        profile.long_context = profile.long_context.max(0.6);
    }

    if ctx.code_generation_required {
        profile.code_generation = profile.code_generation.max(0.9);
    }
    if ctx.long_context {
        profile.long_context = profile.long_context.max(0.8);
    }

    profile
}

/// Projected task cost against one model; small prompts are billed as if
/// they were a thousand tokens to keep the estimate conservative.
pub fn estimate_task_cost(spec: &ModelSpec, task_spec: &TaskSpec) -> f64 {
    let tokens = task_spec.estimated_tokens.max(1000) as f64;
    tokens / 1000.0 * spec.cost_per_1k_tokens
}

/// Projected wall-clock for one model, from its speed score and the task
/// size.
pub fn estimate_execution_time(spec: &ModelSpec, task_spec: &TaskSpec) -> u64 {
    let speed = if spec.capabilities.contains_key(&Capability::Speed) {
        spec.capability(Capability::Speed)
    } else {
        0.5
    };
    let mut time = 3000.0 * (1.5 - speed);
    match task_spec.complexity {
        TaskComplexity::High => time *= 2.0,
        TaskComplexity::Low => time *= 0.6,
        TaskComplexity::Medium => {}
    }
    if task_spec.estimated_tokens > 4000 {
        time *= (task_spec.estimated_tokens as f64 / 4000.0).min(3.0);
    }
    (time as u64).max(1000)
}

fn flagship_time_estimate(model_name: &str, task_spec: &TaskSpec) -> u64 {
    let mut time: f64 = match model_name {
        "gemini-2.5-pro" => 8000.0,
        "deepseek-ai/DeepSeek-V3" => 5000.0,
        _ => 5000.0,
    };
    match task_spec.complexity {
        TaskComplexity::High => time *= 1.5,
        TaskComplexity::Low => time *= 0.8,
        TaskComplexity::Medium => {}
    }
    if task_spec.estimated_tokens > 20_000 {
        time *= 1.3;
    }
    time as u64
}
