//! Model catalog and capability registry.
//!
//! The catalog is the single read-only view of every model the process can
//! talk to, aggregated across all configured provider adapters. Routing logic
//! keys every decision off this registry and never learns how a provider is
//! wired. Catalog contents are fixed at construction; only the per-adapter
//! health state changes afterwards, via [`ModelCatalog::refresh_health`].

use crate::tradecouncil::adapter::ProviderAdapter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

/// The LLM providers the reference adapters cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    DeepSeek,
    Google,
    SiliconFlow,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::DeepSeek => "deepseek",
            Provider::Google => "google",
            Provider::SiliconFlow => "siliconflow",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad classification of a model's disposition.
///
/// `Reasoning` and `Thinking` kinds get longer default timeouts because they
/// spend time on hidden chain-of-thought before the first token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Reasoning,
    Speed,
    General,
    Premium,
    Coder,
    Thinking,
    Agent,
    Multimodal,
    Chinese,
    Balanced,
}

/// The capability axes the routing engine scores against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Reasoning,
    Multimodal,
    LongContext,
    Chinese,
    FinancialAnalysis,
    TechnicalAnalysis,
    TimeSeries,
    CodeGeneration,
    Reliability,
    CostEfficiency,
    Speed,
}

/// Everything the engine knows about a single model.
///
/// Loaded once at startup from the owning adapter and constant for the
/// process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Stable identifier, unique across the whole catalog.
    pub name: String,
    pub provider: Provider,
    pub kind: ModelKind,
    /// Blended price per thousand tokens, in account currency units.
    pub cost_per_1k_tokens: f64,
    pub max_output_tokens: u32,
    pub context_window: u32,
    pub supports_streaming: bool,
    /// Capability scores in `[0, 1]`; absent capabilities score 0.
    pub capabilities: HashMap<Capability, f64>,
}

impl ModelSpec {
    /// Score for one capability, 0.0 when the model does not declare it.
    pub fn capability(&self, cap: Capability) -> f64 {
        self.capabilities.get(&cap).copied().unwrap_or(0.0)
    }
}

/// Convenience builder for the adapter model tables.
pub fn model_spec(
    name: &str,
    provider: Provider,
    kind: ModelKind,
    cost_per_1k_tokens: f64,
    max_output_tokens: u32,
    context_window: u32,
    capabilities: &[(Capability, f64)],
) -> ModelSpec {
    ModelSpec {
        name: name.to_string(),
        provider,
        kind,
        cost_per_1k_tokens,
        max_output_tokens,
        context_window,
        supports_streaming: true,
        capabilities: capabilities.iter().copied().collect(),
    }
}

/// Read-only registry mapping model names to their specs and owning adapters.
///
/// Duplicate model names across providers are resolved deterministically:
/// the first adapter to register a name wins, later registrations are logged
/// and dropped.
pub struct ModelCatalog {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    /// model name -> (adapter index, spec); immutable after construction.
    models: HashMap<String, (usize, ModelSpec)>,
    /// adapter index -> passed its last health check. Adapters start healthy
    /// until a probe says otherwise.
    health: Mutex<HashMap<usize, bool>>,
}

impl ModelCatalog {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let mut models: HashMap<String, (usize, ModelSpec)> = HashMap::new();
        let mut health = HashMap::new();
        for (idx, adapter) in adapters.iter().enumerate() {
            health.insert(idx, true);
            for (name, spec) in adapter.supported_models() {
                if let Some((owner, _)) = models.get(&name) {
                    log::warn!(
                        "model '{}' already registered by {}, dropping registration from {}",
                        name,
                        adapters[*owner].provider(),
                        adapter.provider()
                    );
                    continue;
                }
                models.insert(name, (idx, spec));
            }
        }
        log::info!(
            "model catalog initialised with {} models from {} adapters",
            models.len(),
            adapters.len()
        );
        Self {
            adapters,
            models,
            health: Mutex::new(health),
        }
    }

    /// Re-probe every adapter and record the outcome. An adapter that fails
    /// its probe has all of its models excluded from [`available_models`]
    /// until it passes again.
    ///
    /// [`available_models`]: ModelCatalog::available_models
    pub async fn refresh_health(&self) {
        let mut results = HashMap::new();
        for (idx, adapter) in self.adapters.iter().enumerate() {
            let ok = adapter.health_check().await;
            if !ok {
                log::warn!("health check failed for provider {}", adapter.provider());
            }
            results.insert(idx, ok);
        }
        *self.health.lock().unwrap() = results;
    }

    /// Models whose owning adapter passed its last health check.
    pub fn available_models(&self) -> HashMap<String, ModelSpec> {
        let health = self.health.lock().unwrap();
        self.models
            .iter()
            .filter(|(_, (idx, _))| health.get(idx).copied().unwrap_or(false))
            .map(|(name, (_, spec))| (name.clone(), spec.clone()))
            .collect()
    }

    /// Capability score for a model, 0.0 when the model or capability is
    /// unknown.
    pub fn capability_score(&self, model_name: &str, cap: Capability) -> f64 {
        self.models
            .get(model_name)
            .map(|(_, spec)| spec.capability(cap))
            .unwrap_or(0.0)
    }

    /// The adapter owning a model, regardless of health.
    pub fn adapter_for(&self, model_name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.models
            .get(model_name)
            .map(|(idx, _)| Arc::clone(&self.adapters[*idx]))
    }

    pub fn spec(&self, model_name: &str) -> Option<ModelSpec> {
        self.models.get(model_name).map(|(_, spec)| spec.clone())
    }

    pub fn adapters(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }
}
