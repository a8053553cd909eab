//! Environment-driven configuration.
//!
//! Every knob is read once at startup. Values that fail to parse fall back
//! to their defaults with a warning instead of aborting; a misconfigured
//! environment should degrade, not crash.

use crate::tradecouncil::manager::ManagerConfig;
use crate::tradecouncil::routing::{RoutingConfig, RoutingWeights};
use crate::tradecouncil::store::StoreTtls;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Master switch; disabled orchestrators reject new analyses.
    pub enabled: bool,
    /// Default per-session budget cap, overridable per request.
    pub max_cost_per_session: Option<f64>,
    pub max_concurrent_tasks: usize,
    pub queue_depth: usize,
    pub enable_caching: bool,
    /// Root of the file fallback store.
    pub data_dir: PathBuf,
    pub ttls: StoreTtls,
    pub diversity_enabled: bool,
    pub diversity_threshold: f64,
    pub diversity_weight: f64,
    pub routing_weights: RoutingWeights,
    pub deepseek_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub siliconflow_api_key: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cost_per_session: None,
            max_concurrent_tasks: 5,
            queue_depth: 32,
            enable_caching: false,
            data_dir: PathBuf::from("./data"),
            ttls: StoreTtls::default(),
            diversity_enabled: true,
            diversity_threshold: 0.4,
            diversity_weight: 0.8,
            routing_weights: RoutingWeights::default(),
            deepseek_api_key: None,
            google_api_key: None,
            siliconflow_api_key: None,
        }
    }
}

impl OrchestratorConfig {
    /// Read the recognised environment keys over the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(enabled) = env_bool("MULTI_MODEL_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(cap) = env_f64("MAX_COST_PER_SESSION") {
            config.max_cost_per_session = Some(cap);
        }
        if let Some(tasks) = env_usize("MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = tasks.max(1);
        }
        if let Some(caching) = env_bool("ENABLE_CACHING") {
            config.enable_caching = caching;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Some(sec) = env_u64("PROGRESS_TTL_SEC") {
            config.ttls.progress = Duration::from_secs(sec);
        }
        if let Some(sec) = env_u64("SESSION_TTL_SEC") {
            config.ttls.session = Duration::from_secs(sec);
        }
        if let Some(sec) = env_u64("ANALYSIS_TTL_SEC") {
            config.ttls.analysis = Duration::from_secs(sec);
        }
        if let Some(enabled) = env_bool("DIVERSITY_ENABLED") {
            config.diversity_enabled = enabled;
        }
        if let Some(threshold) = env_f64("DIVERSITY_THRESHOLD") {
            config.diversity_threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(weight) = env_f64("DIVERSITY_WEIGHT") {
            config.diversity_weight = weight.clamp(0.0, 1.0);
        }
        if let Some(weights) = env_weights("ROUTING_WEIGHTS") {
            config.routing_weights = weights;
        }
        config.deepseek_api_key = env_secret("DEEPSEEK_API_KEY");
        config.google_api_key = env_secret("GOOGLE_API_KEY").or_else(|| env_secret("GEMINI_API_KEY"));
        config.siliconflow_api_key = env_secret("SILICONFLOW_API_KEY");
        config
    }

    pub fn routing_config(&self) -> RoutingConfig {
        let mut routing = RoutingConfig::default();
        routing.weights = self.routing_weights;
        routing.diversity_enabled = self.diversity_enabled;
        routing.diversity_threshold = self.diversity_threshold;
        routing.diversity_weight = self.diversity_weight;
        routing
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_cost_per_session: self.max_cost_per_session,
            max_concurrent_tasks: self.max_concurrent_tasks,
            queue_depth: self.queue_depth,
        }
    }
}

fn env_secret(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("ignoring unparseable {}='{}'", key, other);
            None
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparseable {}='{}'", key, raw);
            None
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparseable {}='{}'", key, raw);
            None
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    env_u64(key).map(|v| v as usize)
}

/// `ROUTING_WEIGHTS` is a `quality,performance,cost` triple.
fn env_weights(key: &str) -> Option<RoutingWeights> {
    let raw = std::env::var(key).ok()?;
    let parts: Vec<f64> = raw
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect();
    if parts.len() == 3 {
        Some(RoutingWeights {
            quality: parts[0],
            performance: parts[1],
            cost: parts[2],
        })
    } else {
        log::warn!("ignoring unparseable {}='{}'", key, raw);
        None
    }
}
