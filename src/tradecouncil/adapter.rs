//! Shared primitives for provider-agnostic task execution.
//!
//! Applications and the orchestration engine interact with concrete LLM
//! providers exclusively through the [`ProviderAdapter`] trait and the
//! lightweight data types in this module. The trait abstracts over vendor
//! wire formats while the supporting structs describe one unit of model work,
//! its execution options, and its outcome.
//!
//! # Executing a task against an adapter
//!
//! ```rust,no_run
//! use tradecouncil::adapter::{TaskOptions, TaskSpec};
//! use tradecouncil::adapters::deepseek::DeepSeekAdapter;
//! use tradecouncil::ProviderAdapter;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let adapter = DeepSeekAdapter::new(&std::env::var("DEEPSEEK_API_KEY").unwrap());
//! let spec = TaskSpec::quick("technical_analysis");
//! let result = adapter
//!     .execute_task("deepseek-chat", "Summarise AAPL's trend.", &spec, &TaskOptions::default())
//!     .await;
//! println!("success={} text={}", result.success, result.text);
//! # }
//! ```

use crate::tradecouncil::catalog::{ModelKind, ModelSpec, Provider};
use crate::tradecouncil::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Tokens spent on prompt vs. completion for one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

/// Coarse difficulty of one unit of model work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Low,
    Medium,
    High,
}

impl TaskComplexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskComplexity::Low => "low",
            TaskComplexity::Medium => "medium",
            TaskComplexity::High => "high",
        }
    }
}

impl FromStr for TaskComplexity {
    type Err = ();

    /// Unknown tags fall back to `Medium` rather than failing; complexity is
    /// advisory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "low" => TaskComplexity::Low,
            "high" => TaskComplexity::High,
            _ => TaskComplexity::Medium,
        })
    }
}

impl fmt::Display for TaskComplexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one unit of model work, consumed by routing and adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Free-form tag such as `technical_analysis` or `decision_making`.
    pub task_type: String,
    pub complexity: TaskComplexity,
    /// Always at least 1.
    pub estimated_tokens: u32,
    pub requires_reasoning: bool,
    pub requires_chinese: bool,
    pub requires_speed: bool,
    /// Opaque caller-supplied context forwarded through routing.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, complexity: TaskComplexity, estimated_tokens: u32) -> Self {
        Self {
            task_type: task_type.into(),
            complexity,
            estimated_tokens: estimated_tokens.max(1),
            requires_reasoning: false,
            requires_chinese: false,
            requires_speed: false,
            context: HashMap::new(),
        }
    }

    /// A small medium-complexity spec, handy in tests and probes.
    pub fn quick(task_type: impl Into<String>) -> Self {
        Self::new(task_type, TaskComplexity::Medium, 1000)
    }
}

/// Callback sink receiving streamed text fragments in arrival order.
///
/// Delivery is best-effort: a panicking sink is isolated and never aborts the
/// underlying call.
pub type TokenSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-call execution options.
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Request a streamed response when the model supports it.
    pub stream: bool,
    /// Fragment sink; only consulted when `stream` is set.
    pub on_token: Option<TokenSink>,
    /// Overrides the adapter's per-model default timeout.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .field("stream", &self.stream)
            .field("on_token", &self.on_token.as_ref().map(|_| "<sink>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Outcome of one execution attempt.
///
/// Invariant: when `success` is true, `model_used` is always present and the
/// result was produced by the adapter owning that model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Model output; may be empty on failure.
    pub text: String,
    pub model_used: Option<ModelSpec>,
    pub execution_time_ms: u64,
    pub actual_cost: f64,
    pub token_usage: TokenUsage,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub task_id: String,
}

impl TaskResult {
    pub fn completed(
        text: String,
        model: ModelSpec,
        execution_time_ms: u64,
        actual_cost: f64,
        token_usage: TokenUsage,
    ) -> Self {
        Self {
            text,
            model_used: Some(model),
            execution_time_ms,
            actual_cost,
            token_usage,
            success: true,
            error_kind: None,
            error_message: None,
            task_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            model_used: None,
            execution_time_ms: 0,
            actual_cost: 0.0,
            token_usage: TokenUsage::default(),
            success: false,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            task_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn failed_after(
        kind: ErrorKind,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        let mut result = Self::failed(kind, message);
        result.execution_time_ms = execution_time_ms;
        result
    }
}

/// Estimate usage when the provider reports none: roughly two characters per
/// token, floored, never less than one token per non-empty text.
pub fn approx_usage(prompt: &str, completion: &str) -> TokenUsage {
    TokenUsage::new(approx_tokens(prompt), approx_tokens(completion))
}

fn approx_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() / 2) as u64).max(1)
}

/// Trait-driven abstraction over one concrete LLM provider.
///
/// An adapter translates the engine's uniform task contract into the
/// provider's wire format and maps provider failures onto the shared error
/// taxonomy. Implementations must be thread-safe so the worker pool can share
/// them between concurrent tasks.
///
/// Adapters that fail a health check must not be selected again until a later
/// probe passes; the catalog enforces this.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// The full model table this adapter serves.
    fn supported_models(&self) -> HashMap<String, ModelSpec>;

    /// Execute one task. Never returns `Err`: failures are encoded in the
    /// [`TaskResult`] so the fallback chain can inspect the error kind.
    ///
    /// Streaming contract: when `options.stream` is set and `on_token` is
    /// provided, fragments are delivered in provider order and the returned
    /// text is their concatenation. Token usage is estimated when the
    /// provider omits it.
    async fn execute_task(
        &self,
        model_name: &str,
        prompt: &str,
        task_spec: &TaskSpec,
        options: &TaskOptions,
    ) -> TaskResult;

    /// Projected cost for a task of the given size against one of this
    /// adapter's models. Unknown models cost nothing.
    fn estimate_cost(&self, model_name: &str, estimated_tokens: u32) -> f64 {
        self.supported_models()
            .get(model_name)
            .map(|spec| estimated_tokens as f64 / 1000.0 * spec.cost_per_1k_tokens)
            .unwrap_or(0.0)
    }

    /// Short, cheap liveness probe.
    async fn health_check(&self) -> bool;

    /// Per-model timeout. Reasoning and thinking models need room for hidden
    /// deliberation before the first token.
    fn default_timeout(&self, spec: &ModelSpec) -> Duration {
        match spec.kind {
            ModelKind::Reasoning | ModelKind::Thinking => Duration::from_secs(120),
            _ => Duration::from_secs(60),
        }
    }
}
