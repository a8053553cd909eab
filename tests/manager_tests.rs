use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tradecouncil::adapter::{
    ProviderAdapter, TaskComplexity, TaskOptions, TaskResult, TaskSpec, TokenUsage,
};
use tradecouncil::catalog::{model_spec, Capability, ModelCatalog, ModelKind, ModelSpec, Provider};
use tradecouncil::error::ErrorKind;
use tradecouncil::manager::{
    estimate_prompt_tokens, ManagerConfig, ModelManager, TaskContext,
};
use tradecouncil::roles::{PolicyConfig, RoleRegistry};
use tradecouncil::routing::{RoutingConfig, SmartRouter};
use tradecouncil::store::MemoryStore;
use tradecouncil::usage::{UsageRecord, UsageTracker};

/// Scripted in-memory provider: records every call, fails the models it is
/// told to fail, succeeds everywhere else.
struct ScriptedAdapter {
    provider: Provider,
    models: HashMap<String, ModelSpec>,
    failures: HashMap<String, ErrorKind>,
    calls: Arc<Mutex<Vec<String>>>,
    healthy: AtomicBool,
    delay_ms: u64,
}

impl ScriptedAdapter {
    fn new(provider: Provider, specs: Vec<ModelSpec>) -> Self {
        Self {
            provider,
            models: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
            failures: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            healthy: AtomicBool::new(true),
            delay_ms: 0,
        }
    }

    fn failing(mut self, model: &str, kind: ErrorKind) -> Self {
        self.failures.insert(model.to_string(), kind);
        self
    }

    fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn supported_models(&self) -> HashMap<String, ModelSpec> {
        self.models.clone()
    }

    async fn execute_task(
        &self,
        model_name: &str,
        prompt: &str,
        _task_spec: &TaskSpec,
        _options: &TaskOptions,
    ) -> TaskResult {
        self.calls.lock().unwrap().push(model_name.to_string());
        if let Some(kind) = self.failures.get(model_name) {
            return TaskResult::failed(*kind, format!("{} refused the call", model_name));
        }
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        let spec = match self.models.get(model_name) {
            Some(spec) => spec.clone(),
            None => {
                return TaskResult::failed(
                    ErrorKind::ModelUnavailable,
                    format!("unknown model {}", model_name),
                )
            }
        };
        let usage = TokenUsage::new(100, 50);
        let cost = usage.total_tokens as f64 / 1000.0 * spec.cost_per_1k_tokens;
        let mut result = TaskResult::completed(
            format!("{} answered: {}", model_name, &prompt.chars().take(40).collect::<String>()),
            spec,
            self.delay_ms.max(5),
            cost,
            usage,
        );
        result.execution_time_ms = self.delay_ms.max(5);
        result
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

fn gateway_specs() -> Vec<ModelSpec> {
    vec![
        model_spec(
            "deepseek-ai/DeepSeek-V3",
            Provider::SiliconFlow,
            ModelKind::Balanced,
            0.002,
            8192,
            131_072,
            &[
                (Capability::Reasoning, 0.9),
                (Capability::TechnicalAnalysis, 0.92),
                (Capability::Speed, 0.7),
                (Capability::Reliability, 0.9),
            ],
        ),
        model_spec(
            "gemini-2.5-pro",
            Provider::SiliconFlow,
            ModelKind::Premium,
            0.00625,
            65536,
            1_048_576,
            &[
                (Capability::Reasoning, 0.95),
                (Capability::FinancialAnalysis, 0.92),
                (Capability::Reliability, 0.95),
            ],
        ),
    ]
}

struct Harness {
    manager: Arc<ModelManager>,
    usage: Arc<UsageTracker>,
    catalog: Arc<ModelCatalog>,
}

fn build(adapters: Vec<Arc<dyn ProviderAdapter>>, config: ManagerConfig) -> Harness {
    build_with_routing(adapters, config, RoutingConfig::default())
}

fn build_with_routing(
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    config: ManagerConfig,
    mut routing: RoutingConfig,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    // Keep routing deterministic in these tests; diversity has its own
    // coverage.
    routing.diversity_enabled = false;
    let store = Arc::new(MemoryStore::new());
    let catalog = Arc::new(ModelCatalog::new(adapters));
    let router = Arc::new(SmartRouter::new(
        routing,
        PolicyConfig::default(),
        Some(store.clone() as Arc<dyn tradecouncil::store::KvStore>),
    ));
    let usage = Arc::new(UsageTracker::new(
        store.clone() as Arc<dyn tradecouncil::store::KvStore>
    ));
    let manager = Arc::new(ModelManager::new(
        catalog.clone(),
        router,
        usage.clone(),
        RoleRegistry::default(),
        config,
    ));
    Harness {
        manager,
        usage,
        catalog,
    }
}

fn session_ctx(session: &str) -> TaskContext {
    TaskContext {
        session_id: Some(session.to_string()),
        ..TaskContext::default()
    }
}

#[tokio::test]
async fn successful_task_records_usage_and_metrics() {
    let adapter = Arc::new(ScriptedAdapter::new(Provider::SiliconFlow, gateway_specs()));
    let harness = build(vec![adapter], ManagerConfig::default());

    let result = harness
        .manager
        .execute_task(
            "technical_analyst",
            "Review the AAPL chart",
            "technical_analysis",
            TaskComplexity::Medium,
            &session_ctx("s1"),
        )
        .await;

    assert!(result.success);
    assert_eq!(
        result.model_used.as_ref().map(|m| m.name.as_str()),
        Some("deepseek-ai/DeepSeek-V3")
    );
    assert!(result.actual_cost > 0.0);

    let records = harness.usage.session_records("s1").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].model_name, "deepseek-ai/DeepSeek-V3");

    let metrics = harness.manager.session_metrics("s1").await.unwrap();
    assert_eq!(metrics.total_tasks, 1);
    assert_eq!(metrics.successful_tasks, 1);
    // Session cost accounting agrees with the usage log.
    let logged = harness.usage.session_cost("s1").await;
    assert!((metrics.total_cost - logged).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn primary_failure_falls_back_and_records_one_usage_row() {
    let google = Arc::new(
        ScriptedAdapter::new(
            Provider::Google,
            vec![model_spec(
                "gemini-2.5-pro",
                Provider::Google,
                ModelKind::Premium,
                0.00625,
                65536,
                1_048_576,
                &[
                    (Capability::Reasoning, 0.95),
                    (Capability::FinancialAnalysis, 0.92),
                    (Capability::Reliability, 0.95),
                ],
            )],
        )
        .failing("gemini-2.5-pro", ErrorKind::Timeout),
    );
    let gateway = Arc::new(ScriptedAdapter::new(
        Provider::SiliconFlow,
        vec![gateway_specs().remove(0)],
    ));
    let google_calls = google.calls();
    let gateway_calls = gateway.calls();
    let harness = build(vec![google, gateway], ManagerConfig::default());

    let ctx = TaskContext {
        fallback_chain: vec!["deepseek-ai/DeepSeek-V3".to_string()],
        ..session_ctx("s5")
    };
    let result = harness
        .manager
        .execute_task(
            "fundamental_expert",
            "Assess the fundamentals",
            "fundamental_analysis",
            TaskComplexity::Medium,
            &ctx,
        )
        .await;

    assert!(result.success);
    assert_eq!(
        result.model_used.as_ref().map(|m| m.name.as_str()),
        Some("deepseek-ai/DeepSeek-V3")
    );
    assert_eq!(
        *google_calls.lock().unwrap(),
        vec!["gemini-2.5-pro".to_string()]
    );
    assert_eq!(
        *gateway_calls.lock().unwrap(),
        vec!["deepseek-ai/DeepSeek-V3".to_string()]
    );

    // Exactly one usage row: the failed attempt records nothing.
    assert_eq!(harness.usage.session_records("s5").await.len(), 1);

    // Performance stats reflect both attempts.
    let failed = harness
        .manager
        .router()
        .performance("gemini-2.5-pro", "fundamental_analysis")
        .await
        .unwrap();
    assert!(failed.success_rate < 1e-9);
    let ok = harness
        .manager
        .router()
        .performance("deepseek-ai/DeepSeek-V3", "fundamental_analysis")
        .await
        .unwrap();
    assert!((ok.success_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn budget_exceeded_makes_no_adapter_call() {
    let adapter = Arc::new(ScriptedAdapter::new(Provider::SiliconFlow, gateway_specs()));
    let calls = adapter.calls();
    let harness = build(vec![adapter], ManagerConfig::default());

    harness
        .usage
        .record(&UsageRecord::new(
            "siliconflow",
            "deepseek-ai/DeepSeek-V3",
            1000,
            1000,
            1.0,
            "s4",
            "multi_model_technical_analysis",
        ))
        .await;

    let ctx = TaskContext {
        budget_cap: Some(0.5),
        ..session_ctx("s4")
    };
    let result = harness
        .manager
        .execute_task(
            "technical_analyst",
            "Another task",
            "technical_analysis",
            TaskComplexity::Medium,
            &ctx,
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::BudgetExceeded));
    assert!(result.error_message.as_deref().unwrap().contains("budget"));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn model_override_accepts_aliases() {
    let adapter = Arc::new(ScriptedAdapter::new(Provider::SiliconFlow, gateway_specs()));
    let harness = build(vec![adapter], ManagerConfig::default());

    for alias in ["gemini-api/gemini-2.5-pro", "deepseek-v3"] {
        let ctx = TaskContext {
            model_override: Some(alias.to_string()),
            ..session_ctx("s-alias")
        };
        let result = harness
            .manager
            .execute_task(
                "news_hunter",
                "Scan headlines",
                "news_analysis",
                TaskComplexity::Low,
                &ctx,
            )
            .await;
        assert!(result.success, "alias {} should resolve", alias);
    }
}

#[tokio::test]
async fn unknown_override_is_model_unavailable() {
    let adapter = Arc::new(ScriptedAdapter::new(Provider::SiliconFlow, gateway_specs()));
    let harness = build(vec![adapter], ManagerConfig::default());

    let ctx = TaskContext {
        model_override: Some("gpt-oss-unknown".to_string()),
        ..session_ctx("s-bad")
    };
    let result = harness
        .manager
        .execute_task(
            "news_hunter",
            "Scan headlines",
            "news_analysis",
            TaskComplexity::Low,
            &ctx,
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ModelUnavailable));
}

#[tokio::test]
async fn unhealthy_adapter_means_no_model_available() {
    let adapter = Arc::new(ScriptedAdapter::new(Provider::SiliconFlow, gateway_specs()));
    adapter.healthy.store(false, Ordering::SeqCst);
    let harness = build(vec![adapter], ManagerConfig::default());
    harness.catalog.refresh_health().await;

    let result = harness
        .manager
        .execute_task(
            "technical_analyst",
            "Review the chart",
            "technical_analysis",
            TaskComplexity::Medium,
            &session_ctx("s-down"),
        )
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::NoModelAvailable));
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_trip_the_circuit_breaker() {
    // A model outside the simplified-fallback candidate list keeps the call
    // accounting to one adapter call per execution.
    let spec = model_spec(
        "Pro/Qwen/Qwen2.5-72B-Instruct",
        Provider::SiliconFlow,
        ModelKind::General,
        0.0041,
        8192,
        131_072,
        &[(Capability::Reasoning, 0.87), (Capability::Reliability, 0.9)],
    );
    let adapter = Arc::new(
        ScriptedAdapter::new(Provider::SiliconFlow, vec![spec])
            .failing("Pro/Qwen/Qwen2.5-72B-Instruct", ErrorKind::HttpError),
    );
    let calls = adapter.calls();
    let harness = build(vec![adapter], ManagerConfig::default());

    for _ in 0..5 {
        let result = harness
            .manager
            .execute_task(
                "technical_analyst",
                "Review the chart",
                "technical_analysis",
                TaskComplexity::Medium,
                &session_ctx("s-breaker"),
            )
            .await;
        assert!(!result.success);
    }
    assert_eq!(calls.lock().unwrap().len(), 5);

    // The breaker is open now; the sixth call never reaches the adapter.
    let result = harness
        .manager
        .execute_task(
            "technical_analyst",
            "Review the chart",
            "technical_analysis",
            TaskComplexity::Medium,
            &session_ctx("s-breaker"),
        )
        .await;
    assert!(!result.success);
    assert_eq!(calls.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn saturated_pool_fails_fast_with_system_overload() {
    let adapter = Arc::new(
        ScriptedAdapter::new(Provider::SiliconFlow, gateway_specs()).with_delay(300),
    );
    let config = ManagerConfig {
        max_concurrent_tasks: 1,
        queue_depth: 0,
        ..ManagerConfig::default()
    };
    let harness = build(vec![adapter], config);

    let manager = Arc::clone(&harness.manager);
    let first = tokio::spawn(async move {
        manager
            .execute_task(
                "technical_analyst",
                "slow task",
                "technical_analysis",
                TaskComplexity::Medium,
                &TaskContext {
                    session_id: Some("s-load".to_string()),
                    ..TaskContext::default()
                },
            )
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second = harness
        .manager
        .execute_task(
            "technical_analyst",
            "rejected task",
            "technical_analysis",
            TaskComplexity::Medium,
            &session_ctx("s-load"),
        )
        .await;
    assert!(!second.success);
    assert_eq!(second.error_kind, Some(ErrorKind::SystemOverload));

    let first = first.await.unwrap();
    assert!(first.success);
}

#[test]
fn token_estimate_weighs_chinese_and_english() {
    // Four english words at 1.3 each, floored.
    assert_eq!(estimate_prompt_tokens("analyse the apple chart"), 5);
    // Six chinese characters at 1.2 each, floored.
    assert_eq!(estimate_prompt_tokens("分析苹果股票"), 7);
    assert_eq!(estimate_prompt_tokens(""), 1);
}
