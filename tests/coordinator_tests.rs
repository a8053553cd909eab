use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tradecouncil::adapter::{
    ProviderAdapter, TaskOptions, TaskResult, TaskSpec, TokenUsage,
};
use tradecouncil::catalog::{model_spec, Capability, ModelCatalog, ModelKind, ModelSpec, Provider};
use tradecouncil::coordinator::{CollaborationMode, Coordinator};
use tradecouncil::error::ErrorKind;
use tradecouncil::manager::{ManagerConfig, ModelManager, TaskContext};
use tradecouncil::roles::{PolicyConfig, RoleRegistry};
use tradecouncil::routing::{RoutingConfig, SmartRouter};
use tradecouncil::store::MemoryStore;
use tradecouncil::usage::UsageTracker;

/// Mock provider covering both pool flagships so routing stays on its normal
/// path. Latency and failures are configurable per model.
struct TeamAdapter {
    models: HashMap<String, ModelSpec>,
    delays: HashMap<String, u64>,
    failures: HashMap<String, ErrorKind>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl TeamAdapter {
    fn new() -> Self {
        let specs = vec![
            model_spec(
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
            ),
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
                    (Capability::Reliability, 0.9),
                ],
            ),
        ];
        Self {
            models: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
            delays: HashMap::new(),
            failures: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_delay(mut self, model: &str, delay_ms: u64) -> Self {
        self.delays.insert(model.to_string(), delay_ms);
        self
    }

    fn failing(mut self, model: &str, kind: ErrorKind) -> Self {
        self.failures.insert(model.to_string(), kind);
        self
    }
}

#[async_trait]
impl ProviderAdapter for TeamAdapter {
    fn provider(&self) -> Provider {
        Provider::SiliconFlow
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
            return TaskResult::failed(*kind, format!("{} is refusing calls", model_name));
        }
        let delay = self.delays.get(model_name).copied().unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let spec = self.models[model_name].clone();
        let usage = TokenUsage::new(120, 60);
        let cost = usage.total_tokens as f64 / 1000.0 * spec.cost_per_1k_tokens;
        let mut result = TaskResult::completed(
            format!("{} take on: {}", model_name, prompt.chars().take(30).collect::<String>()),
            spec,
            delay.max(5),
            cost,
            usage,
        );
        result.execution_time_ms = delay.max(5);
        result
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn build_coordinator(adapter: TeamAdapter) -> (Coordinator, Arc<Mutex<Vec<String>>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let calls = Arc::clone(&adapter.calls);
    let store = Arc::new(MemoryStore::new());
    let mut routing = RoutingConfig::default();
    routing.diversity_enabled = false;
    let catalog = Arc::new(ModelCatalog::new(vec![Arc::new(adapter)]));
    let router = Arc::new(SmartRouter::new(
        routing,
        PolicyConfig::default(),
        Some(store.clone() as Arc<dyn tradecouncil::store::KvStore>),
    ));
    let usage = Arc::new(UsageTracker::new(
        store as Arc<dyn tradecouncil::store::KvStore>
    ));
    let manager = Arc::new(ModelManager::new(
        catalog,
        router,
        usage,
        RoleRegistry::default(),
        ManagerConfig::default(),
    ));
    (Coordinator::new(manager), calls)
}

fn ctx(session: &str) -> TaskContext {
    TaskContext {
        session_id: Some(session.to_string()),
        ..TaskContext::default()
    }
}

#[tokio::test]
async fn sequential_single_agent_skips_synthesis() {
    let (coordinator, calls) = build_coordinator(TeamAdapter::new());
    let result = coordinator
        .execute_collaborative_analysis(
            "Analyse AAPL",
            &["technical_analyst".to_string()],
            CollaborationMode::Sequential,
            &ctx("c1"),
        )
        .await;

    assert!(result.success);
    assert_eq!(result.individual_results.len(), 1);
    assert_eq!(
        result.participating_models,
        vec!["deepseek-ai/DeepSeek-V3".to_string()]
    );
    assert!(!result.final_text.is_empty());
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sequential_stages_see_previous_findings() {
    let (coordinator, _) = build_coordinator(TeamAdapter::new());
    let participants = vec![
        "news_hunter".to_string(),
        "fundamental_expert".to_string(),
    ];
    let result = coordinator
        .execute_collaborative_analysis(
            "Analyse AAPL",
            &participants,
            CollaborationMode::Sequential,
            &ctx("c2"),
        )
        .await;

    assert!(result.success);
    // Two stages plus synthesis.
    assert_eq!(result.individual_results.len(), 3);
    assert_eq!(result.participating_models.len(), 2);
    // Sequential time is the sum of every task.
    let summed: u64 = result
        .individual_results
        .iter()
        .map(|r| r.execution_time_ms)
        .sum();
    assert_eq!(result.total_time_ms, summed);
    assert_eq!(result.metadata.stages, Some(2));
}

#[tokio::test]
async fn parallel_time_is_slowest_stage_plus_synthesis() {
    let adapter = TeamAdapter::new()
        .with_delay("deepseek-ai/DeepSeek-V3", 60)
        .with_delay("gemini-2.5-pro", 20);
    let (coordinator, _) = build_coordinator(adapter);

    let participants = vec![
        "news_hunter".to_string(),
        "fundamental_expert".to_string(),
        "technical_analyst".to_string(),
    ];
    let result = coordinator
        .execute_collaborative_analysis(
            "Analyse AAPL",
            &participants,
            CollaborationMode::Parallel,
            &ctx("c3"),
        )
        .await;

    assert!(result.success);
    assert_eq!(result.individual_results.len(), 4);
    assert_eq!(result.participating_models.len(), 3);

    let stage_max = result.individual_results[..3]
        .iter()
        .map(|r| r.execution_time_ms)
        .max()
        .unwrap();
    let synthesis_time = result.individual_results[3].execution_time_ms;
    assert_eq!(result.total_time_ms, stage_max + synthesis_time);
}

#[tokio::test]
async fn debate_runs_full_rounds_for_every_agent() {
    let (coordinator, _) = build_coordinator(TeamAdapter::new());
    let participants = vec![
        "fundamental_expert".to_string(),
        "technical_analyst".to_string(),
    ];
    let result = coordinator
        .execute_collaborative_analysis(
            "Analyse AAPL",
            &participants,
            CollaborationMode::Debate,
            &ctx("c4"),
        )
        .await;

    assert!(result.success);
    let history = result.metadata.debate_history.as_ref().unwrap();
    // Three rounds, two participants.
    assert_eq!(history.len(), 6);
    assert_eq!(result.metadata.rounds, Some(3));
    assert_eq!(result.metadata.agents, Some(2));
    assert_eq!(history.iter().filter(|e| e.round == 1).count(), 2);
    assert_eq!(history.iter().filter(|e| e.round == 3).count(), 2);
    // Six debate utterances plus the synthesis.
    assert_eq!(result.individual_results.len(), 7);
}

#[tokio::test]
async fn debate_requires_two_participants() {
    let (coordinator, calls) = build_coordinator(TeamAdapter::new());
    let result = coordinator
        .execute_collaborative_analysis(
            "Analyse AAPL",
            &["technical_analyst".to_string()],
            CollaborationMode::Debate,
            &ctx("c5"),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
    assert!(result
        .error_message
        .as_deref()
        .unwrap()
        .contains("2 participants"));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_team_is_a_validation_error() {
    let (coordinator, _) = build_coordinator(TeamAdapter::new());
    let result = coordinator
        .execute_collaborative_analysis("Analyse AAPL", &[], CollaborationMode::Sequential, &ctx("c6"))
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
}

#[tokio::test]
async fn failed_stage_degrades_but_synthesis_still_runs() {
    // Auth failures are non-retryable, so the technical stage hard-fails
    // while the rest of the pipeline carries on.
    let adapter = TeamAdapter::new().failing("deepseek-ai/DeepSeek-V3", ErrorKind::ApiKeyInvalid);
    let (coordinator, _) = build_coordinator(adapter);

    let participants = vec![
        "technical_analyst".to_string(),
        "fundamental_expert".to_string(),
    ];
    let result = coordinator
        .execute_collaborative_analysis(
            "Analyse AAPL",
            &participants,
            CollaborationMode::Sequential,
            &ctx("c7"),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.individual_results.len(), 3);
    assert!(!result.individual_results[0].success);
    assert!(result.individual_results[1].success);
    // The synthesis still produced a final text.
    assert!(!result.final_text.is_empty());
    assert_eq!(result.error_kind, Some(ErrorKind::ApiKeyInvalid));
}

#[tokio::test]
async fn debate_replaces_failed_positions_with_placeholder() {
    let adapter = TeamAdapter::new().failing("deepseek-ai/DeepSeek-V3", ErrorKind::ApiKeyInvalid);
    let (coordinator, _) = build_coordinator(adapter);

    let participants = vec![
        "fundamental_expert".to_string(),
        "technical_analyst".to_string(),
    ];
    let result = coordinator
        .execute_collaborative_analysis(
            "Analyse AAPL",
            &participants,
            CollaborationMode::Debate,
            &ctx("c8"),
        )
        .await;

    let history = result.metadata.debate_history.as_ref().unwrap();
    // Rounds stay rectangular even though one agent keeps failing.
    assert_eq!(history.len(), 6);
    assert!(history
        .iter()
        .filter(|e| e.agent == "technical_analyst")
        .all(|e| e.position.contains("No position available")));
}
