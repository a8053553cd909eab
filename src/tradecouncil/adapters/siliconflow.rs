//! SiliconFlow multi-model gateway adapter.
//!
//! SiliconFlow fronts many open-weight models behind one OpenAI-compatible
//! endpoint, which makes it the widest single source in the catalog.
//! `deepseek-ai/DeepSeek-V3` is the flagship of the technical/long-sequence
//! pool.

use crate::tradecouncil::adapter::{ProviderAdapter, TaskOptions, TaskResult, TaskSpec};
use crate::tradecouncil::adapters::common::{execute_openai_compat, probe_endpoint};
use crate::tradecouncil::catalog::{model_spec, Capability, ModelKind, ModelSpec, Provider};
use crate::tradecouncil::error::ErrorKind;
use std::collections::HashMap;

const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn/v1";

pub struct SiliconFlowAdapter {
    api_key: String,
    base_url: String,
    models: HashMap<String, ModelSpec>,
}

impl SiliconFlowAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        let mut models = HashMap::new();
        for spec in [
            model_spec(
                "deepseek-ai/DeepSeek-V3",
                Provider::SiliconFlow,
                ModelKind::Balanced,
                0.002,
                8192,
                131_072,
                &[
                    (Capability::Reasoning, 0.9),
                    (Capability::Multimodal, 0.7),
                    (Capability::LongContext, 0.95),
                    (Capability::Chinese, 0.95),
                    (Capability::TechnicalAnalysis, 0.92),
                    (Capability::TimeSeries, 0.9),
                    (Capability::CodeGeneration, 0.85),
                    (Capability::CostEfficiency, 0.85),
                    (Capability::Speed, 0.7),
                    (Capability::Reliability, 0.9),
                ],
            ),
            model_spec(
                "deepseek-ai/DeepSeek-R1",
                Provider::SiliconFlow,
                ModelKind::Reasoning,
                0.004,
                16384,
                98_304,
                &[
                    (Capability::Reasoning, 0.95),
                    (Capability::Speed, 0.5),
                    (Capability::Chinese, 0.8),
                    (Capability::CostEfficiency, 0.6),
                    (Capability::Reliability, 0.9),
                ],
            ),
            model_spec(
                "moonshotai/Kimi-K2-Instruct",
                Provider::SiliconFlow,
                ModelKind::Agent,
                0.0023,
                16384,
                131_072,
                &[
                    (Capability::Reasoning, 0.8),
                    (Capability::Speed, 0.6),
                    (Capability::Chinese, 0.8),
                    (Capability::LongContext, 0.95),
                    (Capability::CostEfficiency, 0.6),
                    (Capability::Reliability, 0.8),
                ],
            ),
            model_spec(
                "Qwen/Qwen2.5-Coder-32B-Instruct",
                Provider::SiliconFlow,
                ModelKind::Coder,
                0.0018,
                8192,
                131_072,
                &[
                    (Capability::Reasoning, 0.8),
                    (Capability::Speed, 0.7),
                    (Capability::Chinese, 0.9),
                    (Capability::CodeGeneration, 0.95),
                    (Capability::CostEfficiency, 0.8),
                    (Capability::Reliability, 0.85),
                ],
            ),
            model_spec(
                "Pro/Qwen/Qwen2.5-72B-Instruct",
                Provider::SiliconFlow,
                ModelKind::General,
                0.0041,
                8192,
                131_072,
                &[
                    (Capability::Reasoning, 0.87),
                    (Capability::Speed, 0.6),
                    (Capability::Chinese, 0.9),
                    (Capability::CostEfficiency, 0.65),
                    (Capability::Reliability, 0.9),
                ],
            ),
            model_spec(
                "Qwen/Qwen3-235B-A22B-Instruct-2507",
                Provider::SiliconFlow,
                ModelKind::Premium,
                0.01,
                16384,
                262_144,
                &[
                    (Capability::Reasoning, 0.92),
                    (Capability::Speed, 0.5),
                    (Capability::Chinese, 0.95),
                    (Capability::LongContext, 0.9),
                    (Capability::CostEfficiency, 0.4),
                    (Capability::Reliability, 0.9),
                ],
            ),
            model_spec(
                "zai-org/GLM-4.5",
                Provider::SiliconFlow,
                ModelKind::Chinese,
                0.0025,
                8192,
                131_072,
                &[
                    (Capability::Reasoning, 0.82),
                    (Capability::Speed, 0.65),
                    (Capability::Chinese, 0.95),
                    (Capability::CostEfficiency, 0.75),
                    (Capability::Reliability, 0.85),
                ],
            ),
        ] {
            models.insert(spec.name.clone(), spec);
        }
        Self {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            models,
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for SiliconFlowAdapter {
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
        options: &TaskOptions,
    ) -> TaskResult {
        let Some(spec) = self.models.get(model_name) else {
            return TaskResult::failed(
                ErrorKind::ModelUnavailable,
                format!("SiliconFlow does not serve '{}'", model_name),
            );
        };
        execute_openai_compat(self, &self.base_url, &self.api_key, spec, prompt, options).await
    }

    async fn health_check(&self) -> bool {
        probe_endpoint(&format!("{}/models", self.base_url), &self.api_key).await
    }
}
