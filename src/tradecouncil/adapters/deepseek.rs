//! DeepSeek vendor-native adapter.
//!
//! Talks to DeepSeek's own API surface. The reasoner model gets the extended
//! timeout because it deliberates before emitting its first token.

use crate::tradecouncil::adapter::{ProviderAdapter, TaskOptions, TaskResult, TaskSpec};
use crate::tradecouncil::adapters::common::{execute_openai_compat, probe_endpoint};
use crate::tradecouncil::catalog::{model_spec, Capability, ModelKind, ModelSpec, Provider};
use crate::tradecouncil::error::ErrorKind;
use std::collections::HashMap;

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

pub struct DeepSeekAdapter {
    api_key: String,
    base_url: String,
    models: HashMap<String, ModelSpec>,
}

impl DeepSeekAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Point the adapter at a proxy or test server.
    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        let mut models = HashMap::new();
        for spec in [
            model_spec(
                "deepseek-chat",
                Provider::DeepSeek,
                ModelKind::General,
                0.0014,
                8192,
                65536,
                &[
                    (Capability::Reasoning, 0.85),
                    (Capability::Speed, 0.7),
                    (Capability::Chinese, 0.85),
                    (Capability::CostEfficiency, 0.8),
                    (Capability::Reliability, 0.85),
                ],
            ),
            model_spec(
                "deepseek-reasoner",
                Provider::DeepSeek,
                ModelKind::Reasoning,
                0.0055,
                32768,
                65536,
                &[
                    (Capability::Reasoning, 0.95),
                    (Capability::Speed, 0.4),
                    (Capability::Chinese, 0.85),
                    (Capability::CostEfficiency, 0.6),
                    (Capability::Reliability, 0.9),
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
impl ProviderAdapter for DeepSeekAdapter {
    fn provider(&self) -> Provider {
        Provider::DeepSeek
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
                format!("DeepSeek does not serve '{}'", model_name),
            );
        };
        execute_openai_compat(self, &self.base_url, &self.api_key, spec, prompt, options).await
    }

    async fn health_check(&self) -> bool {
        probe_endpoint(&format!("{}/models", self.base_url), &self.api_key).await
    }
}
