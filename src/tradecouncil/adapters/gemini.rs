//! Google Gemini adapter via the OpenAI-compatible endpoint.
//!
//! Google exposes an OpenAI-protocol surface for the Gemini family, so this
//! adapter reuses the shared chat plumbing unchanged. `gemini-2.5-pro` is the
//! flagship of the deep-reasoning pool.

use crate::tradecouncil::adapter::{ProviderAdapter, TaskOptions, TaskResult, TaskSpec};
use crate::tradecouncil::adapters::common::{execute_openai_compat, probe_endpoint};
use crate::tradecouncil::catalog::{model_spec, Capability, ModelKind, ModelSpec, Provider};
use crate::tradecouncil::error::ErrorKind;
use std::collections::HashMap;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub struct GeminiAdapter {
    api_key: String,
    base_url: String,
    models: HashMap<String, ModelSpec>,
}

impl GeminiAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        let mut models = HashMap::new();
        for spec in [
            model_spec(
                "gemini-2.5-pro",
                Provider::Google,
                ModelKind::Premium,
                0.00625,
                65536,
                1_048_576,
                &[
                    (Capability::Reasoning, 0.95),
                    (Capability::Multimodal, 0.95),
                    (Capability::LongContext, 0.9),
                    (Capability::Chinese, 0.8),
                    (Capability::FinancialAnalysis, 0.92),
                    (Capability::CostEfficiency, 0.3),
                    (Capability::Speed, 0.5),
                    (Capability::Reliability, 0.95),
                ],
            ),
            model_spec(
                "gemini-2.5-flash",
                Provider::Google,
                ModelKind::Speed,
                0.0009,
                65536,
                1_048_576,
                &[
                    (Capability::Reasoning, 0.85),
                    (Capability::Speed, 0.9),
                    (Capability::Chinese, 0.8),
                    (Capability::CostEfficiency, 0.8),
                    (Capability::Reliability, 0.9),
                ],
            ),
            model_spec(
                "gemini-2.0-flash",
                Provider::Google,
                ModelKind::Speed,
                0.0004,
                8192,
                1_048_576,
                &[
                    (Capability::Reasoning, 0.8),
                    (Capability::Speed, 0.8),
                    (Capability::Chinese, 0.7),
                    (Capability::CostEfficiency, 0.75),
                    (Capability::Reliability, 0.85),
                ],
            ),
            model_spec(
                "gemini-1.5-pro",
                Provider::Google,
                ModelKind::General,
                0.0035,
                8192,
                2_097_152,
                &[
                    (Capability::Reasoning, 0.85),
                    (Capability::Speed, 0.6),
                    (Capability::Chinese, 0.7),
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
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
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
                format!("Gemini does not serve '{}'", model_name),
            );
        };
        execute_openai_compat(self, &self.base_url, &self.api_key, spec, prompt, options).await
    }

    async fn health_check(&self) -> bool {
        probe_endpoint(&format!("{}/models", self.base_url), &self.api_key).await
    }
}
