//! Analyst roles and per-role routing policy.
//!
//! A role maps an agent key to its display name, default task type, and
//! priority. Priority orders the core-team selection used by the simplified
//! collaboration fallback (lower number, more essential).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Declarative description of a participating agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRole {
    pub key: String,
    pub display_name: String,
    /// Default task tag routed for this role.
    pub task_type: String,
    /// Core-team ordering; lower is selected first in degraded mode.
    pub priority: u32,
}

/// The roles recognised out of the box. Unknown keys still work; they fall
/// back to a generic task type and the lowest priority.
pub fn builtin_roles() -> Vec<AgentRole> {
    let table: [(&str, &str, &str, u32); 9] = [
        ("fundamental_expert", "Fundamental Expert", "fundamental_analysis", 1),
        ("news_hunter", "News Hunter", "news_analysis", 2),
        ("risk_manager", "Risk Manager", "risk_assessment", 3),
        ("technical_analyst", "Technical Analyst", "technical_analysis", 4),
        ("sentiment_analyst", "Sentiment Analyst", "sentiment_analysis", 5),
        ("policy_researcher", "Policy Researcher", "policy_analysis", 6),
        ("tool_engineer", "Tool Engineer", "tool_development", 7),
        ("compliance_officer", "Compliance Officer", "compliance_check", 8),
        ("chief_decision_officer", "Chief Decision Officer", "decision_making", 9),
    ];
    table
        .iter()
        .map(|(key, name, task, prio)| AgentRole {
            key: key.to_string(),
            display_name: name.to_string(),
            task_type: task.to_string(),
            priority: *prio,
        })
        .collect()
}

/// Lookup table over the role set.
#[derive(Clone)]
pub struct RoleRegistry {
    roles: HashMap<String, AgentRole>,
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::new(builtin_roles())
    }
}

impl RoleRegistry {
    pub fn new(roles: Vec<AgentRole>) -> Self {
        Self {
            roles: roles.into_iter().map(|r| (r.key.clone(), r)).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AgentRole> {
        self.roles.get(key)
    }

    pub fn display_name(&self, key: &str) -> String {
        self.roles
            .get(key)
            .map(|r| r.display_name.clone())
            .unwrap_or_else(|| key.replace('_', " "))
    }

    /// Default task type for a role; unknown roles analyse generically.
    pub fn task_type(&self, key: &str) -> String {
        self.roles
            .get(key)
            .map(|r| r.task_type.clone())
            .unwrap_or_else(|| "general".to_string())
    }

    /// Participants ordered by declared priority, unknown roles last.
    pub fn core_agents(&self, participants: &[String], limit: usize) -> Vec<String> {
        let mut sorted: Vec<String> = participants.to_vec();
        sorted.sort_by_key(|key| self.roles.get(key).map(|r| r.priority).unwrap_or(u32::MAX));
        sorted.truncate(limit);
        sorted
    }

    /// Short prompt template for the last-resort simplified execution path.
    pub fn simplified_prompt(&self, key: &str, content: &str) -> String {
        let content: String = content.chars().take(800).collect();
        match key {
            "news_hunter" => format!(
                "Briefly identify the key information in the following content:\n{}\n\nSummarise the main points in 3-5 sentences.",
                content
            ),
            "fundamental_expert" => format!(
                "Provide a basic fundamental read of the following content:\n{}\n\nHighlight the main findings.",
                content
            ),
            "technical_analyst" => format!(
                "Give a brief technical observation of the following content:\n{}\n\nList the key technical points.",
                content
            ),
            "risk_manager" => format!(
                "Assess the main risks in the following content:\n{}\n\nList 2-3 key risk points.",
                content
            ),
            _ => format!(
                "Analyse the following content:\n{}\n\nProvide a brief assessment.",
                content
            ),
        }
    }
}

/// Per-agent routing policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentBinding {
    pub locked_model: Option<String>,
    #[serde(default)]
    pub allow_models: HashSet<String>,
    #[serde(default)]
    pub deny_models: HashSet<String>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

/// Per-task-type routing policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskBinding {
    #[serde(default)]
    pub allow_models: HashSet<String>,
    #[serde(default)]
    pub deny_models: HashSet<String>,
}

/// Session- or request-scoped overrides that dominate the static bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOverrides {
    #[serde(default)]
    pub enable_model_lock: bool,
    #[serde(default)]
    pub model_overrides: HashMap<String, String>,
    #[serde(default)]
    pub enable_allowed_models_by_role: bool,
    #[serde(default)]
    pub allowed_models_by_role: HashMap<String, HashSet<String>>,
}

/// Static policy consulted by routing: bindings keyed by agent role and task
/// type.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub agent_bindings: HashMap<String, AgentBinding>,
    pub task_bindings: HashMap<String, TaskBinding>,
}
