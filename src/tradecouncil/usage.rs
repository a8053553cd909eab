//! Token usage accounting and budget enforcement.
//!
//! Every successful task execution produces one [`UsageRecord`] appended to
//! the `usage.log` stream. The log is the source of truth for per-session
//! spend; [`UsageTracker::check_budget`] gates new work once a session's cap
//! is crossed. Recording never blocks the execution path beyond a single
//! bounded retry.

use crate::tradecouncil::store::{KvStore, USAGE_LOG};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One entry in the append-only usage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub session_id: String,
    pub analysis_type: String,
}

impl UsageRecord {
    pub fn new(
        provider: &str,
        model_name: &str,
        input_tokens: u64,
        output_tokens: u64,
        estimated_cost: f64,
        session_id: &str,
        analysis_type: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model_name: model_name.to_string(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost,
            session_id: session_id.to_string(),
            analysis_type: analysis_type.to_string(),
        }
    }
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    Exceeded,
}

/// Appends usage records and answers budget questions from the log.
pub struct UsageTracker {
    store: Arc<dyn KvStore>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Append one record. One retry on failure, then a warning; usage
    /// accounting must never stall a running task.
    pub async fn record(&self, record: &UsageRecord) {
        let line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("could not serialise usage record: {}", e);
                return;
            }
        };
        if self.store.append(USAGE_LOG, &line).await.is_ok() {
            return;
        }
        if let Err(e) = self.store.append(USAGE_LOG, &line).await {
            log::warn!(
                "usage record dropped for session {} after retry: {}",
                record.session_id,
                e
            );
        }
    }

    /// Total recorded spend for one session, summed from the log.
    pub async fn session_cost(&self, session_id: &str) -> f64 {
        let records = match self.store.read_log(USAGE_LOG).await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("could not read usage log: {}", e);
                return 0.0;
            }
        };
        records
            .iter()
            .filter_map(|line| serde_json::from_slice::<UsageRecord>(line).ok())
            .filter(|r| r.session_id == session_id)
            .map(|r| r.estimated_cost)
            .sum()
    }

    /// All records for one session, in append order.
    pub async fn session_records(&self, session_id: &str) -> Vec<UsageRecord> {
        match self.store.read_log(USAGE_LOG).await {
            Ok(records) => records
                .iter()
                .filter_map(|line| serde_json::from_slice::<UsageRecord>(line).ok())
                .filter(|r| r.session_id == session_id)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Whether a session may start new work under the given cap. `None`
    /// means no cap.
    pub async fn check_budget(&self, session_id: &str, cap: Option<f64>) -> BudgetStatus {
        let Some(cap) = cap else {
            return BudgetStatus::Ok;
        };
        let spent = self.session_cost(session_id).await;
        if spent > cap {
            log::warn!(
                "session {} exceeded budget: spent {:.4} over cap {:.4}",
                session_id,
                spent,
                cap
            );
            BudgetStatus::Exceeded
        } else {
            BudgetStatus::Ok
        }
    }
}
