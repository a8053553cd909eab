//! Multi-agent collaboration protocols.
//!
//! The coordinator runs a team of analyst roles over one task description in
//! one of three modes: `sequential` (a pipeline where each stage sees the
//! previous stage's findings), `parallel` (independent fan-out), or `debate`
//! (multi-round mutual critique). With two or more participants a final
//! synthesis task by the chief decision officer folds the team's output into
//! one recommendation.
//!
//! Failures degrade instead of aborting: a failed stage contributes its
//! error text, a missing debate position becomes a neutral placeholder so the
//! round stays complete, and an internal error triggers a simplified
//! sequential pass over the core agents before the coordinator gives up.

use crate::tradecouncil::adapter::{TaskComplexity, TaskResult};
use crate::tradecouncil::error::{ErrorKind, TaskError};
use crate::tradecouncil::manager::{ModelManager, TaskContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How the team works together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationMode {
    Sequential,
    Parallel,
    Debate,
}

impl CollaborationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaborationMode::Sequential => "sequential",
            CollaborationMode::Parallel => "parallel",
            CollaborationMode::Debate => "debate",
        }
    }
}

impl FromStr for CollaborationMode {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(CollaborationMode::Sequential),
            "parallel" => Ok(CollaborationMode::Parallel),
            "debate" => Ok(CollaborationMode::Debate),
            other => Err(TaskError::validation(format!(
                "unknown collaboration mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CollaborationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_DEBATE_ROUNDS: u32 = 3;

/// One utterance in a debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateEntry {
    pub round: u32,
    pub agent: String,
    pub position: String,
}

/// Mode-specific metadata attached to a collaboration result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollabMetadata {
    pub mode: String,
    pub stages: Option<usize>,
    pub agents: Option<usize>,
    pub rounds: Option<u32>,
    pub debate_history: Option<Vec<DebateEntry>>,
    pub session_id: Option<String>,
    /// Set when the simplified fallback produced this result.
    pub degraded: bool,
}

/// Outcome of one collaborative run.
#[derive(Debug, Clone, Serialize)]
pub struct CollaborationResult {
    pub final_text: String,
    /// Models used by the stage tasks, in dispatch order (synthesis
    /// excluded). May contain duplicates.
    pub participating_models: Vec<String>,
    /// Stage results in order, with the synthesis result appended last when
    /// one ran.
    pub individual_results: Vec<TaskResult>,
    pub mode: CollaborationMode,
    pub total_cost: f64,
    pub total_time_ms: u64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub metadata: CollabMetadata,
}

/// Runs agent teams through the collaboration protocols on top of the
/// manager.
pub struct Coordinator {
    manager: Arc<ModelManager>,
}

impl Coordinator {
    pub fn new(manager: Arc<ModelManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ModelManager> {
        &self.manager
    }

    /// Run the team and always come back with a [`CollaborationResult`].
    /// Validation problems and cancellation surface directly; anything else
    /// falls back to a simplified sequential pass over the core agents
    /// before reporting failure.
    pub async fn execute_collaborative_analysis(
        &self,
        description: &str,
        participants: &[String],
        mode: CollaborationMode,
        ctx: &TaskContext,
    ) -> CollaborationResult {
        log::info!(
            "starting {} collaboration with {} participants",
            mode,
            participants.len()
        );
        match self.run(description, participants, mode, ctx).await {
            Ok(result) => result,
            Err(err)
                if matches!(err.kind, ErrorKind::ValidationError | ErrorKind::Cancelled) =>
            {
                failure_result(mode, err, ctx)
            }
            Err(err) => {
                log::error!("collaboration failed, trying the simplified path: {}", err);
                let core = self.manager.roles().core_agents(participants, 3);
                if !core.is_empty() {
                    let mut degraded_ctx = ctx.clone();
                    degraded_ctx.single_attempt = true;
                    if degraded_ctx.options.timeout.is_none() {
                        degraded_ctx.options.timeout = Some(std::time::Duration::from_secs(30));
                    }
                    if let Ok(mut result) =
                        self.run_sequential(description, &core, &degraded_ctx).await
                    {
                        result.metadata.degraded = true;
                        log::info!("simplified collaboration succeeded");
                        return result;
                    }
                }
                failure_result(mode, err, ctx)
            }
        }
    }

    async fn run(
        &self,
        description: &str,
        participants: &[String],
        mode: CollaborationMode,
        ctx: &TaskContext,
    ) -> Result<CollaborationResult, TaskError> {
        if participants.is_empty() {
            return Err(TaskError::validation("no participants selected"));
        }
        match mode {
            CollaborationMode::Sequential => self.run_sequential(description, participants, ctx).await,
            CollaborationMode::Parallel => self.run_parallel(description, participants, ctx).await,
            CollaborationMode::Debate => self.run_debate(description, participants, ctx).await,
        }
    }

    async fn checkpoint(&self, ctx: &TaskContext) -> Result<(), TaskError> {
        if let Some(control) = &ctx.control {
            control.checkpoint().await?;
        }
        Ok(())
    }

    async fn note_progress(&self, ctx: &TaskContext, message: &str) {
        if let Some(progress) = &ctx.progress {
            progress.update(message, None).await;
        }
    }

    /// Pipeline: each stage builds on the previous stage's findings.
    async fn run_sequential(
        &self,
        description: &str,
        participants: &[String],
        ctx: &TaskContext,
    ) -> Result<CollaborationResult, TaskError> {
        let roles = self.manager.roles().clone();
        let mut individual: Vec<TaskResult> = Vec::new();
        let mut models = Vec::new();
        let mut sections: Vec<(String, String)> = Vec::new();
        let mut total_cost = 0.0;
        let mut total_time_ms = 0u64;

        for (i, role) in participants.iter().enumerate() {
            self.checkpoint(ctx).await?;
            let display = roles.display_name(role);
            self.note_progress(ctx, &format!("module started: {}", display)).await;

            let prompt = if i == 0 {
                format!(
                    "As the {}, analyse the following task:\n{}",
                    display, description
                )
            } else {
                format!(
                    "As the {}, continue the analysis, building on the previous stage.\n\n\
                     Previous stage findings:\n{}\n\n\
                     Original task:\n{}\n\n\
                     Provide your specialist analysis and recommendations.",
                    display,
                    sections.last().map(|(_, text)| text.as_str()).unwrap_or(""),
                    description
                )
            };

            let result = self
                .manager
                .execute_task(role, &prompt, &roles.task_type(role), TaskComplexity::Medium, ctx)
                .await;
            self.note_progress(ctx, &format!("module completed: {}", display)).await;

            total_cost += result.actual_cost;
            total_time_ms += result.execution_time_ms;
            if let Some(spec) = &result.model_used {
                models.push(spec.name.clone());
            }
            sections.push((display, stage_text(role, &result)));
            individual.push(result);
        }

        let final_text = if participants.len() >= 2 {
            self.checkpoint(ctx).await?;
            self.note_progress(ctx, "Generating investment advice").await;
            let synthesis = self.synthesize(description, &sections, ctx).await;
            total_cost += synthesis.actual_cost;
            total_time_ms += synthesis.execution_time_ms;
            let text = stage_text("chief_decision_officer", &synthesis);
            individual.push(synthesis);
            text
        } else {
            sections
                .last()
                .map(|(_, text)| text.clone())
                .unwrap_or_default()
        };

        let success = individual.iter().all(|r| r.success);
        Ok(CollaborationResult {
            final_text,
            participating_models: models,
            error_kind: first_failure(&individual).and_then(|r| r.error_kind),
            error_message: first_failure(&individual).and_then(|r| r.error_message.clone()),
            individual_results: individual,
            mode: CollaborationMode::Sequential,
            total_cost,
            total_time_ms,
            success,
            metadata: CollabMetadata {
                mode: CollaborationMode::Sequential.as_str().to_string(),
                stages: Some(participants.len()),
                session_id: ctx.session_id.clone(),
                ..CollabMetadata::default()
            },
        })
    }

    /// Fan-out: every role analyses the raw description concurrently. Total
    /// time is the slowest stage plus the synthesis.
    async fn run_parallel(
        &self,
        description: &str,
        participants: &[String],
        ctx: &TaskContext,
    ) -> Result<CollaborationResult, TaskError> {
        self.checkpoint(ctx).await?;
        let roles = self.manager.roles().clone();

        let mut handles = Vec::new();
        for role in participants {
            let display = roles.display_name(role);
            self.note_progress(ctx, &format!("module started: {}", display)).await;
            let manager = Arc::clone(&self.manager);
            let task_type = roles.task_type(role);
            let prompt = format!(
                "As the {}, analyse the following task from your specialist perspective:\n{}",
                display, description
            );
            let role = role.clone();
            let task_ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let result = manager
                    .execute_task(&role, &prompt, &task_type, TaskComplexity::Medium, &task_ctx)
                    .await;
                (role, result)
            }));
        }

        let mut individual = Vec::new();
        let mut models = Vec::new();
        let mut sections = Vec::new();
        let mut total_cost = 0.0;
        let mut max_stage_ms = 0u64;

        for handle in handles {
            let (role, result) = handle
                .await
                .map_err(|e| TaskError::internal(format!("worker join error: {}", e)))?;
            let display = roles.display_name(&role);
            self.note_progress(ctx, &format!("module completed: {}", display)).await;
            total_cost += result.actual_cost;
            max_stage_ms = max_stage_ms.max(result.execution_time_ms);
            if let Some(spec) = &result.model_used {
                models.push(spec.name.clone());
            }
            sections.push((display, stage_text(&role, &result)));
            individual.push(result);
        }

        let mut total_time_ms = max_stage_ms;
        let final_text = if participants.len() >= 2 {
            self.checkpoint(ctx).await?;
            self.note_progress(ctx, "Generating investment advice").await;
            let synthesis = self.synthesize(description, &sections, ctx).await;
            total_cost += synthesis.actual_cost;
            total_time_ms += synthesis.execution_time_ms;
            let text = stage_text("chief_decision_officer", &synthesis);
            individual.push(synthesis);
            text
        } else {
            sections
                .last()
                .map(|(_, text)| text.clone())
                .unwrap_or_default()
        };

        let success = individual.iter().all(|r| r.success);
        Ok(CollaborationResult {
            final_text,
            participating_models: models,
            error_kind: first_failure(&individual).and_then(|r| r.error_kind),
            error_message: first_failure(&individual).and_then(|r| r.error_message.clone()),
            individual_results: individual,
            mode: CollaborationMode::Parallel,
            total_cost,
            total_time_ms,
            success,
            metadata: CollabMetadata {
                mode: CollaborationMode::Parallel.as_str().to_string(),
                agents: Some(participants.len()),
                session_id: ctx.session_id.clone(),
                ..CollabMetadata::default()
            },
        })
    }

    /// Multi-round mutual critique. Round `k + 1` never starts before every
    /// position of round `k` is collected; a failed utterance is replaced by
    /// a neutral placeholder so the round window stays complete.
    async fn run_debate(
        &self,
        description: &str,
        participants: &[String],
        ctx: &TaskContext,
    ) -> Result<CollaborationResult, TaskError> {
        if participants.len() < 2 {
            return Err(TaskError::validation("debate requires >= 2 participants"));
        }
        let rounds = ctx.max_debate_rounds.unwrap_or(DEFAULT_DEBATE_ROUNDS).max(2);
        let roles = self.manager.roles().clone();

        let mut history: Vec<DebateEntry> = Vec::new();
        let mut individual = Vec::new();
        let mut models = Vec::new();
        let mut total_cost = 0.0;
        let mut total_time_ms = 0u64;

        for role in participants {
            self.checkpoint(ctx).await?;
            let display = roles.display_name(role);
            self.note_progress(ctx, &format!("module started: {}", display)).await;
            let prompt = format!(
                "As the {}, state your initial position on the following task:\n{}\n\n\
                 Be explicit about your stance and the reasons behind it.",
                display, description
            );
            let result = self
                .manager
                .execute_task(role, &prompt, &roles.task_type(role), TaskComplexity::Medium, ctx)
                .await;
            total_cost += result.actual_cost;
            total_time_ms += result.execution_time_ms;
            if let Some(spec) = &result.model_used {
                models.push(spec.name.clone());
            }
            history.push(DebateEntry {
                round: 1,
                agent: role.clone(),
                position: debate_position(&result),
            });
            individual.push(result);
        }

        for round in 2..=rounds {
            self.checkpoint(ctx).await?;
            // Snapshot the previous round before anyone speaks so positions
            // within a round stay independent.
            let window: Vec<DebateEntry> =
                history[history.len() - participants.len()..].to_vec();
            for role in participants {
                self.checkpoint(ctx).await?;
                let display = roles.display_name(role);
                let others = window
                    .iter()
                    .filter(|e| e.agent != *role)
                    .map(|e| format!("{}: {}", roles.display_name(&e.agent), e.position))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let prompt = format!(
                    "Debate round {}. As the {}, respond to the other experts.\n\n\
                     Original task:\n{}\n\n\
                     Other experts' latest positions:\n{}\n\n\
                     Respond to their points, hold or revise your stance, and add new evidence.",
                    round, display, description, others
                );
                let result = self
                    .manager
                    .execute_task(role, &prompt, &roles.task_type(role), TaskComplexity::Medium, ctx)
                    .await;
                total_cost += result.actual_cost;
                total_time_ms += result.execution_time_ms;
                if let Some(spec) = &result.model_used {
                    models.push(spec.name.clone());
                }
                history.push(DebateEntry {
                    round,
                    agent: role.clone(),
                    position: debate_position(&result),
                });
                individual.push(result);
            }
        }

        self.checkpoint(ctx).await?;
        self.note_progress(ctx, "Generating investment advice").await;
        let transcript: Vec<(String, String)> = history
            .iter()
            .map(|e| {
                (
                    format!("Round {}, {}", e.round, roles.display_name(&e.agent)),
                    e.position.clone(),
                )
            })
            .collect();
        let synthesis = self.synthesize(description, &transcript, ctx).await;
        total_cost += synthesis.actual_cost;
        total_time_ms += synthesis.execution_time_ms;
        let final_text = stage_text("chief_decision_officer", &synthesis);
        individual.push(synthesis);

        let success = individual.iter().all(|r| r.success);
        Ok(CollaborationResult {
            final_text,
            participating_models: models,
            error_kind: first_failure(&individual).and_then(|r| r.error_kind),
            error_message: first_failure(&individual).and_then(|r| r.error_message.clone()),
            individual_results: individual,
            mode: CollaborationMode::Debate,
            total_cost,
            total_time_ms,
            success,
            metadata: CollabMetadata {
                mode: CollaborationMode::Debate.as_str().to_string(),
                agents: Some(participants.len()),
                rounds: Some(rounds),
                debate_history: Some(history),
                session_id: ctx.session_id.clone(),
                ..CollabMetadata::default()
            },
        })
    }

    /// Final consensus task by the chief decision officer over the team's
    /// sections.
    async fn synthesize(
        &self,
        description: &str,
        sections: &[(String, String)],
        ctx: &TaskContext,
    ) -> TaskResult {
        let combined = sections
            .iter()
            .map(|(heading, text)| format!("## {}\n{}", heading, text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "As the Chief Decision Officer, synthesise the team's findings into a final recommendation.\n\n\
             Original task:\n{}\n\n\
             Team findings:\n{}\n\n\
             Deliver a clear, decision-ready conclusion with the key risks called out.",
            description, combined
        );
        self.manager
            .execute_task(
                "chief_decision_officer",
                &prompt,
                "decision_making",
                TaskComplexity::High,
                ctx,
            )
            .await
    }
}

/// The text a stage contributes downstream: its output on success, its error
/// framed inline on failure so later stages and the synthesis can carry on.
fn stage_text(role: &str, result: &TaskResult) -> String {
    if result.success {
        result.text.clone()
    } else {
        format!(
            "[{} analysis unavailable: {}]",
            role,
            result.error_message.as_deref().unwrap_or("unknown error")
        )
    }
}

/// Debate rounds must stay rectangular, so a failed utterance becomes a
/// neutral placeholder.
fn debate_position(result: &TaskResult) -> String {
    if result.success {
        result.text.clone()
    } else {
        "No position available this round (analysis unavailable).".to_string()
    }
}

fn first_failure(results: &[TaskResult]) -> Option<&TaskResult> {
    results.iter().find(|r| !r.success)
}

fn failure_result(mode: CollaborationMode, err: TaskError, ctx: &TaskContext) -> CollaborationResult {
    CollaborationResult {
        final_text: String::new(),
        participating_models: Vec::new(),
        individual_results: Vec::new(),
        mode,
        total_cost: 0.0,
        total_time_ms: 0,
        success: false,
        error_kind: Some(err.kind),
        error_message: Some(err.user_friendly()),
        metadata: CollabMetadata {
            mode: mode.as_str().to_string(),
            session_id: ctx.session_id.clone(),
            ..CollabMetadata::default()
        },
    }
}
