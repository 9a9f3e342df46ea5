//! Review board and supervisor stages.
//!
//! The board posts the artifact to the ticket, fans it out to the reviewer
//! panel for the current work item's kind in parallel, collects every
//! verdict, and appends them to the state in panel order. The supervisor
//! then decides: unanimous approval from a non-empty cycle advances the
//! item, anything else either goes back to drafting or fails the run once
//! the iteration budget is gone.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Stage;
use crate::collab::{Generator, IssueTracker};
use crate::collab::retry::{self, RetryPolicy};
use crate::config::Config;
use crate::decode;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, ReviewFeedback, RunStatus, StateUpdate, WorkItemKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reviewer {
    Security,
    Compliance,
    Design,
}

impl Reviewer {
    /// Panel for a work item kind. Contracts and server-side work get the
    /// security and compliance pair; interface work gets the design
    /// reviewer.
    pub fn panel_for(kind: WorkItemKind) -> &'static [Reviewer] {
        match kind {
            WorkItemKind::Contract | WorkItemKind::Backend => {
                &[Self::Security, Self::Compliance]
            }
            WorkItemKind::Frontend => &[Self::Design],
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Security => "security",
            Self::Compliance => "compliance",
            Self::Design => "design",
        }
    }

    fn charter(self) -> &'static str {
        match self {
            Self::Security => {
                "You are a security reviewer. Reject anything that exposes \
                 credentials, skips authentication or authorization, stores \
                 sensitive data unprotected, or widens the attack surface."
            }
            Self::Compliance => {
                "You are a compliance reviewer. Reject anything that mishandles \
                 personal or regulated data: missing consent, unbounded \
                 retention, undisclosed sharing, or absent audit trails."
            }
            Self::Design => {
                "You are a design reviewer. Reject interfaces and contracts \
                 that are inconsistent, leak internal details, or will not \
                 compose with the rest of the stack."
            }
        }
    }

    fn prompt(self, state: &ExecutionState, artifact: &str) -> String {
        format!(
            "{}\n\nFeature under review:\n{}\n\nArtifact:\n{}\n\n\
             Respond with JSON only:\n\
             {{\"approved\": true/false, \"concerns\": [\"...\"], \"suggestions\": [\"...\"]}}",
            self.charter(),
            state.task_description,
            artifact
        )
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    approved: bool,
    #[serde(default)]
    concerns: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

pub struct BoardStage {
    config: Arc<Config>,
    generator: Arc<dyn Generator>,
    tracker: Arc<dyn IssueTracker>,
}

impl BoardStage {
    pub fn new(
        config: Arc<Config>,
        generator: Arc<dyn Generator>,
        tracker: Arc<dyn IssueTracker>,
    ) -> Self {
        Self {
            config,
            generator,
            tracker,
        }
    }

    async fn review_one(
        &self,
        reviewer: Reviewer,
        state: &ExecutionState,
        artifact: &str,
    ) -> Result<ReviewFeedback, StageError> {
        let policy = RetryPolicy::new(self.config.retry_attempts);
        let prompt = reviewer.prompt(state, artifact);
        let response = retry::with_retry(&policy, "generator.invoke", || {
            retry::bounded(
                "generator.invoke",
                self.config.call_timeout,
                self.generator.invoke(&prompt),
            )
        })
        .await?;

        match decode::extract::<Verdict>(&response, "review verdict") {
            Ok(verdict) => {
                debug!(reviewer = reviewer.id(), approved = verdict.approved, "verdict");
                Ok(ReviewFeedback {
                    reviewer_id: reviewer.id().to_string(),
                    approved: verdict.approved,
                    concerns: verdict.concerns,
                    suggestions: verdict.suggestions,
                })
            }
            // An unreadable verdict counts as a rejection, never as assent.
            Err(err) => {
                warn!(reviewer = reviewer.id(), error = %err, "unreadable verdict");
                Ok(ReviewFeedback {
                    reviewer_id: reviewer.id().to_string(),
                    approved: false,
                    concerns: vec![format!("review response could not be parsed: {err}")],
                    suggestions: Vec::new(),
                })
            }
        }
    }
}

#[async_trait]
impl Stage for BoardStage {
    fn name(&self) -> StageName {
        StageName::Review
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let item = state
            .current_work_item()
            .ok_or_else(|| StageError::Fatal("review requested with no work item selected".into()))?;
        let artifact = state
            .current_artifact
            .as_deref()
            .ok_or_else(|| StageError::Fatal("review requested with no artifact".into()))?;

        // The artifact goes on the ticket so a human can follow the
        // approval trail.
        if let Some(ticket) = &state.ticket {
            let note = format!(
                "Artifact for review ({} '{}', iteration {}):\n```json\n{}\n```",
                item.kind, item.title, state.iteration_count, artifact
            );
            self.tracker.add_note(&ticket.id, &note).await?;
        }

        // Fan out to the kind's panel, then append in panel order so the
        // recorded cycle is deterministic regardless of completion order.
        let panel = Reviewer::panel_for(item.kind);
        let results = join_all(
            panel
                .iter()
                .map(|reviewer| self.review_one(*reviewer, state, artifact)),
        )
        .await;

        let mut feedback = Vec::with_capacity(results.len());
        for result in results {
            feedback.push(result?);
        }

        let approvals = feedback.iter().filter(|f| f.approved).count();
        info!(approvals, panel = feedback.len(), kind = %item.kind, "review cycle collected");
        let mut update = StateUpdate::status(RunStatus::Reviewing).with_message(format!(
            "review cycle: {approvals}/{} approved",
            feedback.len()
        ));
        update.feedback = feedback;
        Ok(update)
    }
}

/// Approval decision over the current review cycle.
pub struct SuperviseStage {
    config: Arc<Config>,
}

impl SuperviseStage {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for SuperviseStage {
    fn name(&self) -> StageName {
        StageName::Supervise
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let cycle = &state.feedback;
        // An empty cycle must never count as unanimous approval.
        let all_approved = !cycle.is_empty() && cycle.iter().all(|f| f.approved);

        if all_approved {
            info!(panel = cycle.len(), "cycle approved");
            return Ok(StateUpdate::status(RunStatus::Approved)
                .with_message(format!("approved by all {} reviewers", cycle.len())));
        }

        if state.iteration_count >= self.config.max_iterations {
            warn!(
                iterations = state.iteration_count,
                "iteration budget exhausted without approval"
            );
            return Ok(StateUpdate::status(RunStatus::Failed).with_message(format!(
                "max iterations exceeded: not approved after {} review cycles",
                state.iteration_count
            )));
        }

        let rejections = cycle.iter().filter(|f| !f.approved).count();
        info!(rejections, iteration = state.iteration_count, "sending back to drafting");
        Ok(StateUpdate::status(RunStatus::Drafting).with_message(format!(
            "{rejections} rejection(s), revising (iteration {} of {})",
            state.iteration_count, self.config.max_iterations
        )))
    }
}
