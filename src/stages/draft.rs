//! Drafting stage: produce or revise the artifact for the current work
//! item.
//!
//! On a revision pass the previous cycle's rejections are folded into the
//! prompt and the cycle's feedback is cleared, so the next review starts
//! from a clean slate. Each produced artifact consumes one review
//! iteration; malformed output is corrected in a separate bounded cycle
//! that does not touch the iteration count.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

use super::Stage;
use crate::collab::Generator;
use crate::collab::retry::{self, RetryPolicy};
use crate::config::Config;
use crate::decode;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, RunStatus, StateUpdate, WorkItem, WorkItemKind};

pub struct DraftStage {
    config: Arc<Config>,
    generator: Arc<dyn Generator>,
}

impl DraftStage {
    pub fn new(config: Arc<Config>, generator: Arc<dyn Generator>) -> Self {
        Self { config, generator }
    }

    fn prompt_for(&self, state: &ExecutionState, item: &WorkItem) -> String {
        let focus = match item.kind {
            WorkItemKind::Contract => {
                "Produce the data schema and API contract as a JSON object with \
                 \"entities\" and \"endpoints\" keys."
            }
            WorkItemKind::Backend => {
                "Produce the server-side implementation plan as a JSON object with \
                 \"modules\" and \"endpoints\" keys, implementing the agreed contract."
            }
            WorkItemKind::Frontend => {
                "Produce the user interface implementation plan as a JSON object with \
                 \"components\" and \"routes\" keys, consuming the agreed contract."
            }
        };

        let mut prompt = format!(
            "You are implementing one work item of a larger feature.\n\n\
             Feature:\n{}\n\n\
             Work item ({}): {}\n{}\n",
            state.task_description, item.kind, item.title, item.description
        );
        if !item.acceptance_criteria.is_empty() {
            let _ = write!(prompt, "\nAcceptance criteria:\n");
            for criterion in &item.acceptance_criteria {
                let _ = writeln!(prompt, "- {criterion}");
            }
        }

        let rejections: Vec<_> = state.feedback.iter().filter(|f| !f.approved).collect();
        if !rejections.is_empty() {
            let _ = write!(
                prompt,
                "\nYour previous draft was rejected. Address every concern:\n"
            );
            for feedback in rejections {
                for concern in &feedback.concerns {
                    let _ = writeln!(prompt, "- [{}] {concern}", feedback.reviewer_id);
                }
                for suggestion in &feedback.suggestions {
                    let _ = writeln!(prompt, "- [{}] suggestion: {suggestion}", feedback.reviewer_id);
                }
            }
        }

        let _ = write!(prompt, "\n{focus}\nRespond with JSON only.");
        prompt
    }
}

#[async_trait]
impl Stage for DraftStage {
    fn name(&self) -> StageName {
        StageName::Draft
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let item = state
            .current_work_item()
            .ok_or_else(|| StageError::Fatal("drafting with no work item selected".into()))?;

        let policy = RetryPolicy::new(self.config.retry_attempts);
        let revising = state.feedback.iter().any(|f| !f.approved);
        let mut prompt = self.prompt_for(state, item);

        for attempt in 1..=self.config.parse_attempts {
            let response = retry::with_retry(&policy, "generator.invoke", || {
                retry::bounded(
                    "generator.invoke",
                    self.config.call_timeout,
                    self.generator.invoke(&prompt),
                )
            })
            .await?;

            match decode::extract::<serde_json::Value>(&response, "work item artifact") {
                Ok(artifact) => {
                    let iteration = state.iteration_count + 1;
                    info!(
                        item = %item.title,
                        iteration,
                        revising,
                        "artifact drafted"
                    );
                    let mut update = StateUpdate::status(RunStatus::Reviewing).with_message(
                        format!("drafted '{}' (iteration {iteration})", item.title),
                    );
                    update.current_artifact = Some(
                        serde_json::to_string_pretty(&artifact)
                            .map_err(|e| StageError::Fatal(format!("artifact reserialize: {e}")))?,
                    );
                    update.iteration_count = Some(iteration);
                    // The consumed cycle's feedback is cleared so reviews of
                    // this draft stand alone.
                    update.clear_feedback = true;
                    return Ok(update);
                }
                Err(err) => {
                    debug!(attempt, error = %err, "artifact rejected, asking for a correction");
                    prompt = format!(
                        "{prompt}\n\nYour previous response was rejected: {err}\n\
                         Respond again with valid JSON only."
                    );
                }
            }
        }

        Err(StageError::ParseBudgetExhausted {
            attempts: self.config.parse_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing;
    use crate::state::ReviewFeedback;

    fn draft_stage(mocks: &testing::MockSet) -> DraftStage {
        DraftStage::new(
            Arc::new(Config::for_dir(std::env::temp_dir())),
            mocks.collab.generator.clone(),
        )
    }

    fn state_with_item() -> ExecutionState {
        let mut state = ExecutionState::for_task("patient profiles");
        state.work_items = vec![WorkItem::new(
            WorkItemKind::Contract,
            "Profile schema",
            "entities and endpoints",
        )];
        state
    }

    #[tokio::test]
    async fn test_draft_produces_artifact_and_consumes_an_iteration() {
        let mocks = testing::mocks(vec![r#"{"entities": ["Profile"], "endpoints": []}"#]);
        let stage = draft_stage(&mocks);
        let update = stage.run(&state_with_item()).await.unwrap();

        assert_eq!(update.status, Some(RunStatus::Reviewing));
        assert_eq!(update.iteration_count, Some(1));
        assert!(update.current_artifact.unwrap().contains("Profile"));
        assert!(update.clear_feedback);
    }

    #[tokio::test]
    async fn test_revision_prompt_carries_rejection_concerns() {
        let mocks = testing::mocks(vec![r#"{"entities": []}"#]);
        let stage = draft_stage(&mocks);
        let mut state = state_with_item();
        state.iteration_count = 1;
        state.feedback = vec![ReviewFeedback {
            reviewer_id: "security".to_string(),
            approved: false,
            concerns: vec!["date of birth stored unencrypted".to_string()],
            suggestions: vec!["encrypt at rest".to_string()],
        }];

        let update = stage.run(&state).await.unwrap();
        assert_eq!(update.iteration_count, Some(2));

        let prompts = mocks.generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("date of birth stored unencrypted"));
        assert!(prompts[0].contains("encrypt at rest"));
    }

    #[tokio::test]
    async fn test_no_work_item_is_fatal() {
        let mocks = testing::mocks(vec![]);
        let stage = draft_stage(&mocks);
        let err = stage
            .run(&ExecutionState::for_task("empty"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_malformed_artifact_exhausts_the_parse_budget() {
        let mocks = testing::mocks(vec!["nope", "still nope", "no json here"]);
        let stage = draft_stage(&mocks);
        let err = stage.run(&state_with_item()).await.unwrap_err();
        assert!(matches!(err, StageError::ParseBudgetExhausted { attempts: 3 }));
        // The correction cycle never consumed review iterations.
        assert_eq!(mocks.generator.prompts.lock().unwrap().len(), 3);
    }
}
