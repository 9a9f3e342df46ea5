//! Planning stage: decompose a task into a dependency-ordered work item
//! stack.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::Stage;
use crate::collab::Generator;
use crate::collab::retry::{self, RetryPolicy};
use crate::config::Config;
use crate::decode;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{
    ExecutionState, RunStatus, StateUpdate, WorkItem, WorkItemKind, validate_stack,
};

const PLAN_PROMPT: &str = r#"You are planning a full-stack feature as a stack of work items.

Task:
{task}

Decompose the task into work items of three kinds:
- CONTRACT: the data schema and API contract the rest builds on
- BACKEND: server-side implementation of the contract
- FRONTEND: user interface consuming the contract

Order items so every BACKEND and FRONTEND item comes after the CONTRACT
item it builds on. Respond with JSON only:

{"work_items": [
  {"type": "CONTRACT", "title": "...", "description": "...",
   "acceptance_criteria": ["..."]}
]}
"#;

#[derive(Debug, Deserialize)]
struct PlannedItem {
    #[serde(rename = "type")]
    kind: WorkItemKind,
    title: String,
    description: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    work_items: Vec<PlannedItem>,
}

pub struct PlanStage {
    config: Arc<Config>,
    generator: Arc<dyn Generator>,
}

impl PlanStage {
    pub fn new(config: Arc<Config>, generator: Arc<dyn Generator>) -> Self {
        Self { config, generator }
    }

    /// Wire planned items into a validated stack: each non-CONTRACT item
    /// depends on the closest CONTRACT item before it.
    fn into_stack(&self, planned: Vec<PlannedItem>) -> Result<Vec<WorkItem>, String> {
        let mut items = Vec::with_capacity(planned.len());
        let mut last_contract: Option<usize> = None;
        for (index, p) in planned.into_iter().enumerate() {
            let mut item = WorkItem::new(p.kind, &p.title, &p.description);
            item.acceptance_criteria = p.acceptance_criteria;
            match p.kind {
                WorkItemKind::Contract => last_contract = Some(index),
                WorkItemKind::Backend | WorkItemKind::Frontend => {
                    if let Some(dep) = last_contract {
                        item = item.with_depends_on(dep);
                    }
                }
            }
            items.push(item);
        }
        validate_stack(&items)?;
        Ok(items)
    }
}

#[async_trait]
impl Stage for PlanStage {
    fn name(&self) -> StageName {
        StageName::Plan
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        // A resumed run that already planned keeps its stack.
        if !state.work_items.is_empty() {
            debug!("stack already planned, skipping");
            return Ok(StateUpdate::status(RunStatus::Planned));
        }

        let policy = RetryPolicy::new(self.config.retry_attempts);
        let mut prompt = PLAN_PROMPT.replace("{task}", &state.task_description);

        for attempt in 1..=self.config.parse_attempts {
            let response = retry::with_retry(&policy, "generator.invoke", || {
                retry::bounded(
                    "generator.invoke",
                    self.config.call_timeout,
                    self.generator.invoke(&prompt),
                )
            })
            .await?;

            let problem = match decode::extract::<PlanResponse>(&response, "work item plan") {
                Ok(plan) => match self.into_stack(plan.work_items) {
                    Ok(items) => {
                        info!(items = items.len(), "stack planned");
                        let mut update = StateUpdate::status(RunStatus::Planned)
                            .with_message(format!("planned {} work items", items.len()));
                        update.work_items = Some(items);
                        update.current_work_index = Some(0);
                        return Ok(update);
                    }
                    Err(reason) => reason,
                },
                Err(err) => err.to_string(),
            };

            debug!(attempt, problem, "plan response rejected, asking for a correction");
            prompt = format!(
                "{prompt}\n\nYour previous response was rejected: {problem}\n\
                 Respond again with valid JSON in the shape shown above."
            );
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

    fn plan_stage(mocks: &testing::MockSet) -> PlanStage {
        let dir = std::env::temp_dir();
        PlanStage::new(Arc::new(Config::for_dir(dir)), mocks.collab.generator.clone())
    }

    const GOOD_PLAN: &str = r#"{"work_items": [
        {"type": "CONTRACT", "title": "Profile schema", "description": "d",
         "acceptance_criteria": ["validates dob"]},
        {"type": "BACKEND", "title": "Profile API", "description": "d"},
        {"type": "FRONTEND", "title": "Profile form", "description": "d"}
    ]}"#;

    #[tokio::test]
    async fn test_plan_produces_a_validated_stack() {
        let mocks = testing::mocks(vec![GOOD_PLAN]);
        let stage = plan_stage(&mocks);
        let update = stage.run(&ExecutionState::for_task("profiles")).await.unwrap();

        assert_eq!(update.status, Some(RunStatus::Planned));
        let items = update.work_items.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].kind, WorkItemKind::Contract);
        assert_eq!(items[1].depends_on, Some(0));
        assert_eq!(items[2].depends_on, Some(0));
        assert_eq!(update.current_work_index, Some(0));
    }

    #[tokio::test]
    async fn test_malformed_plan_gets_a_bounded_correction_cycle() {
        let mocks = testing::mocks(vec!["not json at all", GOOD_PLAN]);
        let stage = plan_stage(&mocks);
        let update = stage.run(&ExecutionState::for_task("profiles")).await.unwrap();

        assert_eq!(update.status, Some(RunStatus::Planned));
        let prompts = mocks.generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("previous response was rejected"));
    }

    #[tokio::test]
    async fn test_parse_budget_exhaustion_is_an_error() {
        let mocks = testing::mocks(vec!["junk", "junk", "junk"]);
        let stage = plan_stage(&mocks);
        let err = stage.run(&ExecutionState::for_task("profiles")).await.unwrap_err();
        assert!(matches!(err, StageError::ParseBudgetExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_stack_without_contract_dependency_is_rejected() {
        // BACKEND before any CONTRACT cannot be wired to a dependency.
        let bad = r#"{"work_items": [
            {"type": "BACKEND", "title": "API first", "description": "d"}
        ]}"#;
        let mocks = testing::mocks(vec![bad, bad, bad]);
        let stage = plan_stage(&mocks);
        let err = stage.run(&ExecutionState::for_task("profiles")).await.unwrap_err();
        assert!(matches!(err, StageError::ParseBudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn test_already_planned_state_is_not_replanned() {
        let mocks = testing::mocks(vec![]);
        let stage = plan_stage(&mocks);
        let mut state = ExecutionState::for_task("profiles");
        state.work_items = vec![WorkItem::new(WorkItemKind::Contract, "schema", "d")];

        let update = stage.run(&state).await.unwrap();
        assert_eq!(update.status, Some(RunStatus::Planned));
        assert!(mocks.generator.prompts.lock().unwrap().is_empty());
    }
}
