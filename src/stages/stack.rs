//! Stack manager: select the next work item and prepare its branch.
//!
//! Branch names are deterministic, `ai/{ticket}/{kind}`, so a crashed run
//! retries onto the same branch instead of minting a duplicate. The
//! CONTRACT item branches from trunk and records itself as the stack base;
//! dependent items branch from that base. A failed item stops the stack:
//! the index never advances past it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::Stage;
use crate::collab::VersionControl;
use crate::collab::retry::{self, RetryPolicy};
use crate::config::Config;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{
    ExecutionState, RunStatus, StateUpdate, WorkItemKind, WorkItemStatus,
};

pub struct StackStage {
    config: Arc<Config>,
    vcs: Arc<dyn VersionControl>,
}

impl StackStage {
    pub fn new(config: Arc<Config>, vcs: Arc<dyn VersionControl>) -> Self {
        Self { config, vcs }
    }

    pub fn branch_name(state: &ExecutionState, kind: WorkItemKind) -> String {
        format!("ai/{}/{}", state.checkpoint_key(), kind.slug())
    }
}

#[async_trait]
impl Stage for StackStage {
    fn name(&self) -> StageName {
        StageName::Stack
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let index = state.current_work_index;
        let Some(item) = state.current_work_item() else {
            info!(items = state.work_items.len(), "all work items completed");
            return Ok(StateUpdate::status(RunStatus::StackComplete)
                .with_message("stack complete".to_string()));
        };

        // A failed item is never silently reprocessed.
        if item.status == WorkItemStatus::Failed {
            return Err(StageError::MissingPrerequisite {
                index,
                message: format!("work item '{}' already failed", item.title),
            });
        }

        let base = match item.kind {
            WorkItemKind::Contract => self.config.trunk.clone(),
            WorkItemKind::Backend | WorkItemKind::Frontend => state
                .stack_base_reference
                .clone()
                .ok_or_else(|| StageError::MissingPrerequisite {
                    index,
                    message: "contract branch not recorded for dependent item".to_string(),
                })?,
        };
        let branch = Self::branch_name(state, item.kind);

        let policy = RetryPolicy::new(self.config.retry_attempts);
        let created = retry::with_retry(&policy, "vcs.create_branch", || {
            retry::bounded(
                "vcs.create_branch",
                self.config.call_timeout,
                self.vcs.create_branch(&branch, &base),
            )
        })
        .await;

        let mut items = state.work_items.clone();
        if let Err(err) = created {
            warn!(branch, base, error = %err, "branch creation failed, item marked failed");
            items[index].status = WorkItemStatus::Failed;
            let mut update = StateUpdate::status(RunStatus::Failed).with_message(format!(
                "could not create branch '{branch}' from '{base}': {err}"
            ));
            update.work_items = Some(items);
            return Ok(update);
        }

        info!(item = %items[index].title, branch, base, "work item selected");
        let fresh = items[index].status == WorkItemStatus::Pending;
        items[index].status = WorkItemStatus::InProgress;
        items[index].branch_name = Some(branch.clone());

        let mut update = StateUpdate::status(RunStatus::Working)
            .with_message(format!("working '{}' on {branch}", items[index].title));
        if items[index].kind == WorkItemKind::Contract {
            update.stack_base_reference = Some(branch);
        }
        // The iteration budget is per item; it resets only when the item is
        // newly selected, not on a crash retry mid-item.
        if fresh {
            update.iteration_count = Some(0);
        }
        update.work_items = Some(items);
        Ok(update)
    }
}
