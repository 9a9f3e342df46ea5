//! Publisher: commit the approved artifact, push the branch, open a change
//! request, and advance the stack.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use super::Stage;
use crate::collab::{IssueTracker, VersionControl};
use crate::collab::retry::{self, RetryPolicy};
use crate::config::Config;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, RunStatus, StateUpdate, WorkItemKind, WorkItemStatus};

pub struct PublishStage {
    config: Arc<Config>,
    vcs: Arc<dyn VersionControl>,
    tracker: Arc<dyn IssueTracker>,
}

impl PublishStage {
    pub fn new(
        config: Arc<Config>,
        vcs: Arc<dyn VersionControl>,
        tracker: Arc<dyn IssueTracker>,
    ) -> Self {
        Self {
            config,
            vcs,
            tracker,
        }
    }

    fn change_request_body(&self, state: &ExecutionState) -> String {
        let item = state.current_work_item();
        let mut body = String::new();
        if let Some(item) = item {
            let _ = writeln!(body, "{}\n", item.description);
            if !item.acceptance_criteria.is_empty() {
                let _ = writeln!(body, "Acceptance criteria:");
                for criterion in &item.acceptance_criteria {
                    let _ = writeln!(body, "- {criterion}");
                }
                let _ = writeln!(body);
            }
        }
        let approvals: Vec<_> = state
            .feedback
            .iter()
            .filter(|f| f.approved)
            .map(|f| f.reviewer_id.as_str())
            .collect();
        if !approvals.is_empty() {
            let _ = writeln!(body, "Approved by: {}", approvals.join(", "));
        }
        if let Some(ticket) = &state.ticket {
            let _ = writeln!(body, "Ticket: {}", ticket.identifier);
        }
        body
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> StageName {
        StageName::Publish
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let index = state.current_work_index;
        let item = state
            .current_work_item()
            .ok_or_else(|| StageError::Fatal("publishing with no work item selected".into()))?;
        let branch = item.branch_name.clone().ok_or_else(|| {
            StageError::MissingPrerequisite {
                index,
                message: "work item has no branch to publish".to_string(),
            }
        })?;
        let base = match item.kind {
            WorkItemKind::Contract => self.config.trunk.clone(),
            WorkItemKind::Backend | WorkItemKind::Frontend => state
                .stack_base_reference
                .clone()
                .unwrap_or_else(|| self.config.trunk.clone()),
        };

        let policy = RetryPolicy::new(self.config.retry_attempts);
        let timeout = self.config.call_timeout;

        let commit_message = format!("feat: {}", item.title);
        retry::with_retry(&policy, "vcs.commit", || {
            retry::bounded("vcs.commit", timeout, self.vcs.commit(&commit_message, &[]))
        })
        .await?;
        retry::with_retry(&policy, "vcs.push", || {
            retry::bounded("vcs.push", timeout, self.vcs.push(&branch))
        })
        .await?;

        let title = format!("[{}] {}", item.kind, item.title);
        let body = self.change_request_body(state);
        let url = retry::with_retry(&policy, "vcs.open_change_request", || {
            retry::bounded(
                "vcs.open_change_request",
                timeout,
                self.vcs.open_change_request(&title, &body, &base),
            )
        })
        .await?;
        info!(branch, url, "change request opened");

        if let Some(ticket) = &state.ticket {
            self.tracker
                .add_note(&ticket.id, &format!("Change request ready: {url}"))
                .await?;
        }

        let mut items = state.work_items.clone();
        items[index].status = WorkItemStatus::Completed;
        items[index].change_request_ref = Some(url.clone());

        let mut update = StateUpdate::status(RunStatus::Published)
            .with_message(format!("published '{}' as {url}", items[index].title));
        update.work_items = Some(items);
        update.current_work_index = Some(index + 1);
        update.change_request_ref = Some(url);
        // The next item starts its review history from scratch.
        update.clear_feedback = true;
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing;
    use crate::state::{ReviewFeedback, WorkItem};

    fn publish_stage(mocks: &testing::MockSet) -> PublishStage {
        PublishStage::new(
            Arc::new(Config::for_dir(std::env::temp_dir())),
            mocks.collab.vcs.clone(),
            mocks.collab.tracker.clone(),
        )
    }

    fn approved_state() -> ExecutionState {
        let mut state = ExecutionState::for_ticket(testing::ticket("ENG-42"));
        let mut item = WorkItem::new(WorkItemKind::Contract, "Profile schema", "d");
        item.branch_name = Some("ai/eng-42/contract".to_string());
        item.status = WorkItemStatus::InProgress;
        state.work_items = vec![
            item,
            WorkItem::new(WorkItemKind::Backend, "Profile API", "d").with_depends_on(0),
        ];
        state.stack_base_reference = Some("ai/eng-42/contract".to_string());
        state.current_artifact = Some("{\"entities\": []}".to_string());
        state.feedback = vec![ReviewFeedback {
            reviewer_id: "security".to_string(),
            approved: true,
            concerns: vec![],
            suggestions: vec![],
        }];
        state
    }

    #[tokio::test]
    async fn test_publish_commits_pushes_and_opens_a_change_request() {
        let mocks = testing::mocks(vec![]);
        let stage = publish_stage(&mocks);
        let update = stage.run(&approved_state()).await.unwrap();

        assert_eq!(update.status, Some(RunStatus::Published));
        assert_eq!(mocks.vcs.commits.lock().unwrap()[0], "feat: Profile schema");
        assert_eq!(mocks.vcs.pushes.lock().unwrap()[0], "ai/eng-42/contract");
        // CONTRACT change requests target trunk.
        assert_eq!(mocks.vcs.change_requests.lock().unwrap()[0].1, "main");

        let items = update.work_items.unwrap();
        assert_eq!(items[0].status, WorkItemStatus::Completed);
        assert!(items[0].change_request_ref.is_some());
        assert_eq!(update.current_work_index, Some(1));
        assert!(update.clear_feedback);
    }

    #[tokio::test]
    async fn test_dependent_change_request_targets_the_stack_base() {
        let mocks = testing::mocks(vec![]);
        let stage = publish_stage(&mocks);
        let mut state = approved_state();
        state.work_items[0].status = WorkItemStatus::Completed;
        state.work_items[1].status = WorkItemStatus::InProgress;
        state.work_items[1].branch_name = Some("ai/eng-42/backend".to_string());
        state.current_work_index = 1;

        stage.run(&state).await.unwrap();
        assert_eq!(
            mocks.vcs.change_requests.lock().unwrap()[0].1,
            "ai/eng-42/contract"
        );
    }

    #[tokio::test]
    async fn test_ticket_gets_a_note_with_the_change_request() {
        let mocks = testing::mocks(vec![]);
        let stage = publish_stage(&mocks);
        stage.run(&approved_state()).await.unwrap();

        let notes = mocks.tracker.notes.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].1.contains("Change request ready"));
    }

    #[tokio::test]
    async fn test_publish_without_branch_is_a_dependency_error() {
        let mocks = testing::mocks(vec![]);
        let stage = publish_stage(&mocks);
        let mut state = approved_state();
        state.work_items[0].branch_name = None;

        let err = stage.run(&state).await.unwrap_err();
        assert!(matches!(err, StageError::MissingPrerequisite { index: 0, .. }));
    }
}
