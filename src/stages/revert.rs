//! Rollback controller.
//!
//! Invoked on an error spike. If the change request is merged, its merge
//! commit is reverted on trunk and pushed, the ticket is flagged, and the
//! operator is paged. An unmerged change request means production was never
//! touched, so there is nothing to revert.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::Stage;
use crate::collab::{Alerter, IssueTracker, Severity, VersionControl, lifecycle};
use crate::collab::retry::{self, RetryPolicy};
use crate::config::Config;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, RunStatus, StateUpdate};

pub struct RevertStage {
    config: Arc<Config>,
    vcs: Arc<dyn VersionControl>,
    tracker: Arc<dyn IssueTracker>,
    alerter: Arc<dyn Alerter>,
}

impl RevertStage {
    pub fn new(
        config: Arc<Config>,
        vcs: Arc<dyn VersionControl>,
        tracker: Arc<dyn IssueTracker>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            config,
            vcs,
            tracker,
            alerter,
        }
    }
}

#[async_trait]
impl Stage for RevertStage {
    fn name(&self) -> StageName {
        StageName::Revert
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let Some(change_request) = state.change_request_ref.as_deref() else {
            return Ok(StateUpdate::status(RunStatus::Skipped)
                .with_message("no change request on record, nothing to revert".to_string()));
        };

        let policy = RetryPolicy::new(self.config.retry_attempts);
        let timeout = self.config.call_timeout;

        let merge = retry::with_retry(&policy, "vcs.merge_ref", || {
            retry::bounded(
                "vcs.merge_ref",
                timeout,
                self.vcs.merge_ref(change_request),
            )
        })
        .await?;
        let Some(merge_commit) = merge else {
            info!(change_request, "change request not merged, nothing to revert");
            return Ok(StateUpdate::status(RunStatus::Skipped)
                .with_message("change request not merged, nothing to revert".to_string()));
        };

        warn!(change_request, merge_commit, "reverting merged change");
        retry::with_retry(&policy, "vcs.revert", || {
            retry::bounded("vcs.revert", timeout, self.vcs.revert(&merge_commit))
        })
        .await?;
        retry::with_retry(&policy, "vcs.push", || {
            retry::bounded("vcs.push", timeout, self.vcs.push(&self.config.trunk))
        })
        .await?;

        let errors = state
            .error_count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let note = format!(
            "Auto-reverted merge {merge_commit} of {change_request} after an error spike \
             ({errors} errors in the observation window)."
        );
        if let Some(ticket) = &state.ticket {
            self.tracker.add_note(&ticket.id, &note).await?;
            self.tracker
                .transition(&ticket.id, lifecycle::FAILED)
                .await?;
        }
        self.alerter.notify(&note, Severity::Critical).await?;

        let mut update = StateUpdate::status(RunStatus::Reverted)
            .with_message(format!("reverted {merge_commit} on {}", self.config.trunk));
        update.merge_ref = Some(merge_commit);
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing;

    fn revert_stage(mocks: &testing::MockSet) -> RevertStage {
        RevertStage::new(
            Arc::new(Config::for_dir(std::env::temp_dir())),
            mocks.collab.vcs.clone(),
            mocks.collab.tracker.clone(),
            mocks.collab.alerter.clone(),
        )
    }

    fn spiked_state() -> ExecutionState {
        let mut state = ExecutionState::for_ticket(testing::ticket("ENG-42"));
        state.change_request_ref = Some("https://example.test/pr/7".to_string());
        state.error_count = Some(150);
        state
    }

    #[tokio::test]
    async fn test_merged_change_is_reverted_flagged_and_escalated() {
        let mocks = testing::mocks(vec![]);
        *mocks.vcs.merge_commit.lock().unwrap() = Some("abc123".to_string());
        let stage = revert_stage(&mocks);

        let update = stage.run(&spiked_state()).await.unwrap();
        assert_eq!(update.status, Some(RunStatus::Reverted));
        assert_eq!(update.merge_ref.as_deref(), Some("abc123"));

        assert_eq!(mocks.vcs.reverts.lock().unwrap().as_slice(), ["abc123"]);
        assert_eq!(mocks.vcs.pushes.lock().unwrap().as_slice(), ["main"]);

        let notes = mocks.tracker.notes.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].1.contains("150 errors"));
        let transitions = mocks.tracker.transitions.lock().unwrap();
        assert_eq!(transitions[0].1, lifecycle::FAILED);

        let alerts = mocks.alerter.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, Severity::Critical);
    }

    #[tokio::test]
    async fn test_unmerged_change_request_skips() {
        let mocks = testing::mocks(vec![]);
        let stage = revert_stage(&mocks);

        let update = stage.run(&spiked_state()).await.unwrap();
        assert_eq!(update.status, Some(RunStatus::Skipped));
        assert!(mocks.vcs.reverts.lock().unwrap().is_empty());
        assert!(mocks.alerter.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_change_request_skips() {
        let mocks = testing::mocks(vec![]);
        let stage = revert_stage(&mocks);

        let update = stage
            .run(&ExecutionState::for_task("profiles"))
            .await
            .unwrap();
        assert_eq!(update.status, Some(RunStatus::Skipped));
    }
}
