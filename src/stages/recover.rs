//! Recovery stage: the engine routes every handler fault here.
//!
//! The fault is reported on the ticket, the ticket is parked in the failed
//! state, and the operator is paged for the classes that warrant it. The
//! run then ends `Failed`; a human decides what happens next.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::Stage;
use crate::collab::{Alerter, IssueTracker, Severity, lifecycle};
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, RunStatus, StateUpdate};

pub struct RecoverStage {
    tracker: Arc<dyn IssueTracker>,
    alerter: Arc<dyn Alerter>,
}

impl RecoverStage {
    pub fn new(tracker: Arc<dyn IssueTracker>, alerter: Arc<dyn Alerter>) -> Self {
        Self { tracker, alerter }
    }
}

#[async_trait]
impl Stage for RecoverStage {
    fn name(&self) -> StageName {
        StageName::Recover
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let Some(fault) = state.last_fault.clone() else {
            warn!("recovery entered without a recorded fault");
            return Ok(StateUpdate::status(RunStatus::Failed)
                .with_message("run failed with no recorded fault".to_string()));
        };
        warn!(stage = fault.stage, class = %fault.class, "recovering from stage fault");

        let note = format!(
            "Run halted in stage '{}' ({} error): {}",
            fault.stage, fault.class, fault.message
        );
        if let Some(ticket) = &state.ticket {
            // Reporting is best-effort; losing a note must not mask the
            // original fault.
            if let Err(err) = self.tracker.add_note(&ticket.id, &note).await {
                warn!(error = %err, "could not post fault note");
            }
            if let Err(err) = self.tracker.transition(&ticket.id, lifecycle::FAILED).await {
                warn!(error = %err, "could not park ticket as failed");
            }
        }
        if fault.class.alerts_operator()
            && let Err(err) = self.alerter.notify(&note, Severity::Critical).await
        {
            warn!(error = %err, "could not page operator");
        }

        Ok(StateUpdate::status(RunStatus::Failed).with_message(note))
    }
}
