//! Validation stage: end-to-end checks against the preview deployment.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::Stage;
use crate::collab::Validator;
use crate::errors::{ErrorClass, StageError};
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, RunStatus, StateUpdate};

pub struct ValidateStage {
    validator: Arc<dyn Validator>,
}

impl ValidateStage {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> StageName {
        StageName::Validate
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let preview = state
            .preview_url
            .as_deref()
            .ok_or_else(|| StageError::Fatal("validation requested with no preview".into()))?;

        let files: Vec<String> = state
            .work_items
            .iter()
            .filter_map(|item| item.branch_name.clone())
            .collect();

        let report = match self.validator.run(preview, &files).await {
            Ok(report) => report,
            // A validator that cannot run is a skip, not a verdict.
            Err(err) if err.class() == ErrorClass::ExternalUnavailable => {
                warn!(error = %err, "validator unavailable, skipping");
                return Ok(StateUpdate::status(RunStatus::Skipped)
                    .with_message(format!("validation skipped: {err}")));
            }
            Err(err) => return Err(err),
        };

        if report.passed {
            info!(preview, "validation passed");
            Ok(StateUpdate::status(RunStatus::ValidationPassed)
                .with_message("end-to-end validation passed".to_string()))
        } else {
            warn!(preview, "validation failed");
            Ok(StateUpdate::status(RunStatus::Failed)
                .with_message(format!("validation failed: {}", report.diagnostics)))
        }
    }
}
