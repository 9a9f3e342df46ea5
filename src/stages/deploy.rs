//! Deployment stage: ephemeral store plus preview environment for the
//! completed stack.
//!
//! An unconfigured deployer is a skip, not a failure: the change requests
//! are already published and a human can take over from there.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::Stage;
use crate::collab::Deployer;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, RunStatus, StateUpdate};

pub struct DeployStage {
    deployer: Arc<dyn Deployer>,
}

impl DeployStage {
    pub fn new(deployer: Arc<dyn Deployer>) -> Self {
        Self { deployer }
    }
}

#[async_trait]
impl Stage for DeployStage {
    fn name(&self) -> StageName {
        StageName::Deploy
    }

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let Some(branch) = state.stack_base_reference.clone() else {
            return Ok(StateUpdate::status(RunStatus::Skipped)
                .with_message("no stack branch to deploy".to_string()));
        };

        let Some(store) = self.deployer.provision_ephemeral_store(&branch).await? else {
            return Ok(StateUpdate::status(RunStatus::Skipped)
                .with_message("store provisioning not configured, deploy skipped".to_string()));
        };

        let Some(preview) = self.deployer.deploy_preview(&branch).await? else {
            return Ok(StateUpdate::status(RunStatus::Skipped)
                .with_message("preview deployment not configured, deploy skipped".to_string()));
        };

        info!(branch, preview, "preview environment up");
        let mut update = StateUpdate::status(RunStatus::Deployed)
            .with_message(format!("deployed {branch} to {preview}"));
        update.preview_url = Some(preview);
        update.store_ref = Some(store);
        Ok(update)
    }
}
