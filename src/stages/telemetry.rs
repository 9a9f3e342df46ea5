//! Post-deploy health monitor.
//!
//! Samples the error count over the configured observation window and
//! compares it to the threshold. Unreachable telemetry is reported as a
//! skip: unknown health is never treated as good health, and never as
//! grounds for a revert either.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::Stage;
use crate::collab::Telemetry;
use crate::config::Config;
use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, RunStatus, StateUpdate};

pub struct TelemetryStage {
    config: Arc<Config>,
    telemetry: Arc<dyn Telemetry>,
}

impl TelemetryStage {
    pub fn new(config: Arc<Config>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self { config, telemetry }
    }
}

#[async_trait]
impl Stage for TelemetryStage {
    fn name(&self) -> StageName {
        StageName::Telemetry
    }

    async fn run(&self, _state: &ExecutionState) -> Result<StateUpdate, StageError> {
        let window = self.config.telemetry_window;
        let threshold = self.config.error_threshold;

        let count = match self.telemetry.query_error_rate(window).await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "telemetry unreachable, health unknown");
                return Ok(StateUpdate::status(RunStatus::Skipped).with_message(format!(
                    "health check skipped, telemetry unreachable: {err}"
                )));
            }
        };

        let mut update = if count > threshold {
            warn!(count, threshold, "error spike detected");
            StateUpdate::status(RunStatus::ErrorSpike).with_message(format!(
                "error spike: {count} errors in {}s window (threshold {threshold})",
                window.as_secs()
            ))
        } else {
            info!(count, threshold, "deployment healthy");
            StateUpdate::status(RunStatus::Healthy).with_message(format!(
                "healthy: {count} errors in {}s window (threshold {threshold})",
                window.as_secs()
            ))
        };
        update.error_count = Some(count);
        Ok(update)
    }
}
