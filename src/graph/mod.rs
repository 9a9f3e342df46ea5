//! Task graph: construction, routing, and the run loop.

pub mod builder;
pub mod engine;

use std::sync::Arc;

use builder::{GraphBuilder, GraphError, StageName, Target, TaskGraph};

use crate::collab::Collaborators;
use crate::config::Config;
use crate::stages;
use crate::state::RunStatus;

/// Wire up the full delivery pipeline.
///
/// Plan the stack, then per work item draft / review / supervise until
/// approved or out of iterations, publish, and advance. Once the stack is
/// complete: deploy a preview, validate, watch telemetry, and revert on an
/// error spike. Handler failures route to the recovery stage via the
/// engine, which is why `recover` carries no inbound routes here.
pub fn standard_graph(
    config: Arc<Config>,
    collab: &Collaborators,
) -> Result<TaskGraph, GraphError> {
    use RunStatus::*;
    use Target::{End, Stage};

    GraphBuilder::new()
        .stage(Arc::new(stages::plan::PlanStage::new(
            config.clone(),
            collab.generator.clone(),
        )))
        .stage(Arc::new(stages::stack::StackStage::new(
            config.clone(),
            collab.vcs.clone(),
        )))
        .stage(Arc::new(stages::draft::DraftStage::new(
            config.clone(),
            collab.generator.clone(),
        )))
        .stage(Arc::new(stages::review::BoardStage::new(
            config.clone(),
            collab.generator.clone(),
            collab.tracker.clone(),
        )))
        .stage(Arc::new(stages::review::SuperviseStage::new(config.clone())))
        .stage(Arc::new(stages::publish::PublishStage::new(
            config.clone(),
            collab.vcs.clone(),
            collab.tracker.clone(),
        )))
        .stage(Arc::new(stages::deploy::DeployStage::new(
            collab.deployer.clone(),
        )))
        .stage(Arc::new(stages::validate::ValidateStage::new(
            collab.validator.clone(),
        )))
        .stage(Arc::new(stages::telemetry::TelemetryStage::new(
            config.clone(),
            collab.telemetry.clone(),
        )))
        .stage(Arc::new(stages::revert::RevertStage::new(
            config,
            collab.vcs.clone(),
            collab.tracker.clone(),
            collab.alerter.clone(),
        )))
        .stage(Arc::new(stages::recover::RecoverStage::new(
            collab.tracker.clone(),
            collab.alerter.clone(),
        )))
        .entry(StageName::Plan)
        .route(StageName::Plan, Planned, Stage(StageName::Stack))
        .route(StageName::Stack, Working, Stage(StageName::Draft))
        .route(StageName::Stack, StackComplete, Stage(StageName::Deploy))
        .route(StageName::Stack, Failed, End)
        .route(StageName::Draft, Reviewing, Stage(StageName::Review))
        .route(StageName::Review, Reviewing, Stage(StageName::Supervise))
        .route(StageName::Supervise, Approved, Stage(StageName::Publish))
        .route(StageName::Supervise, Drafting, Stage(StageName::Draft))
        .route(StageName::Supervise, Failed, End)
        .route(StageName::Publish, Published, Stage(StageName::Stack))
        .route(StageName::Deploy, Deployed, Stage(StageName::Validate))
        .route(StageName::Deploy, Skipped, End)
        .route(StageName::Validate, ValidationPassed, Stage(StageName::Telemetry))
        .route(StageName::Validate, Skipped, End)
        .route(StageName::Validate, Failed, End)
        .route(StageName::Telemetry, Healthy, End)
        .route(StageName::Telemetry, Skipped, End)
        .route(StageName::Telemetry, ErrorSpike, Stage(StageName::Revert))
        .route(StageName::Revert, Reverted, End)
        .route(StageName::Revert, Skipped, End)
        .route(StageName::Recover, Failed, End)
        .build()
}
