//! The run loop.
//!
//! The engine walks the task graph one stage at a time: run the handler,
//! merge its update into the shared state, look up the next stage from the
//! routing table, checkpoint, repeat. A handler error never propagates
//! raw — it is recorded as a fault on the state and routed to the recovery
//! stage. A global step ceiling bounds every run regardless of routing.

use chrono::Utc;
use std::str::FromStr;
use tracing::{info, warn};

use super::builder::{StageName, Target, TaskGraph};
use crate::errors::{EngineError, StageError};
use crate::state::store::CheckpointStore;
use crate::state::{ExecutionState, RunStatus, StageFault, StateUpdate};

pub struct Engine {
    graph: TaskGraph,
    store: CheckpointStore,
    step_ceiling: u32,
}

impl Engine {
    pub fn new(graph: TaskGraph, store: CheckpointStore, step_ceiling: u32) -> Self {
        Self {
            graph,
            store,
            step_ceiling,
        }
    }

    /// Drive a run to its end, resuming from a checkpoint when one exists
    /// for the same key.
    pub async fn run(&self, initial: ExecutionState) -> Result<ExecutionState, EngineError> {
        let key = initial.checkpoint_key();
        let (mut state, mut current) = self.starting_point(&key, initial)?;

        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > self.step_ceiling {
                self.store
                    .save(&key, &state, Some(current.as_str()))
                    .map_err(EngineError::Checkpoint)?;
                return Err(EngineError::StepCeilingExceeded {
                    ceiling: self.step_ceiling,
                });
            }

            let stage = self
                .graph
                .stage(current)
                .ok_or_else(|| EngineError::UnknownStage(current.to_string()))?;
            info!(stage = %current, status = %state.status, step = steps, "entering stage");

            let update = match stage.run(&state).await {
                Ok(update) => update,
                Err(err) => self.fault_update(current, &err),
            };
            state.apply(update);

            let target = if state.status == RunStatus::Error {
                Target::Stage(StageName::Recover)
            } else {
                self.graph.next(current, state.status).ok_or_else(|| {
                    EngineError::MissingRoute {
                        stage: current.to_string(),
                        status: state.status.to_string(),
                    }
                })?
            };

            match target {
                Target::End => {
                    finalize(&mut state);
                    self.store
                        .save(&key, &state, None)
                        .map_err(EngineError::Checkpoint)?;
                    self.store.archive(&key).map_err(EngineError::Checkpoint)?;
                    info!(status = %state.status, steps, "run finished");
                    return Ok(state);
                }
                Target::Stage(next) => {
                    self.store
                        .save(&key, &state, Some(next.as_str()))
                        .map_err(EngineError::Checkpoint)?;
                    current = next;
                }
            }
        }
    }

    /// Resume from a pending checkpoint when one exists, otherwise start
    /// fresh at the entry stage.
    fn starting_point(
        &self,
        key: &str,
        initial: ExecutionState,
    ) -> Result<(ExecutionState, StageName), EngineError> {
        if let Some(checkpoint) = self.store.load(key).map_err(EngineError::Checkpoint)?
            && let Some(pending) = checkpoint.pending_stage.as_deref()
            && !checkpoint.state.status.is_terminal()
        {
            let stage = StageName::from_str(pending)
                .map_err(|_| EngineError::UnknownStage(pending.to_string()))?;
            info!(key, stage = %stage, "resuming from checkpoint");
            return Ok((checkpoint.state, stage));
        }
        Ok((initial, self.graph.entry()))
    }

    /// Record a handler failure on the state instead of propagating it. The
    /// recovery stage consumes the fault; a failure inside recovery itself
    /// ends the run.
    fn fault_update(&self, stage: StageName, err: &StageError) -> StateUpdate {
        warn!(stage = %stage, class = %err.class(), error = %err, "stage failed");
        if stage == StageName::Recover {
            return StateUpdate::status(RunStatus::Failed)
                .with_message(format!("recovery stage failed: {err}"));
        }
        let mut update = StateUpdate::status(RunStatus::Error)
            .with_message(format!("stage '{stage}' failed: {err}"));
        update.last_fault = Some(StageFault {
            stage: stage.to_string(),
            class: err.class(),
            message: err.to_string(),
            at: Utc::now(),
        });
        update
    }
}

/// Terminal bookkeeping applied once a route reaches `End`. A run that
/// leaves its final stage `Healthy` is complete; `Skipped` and the terminal
/// statuses pass through unchanged.
fn finalize(state: &mut ExecutionState) {
    if state.status == RunStatus::Healthy {
        state.apply(
            StateUpdate::status(RunStatus::Complete)
                .with_message("deployment observed healthy, run complete".to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::GraphBuilder;
    use crate::stages::Stage;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    /// Stage that emits a fixed status, counting invocations.
    struct FixedStage {
        name: StageName,
        emits: RunStatus,
        calls: Arc<AtomicU32>,
    }

    impl FixedStage {
        fn new(name: StageName, emits: RunStatus) -> (Arc<dyn Stage>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Arc::new(Self {
                    name,
                    emits,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl Stage for FixedStage {
        fn name(&self) -> StageName {
            self.name
        }

        async fn run(&self, _state: &ExecutionState) -> Result<StateUpdate, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StateUpdate::status(self.emits))
        }
    }

    struct FailingStage {
        name: StageName,
    }

    #[async_trait]
    impl Stage for FailingStage {
        fn name(&self) -> StageName {
            self.name
        }

        async fn run(&self, _state: &ExecutionState) -> Result<StateUpdate, StageError> {
            Err(StageError::Fatal("boom".into()))
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path().join("state"))
    }

    #[tokio::test]
    async fn test_linear_walk_to_end() {
        let dir = tempdir().unwrap();
        let (plan, plan_calls) = FixedStage::new(StageName::Plan, RunStatus::Planned);
        let (stack, stack_calls) = FixedStage::new(StageName::Stack, RunStatus::StackComplete);
        let graph = GraphBuilder::new()
            .stage(plan)
            .stage(stack)
            .entry(StageName::Plan)
            .route(
                StageName::Plan,
                RunStatus::Planned,
                Target::Stage(StageName::Stack),
            )
            .route(StageName::Stack, RunStatus::StackComplete, Target::End)
            .build()
            .unwrap();

        let engine = Engine::new(graph, store_in(&dir), 10);
        let state = engine.run(ExecutionState::for_task("t")).await.unwrap();
        assert_eq!(state.status, RunStatus::StackComplete);
        assert_eq!(plan_calls.load(Ordering::SeqCst), 1);
        assert_eq!(stack_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stage_error_routes_to_recovery() {
        let dir = tempdir().unwrap();
        let (recover, recover_calls) = FixedStage::new(StageName::Recover, RunStatus::Failed);
        let graph = GraphBuilder::new()
            .stage(Arc::new(FailingStage {
                name: StageName::Plan,
            }))
            .stage(recover)
            .entry(StageName::Plan)
            .route(StageName::Recover, RunStatus::Failed, Target::End)
            .build()
            .unwrap();

        let engine = Engine::new(graph, store_in(&dir), 10);
        let state = engine.run(ExecutionState::for_task("t")).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(recover_calls.load(Ordering::SeqCst), 1);
        let fault = state.last_fault.unwrap();
        assert_eq!(fault.stage, "plan");
        assert!(fault.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_failure_inside_recovery_ends_the_run() {
        let dir = tempdir().unwrap();
        let graph = GraphBuilder::new()
            .stage(Arc::new(FailingStage {
                name: StageName::Plan,
            }))
            .stage(Arc::new(FailingStage {
                name: StageName::Recover,
            }))
            .entry(StageName::Plan)
            .route(StageName::Recover, RunStatus::Failed, Target::End)
            .build()
            .unwrap();

        let engine = Engine::new(graph, store_in(&dir), 10);
        let state = engine.run(ExecutionState::for_task("t")).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_ceiling_stops_cyclic_routing() {
        let dir = tempdir().unwrap();
        let (plan, calls) = FixedStage::new(StageName::Plan, RunStatus::Planned);
        let graph = GraphBuilder::new()
            .stage(plan)
            .entry(StageName::Plan)
            .route(
                StageName::Plan,
                RunStatus::Planned,
                Target::Stage(StageName::Plan),
            )
            .build()
            .unwrap();

        let engine = Engine::new(graph, store_in(&dir), 7);
        let result = engine.run(ExecutionState::for_task("t")).await;
        assert!(matches!(
            result,
            Err(EngineError::StepCeilingExceeded { ceiling: 7 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_missing_route_is_an_engine_error() {
        let dir = tempdir().unwrap();
        let (plan, _) = FixedStage::new(StageName::Plan, RunStatus::Planned);
        let graph = GraphBuilder::new()
            .stage(plan)
            .entry(StageName::Plan)
            .build()
            .unwrap();

        let engine = Engine::new(graph, store_in(&dir), 10);
        let result = engine.run(ExecutionState::for_task("t")).await;
        assert!(matches!(result, Err(EngineError::MissingRoute { .. })));
    }

    #[tokio::test]
    async fn test_healthy_finalizes_to_complete() {
        let dir = tempdir().unwrap();
        let (telemetry, _) = FixedStage::new(StageName::Telemetry, RunStatus::Healthy);
        let graph = GraphBuilder::new()
            .stage(telemetry)
            .entry(StageName::Telemetry)
            .route(StageName::Telemetry, RunStatus::Healthy, Target::End)
            .build()
            .unwrap();

        let engine = Engine::new(graph, store_in(&dir), 10);
        let state = engine.run(ExecutionState::for_task("t")).await.unwrap();
        assert_eq!(state.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_stages() {
        let dir = tempdir().unwrap();
        let (plan, plan_calls) = FixedStage::new(StageName::Plan, RunStatus::Planned);
        let (stack, stack_calls) = FixedStage::new(StageName::Stack, RunStatus::StackComplete);
        let graph = GraphBuilder::new()
            .stage(plan)
            .stage(stack)
            .entry(StageName::Plan)
            .route(
                StageName::Plan,
                RunStatus::Planned,
                Target::Stage(StageName::Stack),
            )
            .route(StageName::Stack, RunStatus::StackComplete, Target::End)
            .build()
            .unwrap();

        // A previous process checkpointed with the stack stage pending.
        let store = store_in(&dir);
        let mut state = ExecutionState::for_task("t");
        state.apply(StateUpdate::status(RunStatus::Planned));
        store.save(&state.checkpoint_key(), &state, Some("stack")).unwrap();

        let engine = Engine::new(graph, store_in(&dir), 10);
        let result = engine.run(ExecutionState::for_task("t")).await.unwrap();
        assert_eq!(result.status, RunStatus::StackComplete);
        assert_eq!(plan_calls.load(Ordering::SeqCst), 0);
        assert_eq!(stack_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_run_archives_its_checkpoint() {
        let dir = tempdir().unwrap();
        let (plan, _) = FixedStage::new(StageName::Plan, RunStatus::Failed);
        let graph = GraphBuilder::new()
            .stage(plan)
            .entry(StageName::Plan)
            .route(StageName::Plan, RunStatus::Failed, Target::End)
            .build()
            .unwrap();

        let engine = Engine::new(graph, store_in(&dir), 10);
        engine.run(ExecutionState::for_task("t")).await.unwrap();

        let store = store_in(&dir);
        assert!(store.load("task").unwrap().is_none());
    }
}
