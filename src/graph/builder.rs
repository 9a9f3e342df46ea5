//! Task graph construction.
//!
//! A graph is a set of named stage handlers plus a routing table keyed by
//! `(stage, status)`. Everything is validated at build time: an unknown
//! entry stage, a route from or to an unregistered stage, or a duplicate
//! registration fails `build()` instead of surfacing mid-run.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::stages::Stage;
use crate::state::RunStatus;

/// Closed set of stage names. Routing is validated against this set, so a
/// typo cannot silently halt a run the way a string-keyed table would.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    Plan,
    Stack,
    Draft,
    Review,
    Supervise,
    Publish,
    Deploy,
    Validate,
    Telemetry,
    Revert,
    Recover,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Stack => "stack",
            Self::Draft => "draft",
            Self::Review => "review",
            Self::Supervise => "supervise",
            Self::Publish => "publish",
            Self::Deploy => "deploy",
            Self::Validate => "validate",
            Self::Telemetry => "telemetry",
            Self::Revert => "revert",
            Self::Recover => "recover",
        }
    }

    pub const ALL: [StageName; 11] = [
        Self::Plan,
        Self::Stack,
        Self::Draft,
        Self::Review,
        Self::Supervise,
        Self::Publish,
        Self::Deploy,
        Self::Validate,
        Self::Telemetry,
        Self::Revert,
        Self::Recover,
    ];
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("unknown stage name: {s}"))
    }
}

/// Where a route leads: another stage, or the end of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Stage(StageName),
    End,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no entry stage set")]
    NoEntry,

    #[error("stage '{0}' registered twice")]
    DuplicateStage(StageName),

    #[error("stage '{0}' referenced by a route but never registered")]
    UnregisteredStage(StageName),

    #[error("entry stage '{0}' is not registered")]
    UnregisteredEntry(StageName),
}

pub struct GraphBuilder {
    stages: HashMap<StageName, Arc<dyn Stage>>,
    routes: HashMap<(StageName, RunStatus), Target>,
    entry: Option<StageName>,
    duplicate: Option<StageName>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
            routes: HashMap::new(),
            entry: None,
            duplicate: None,
        }
    }

    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        let name = stage.name();
        if self.stages.insert(name, stage).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(name);
        }
        self
    }

    pub fn entry(mut self, name: StageName) -> Self {
        self.entry = Some(name);
        self
    }

    pub fn route(mut self, from: StageName, on: RunStatus, to: Target) -> Self {
        self.routes.insert((from, on), to);
        self
    }

    pub fn build(self) -> Result<TaskGraph, GraphError> {
        if let Some(name) = self.duplicate {
            return Err(GraphError::DuplicateStage(name));
        }
        let entry = self.entry.ok_or(GraphError::NoEntry)?;
        if !self.stages.contains_key(&entry) {
            return Err(GraphError::UnregisteredEntry(entry));
        }
        for ((from, _), to) in &self.routes {
            if !self.stages.contains_key(from) {
                return Err(GraphError::UnregisteredStage(*from));
            }
            if let Target::Stage(name) = to
                && !self.stages.contains_key(name)
            {
                return Err(GraphError::UnregisteredStage(*name));
            }
        }
        Ok(TaskGraph {
            stages: self.stages,
            routes: self.routes,
            entry,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated, immutable task graph.
pub struct TaskGraph {
    stages: HashMap<StageName, Arc<dyn Stage>>,
    routes: HashMap<(StageName, RunStatus), Target>,
    entry: StageName,
}

impl TaskGraph {
    pub fn entry(&self) -> StageName {
        self.entry
    }

    pub fn stage(&self, name: StageName) -> Option<&Arc<dyn Stage>> {
        self.stages.get(&name)
    }

    pub fn next(&self, from: StageName, on: RunStatus) -> Option<Target> {
        self.routes.get(&(from, on)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageError;
    use crate::state::{ExecutionState, StateUpdate};
    use async_trait::async_trait;

    struct NoopStage(StageName);

    #[async_trait]
    impl Stage for NoopStage {
        fn name(&self) -> StageName {
            self.0
        }

        async fn run(&self, _state: &ExecutionState) -> Result<StateUpdate, StageError> {
            Ok(StateUpdate::default())
        }
    }

    fn noop(name: StageName) -> Arc<dyn Stage> {
        Arc::new(NoopStage(name))
    }

    #[test]
    fn test_build_validates_entry_is_registered() {
        let result = GraphBuilder::new()
            .stage(noop(StageName::Plan))
            .entry(StageName::Stack)
            .build();
        assert!(matches!(result, Err(GraphError::UnregisteredEntry(StageName::Stack))));
    }

    #[test]
    fn test_build_rejects_route_to_unregistered_stage() {
        let result = GraphBuilder::new()
            .stage(noop(StageName::Plan))
            .entry(StageName::Plan)
            .route(
                StageName::Plan,
                RunStatus::Planned,
                Target::Stage(StageName::Stack),
            )
            .build();
        assert!(matches!(result, Err(GraphError::UnregisteredStage(StageName::Stack))));
    }

    #[test]
    fn test_build_rejects_duplicate_registration() {
        let result = GraphBuilder::new()
            .stage(noop(StageName::Plan))
            .stage(noop(StageName::Plan))
            .entry(StageName::Plan)
            .build();
        assert!(matches!(result, Err(GraphError::DuplicateStage(StageName::Plan))));
    }

    #[test]
    fn test_build_requires_an_entry() {
        let result = GraphBuilder::new().stage(noop(StageName::Plan)).build();
        assert!(matches!(result, Err(GraphError::NoEntry)));
    }

    #[test]
    fn test_routes_resolve_after_build() {
        let graph = GraphBuilder::new()
            .stage(noop(StageName::Plan))
            .stage(noop(StageName::Stack))
            .entry(StageName::Plan)
            .route(
                StageName::Plan,
                RunStatus::Planned,
                Target::Stage(StageName::Stack),
            )
            .route(StageName::Stack, RunStatus::StackComplete, Target::End)
            .build()
            .unwrap();

        assert_eq!(graph.entry(), StageName::Plan);
        assert_eq!(
            graph.next(StageName::Plan, RunStatus::Planned),
            Some(Target::Stage(StageName::Stack))
        );
        assert_eq!(
            graph.next(StageName::Stack, RunStatus::StackComplete),
            Some(Target::End)
        );
        assert_eq!(graph.next(StageName::Plan, RunStatus::Failed), None);
    }

    #[test]
    fn test_stage_names_roundtrip_through_strings() {
        for name in StageName::ALL {
            assert_eq!(name.as_str().parse::<StageName>().unwrap(), name);
        }
        assert!("bogus".parse::<StageName>().is_err());
    }
}
