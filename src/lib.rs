//! Conveyor: a ticket-to-deployment delivery engine.
//!
//! Conveyor watches an issue tracker for ready feature tickets and drives
//! each one through a task graph: plan a dependency-ordered stack of work
//! items, draft an artifact per item, pass it through a reviewer panel
//! until unanimously approved, publish stacked change requests, deploy a
//! preview environment, validate it end to end, and watch post-deploy
//! telemetry — reverting the merge if the error rate spikes.

pub mod collab;
pub mod config;
pub mod decode;
pub mod errors;
pub mod graph;
pub mod poll;
pub mod stages;
pub mod state;

pub use config::Config;
pub use errors::{EngineError, ErrorClass, StageError};
pub use graph::engine::Engine;
pub use poll::Pipeline;
pub use state::{ExecutionState, RunStatus, StateUpdate};
