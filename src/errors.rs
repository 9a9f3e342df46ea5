//! Typed error hierarchy for the conveyor engine.
//!
//! Two top-level enums cover the two layers:
//! - `StageError` — a single stage handler failing, classified so the engine
//!   and the recovery stage know whether to retry, surface, or abort
//! - `EngineError` — faults of the engine itself (routing, checkpointing,
//!   ceilings)

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy governing how a stage error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network hiccup or rate limit. Retried locally with backoff; escalates
    /// only after retries are exhausted.
    Transient,
    /// Malformed structured output. Bounded correction cycle, separate from
    /// review iterations.
    Parse,
    /// Review rejection territory, governed by the iteration guard.
    Domain,
    /// Missing stack prerequisite. Hard-fails the item, no retry.
    Dependency,
    /// Collaborator unreachable or refused auth. Pauses the ticket and
    /// alerts the operator.
    ExternalUnavailable,
    /// State corruption or unrecoverable engine fault.
    Fatal,
}

impl ErrorClass {
    /// Classes that page the operator via the alerting collaborator.
    pub fn alerts_operator(self) -> bool {
        matches!(self, Self::ExternalUnavailable | Self::Fatal)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Parse => "parse",
            Self::Domain => "domain",
            Self::Dependency => "dependency",
            Self::ExternalUnavailable => "external_unavailable",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Failure of a single stage handler.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("collaborator call '{call}' failed: {message}")]
    Collaborator {
        call: String,
        class: ErrorClass,
        message: String,
    },

    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    #[error("parse correction budget exhausted after {attempts} attempts")]
    ParseBudgetExhausted { attempts: u32 },

    #[error("work item {index} is missing its stack prerequisite: {message}")]
    MissingPrerequisite { index: usize, message: String },

    #[error("call '{call}' timed out after {seconds}s")]
    Timeout { call: String, seconds: u64 },

    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    /// Shorthand for a transient collaborator failure.
    pub fn transient(call: &str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            call: call.to_string(),
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    /// Shorthand for an unreachable collaborator.
    pub fn unavailable(call: &str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            call: call.to_string(),
            class: ErrorClass::ExternalUnavailable,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Collaborator { class, .. } => *class,
            Self::Decode { .. } | Self::ParseBudgetExhausted { .. } => ErrorClass::Parse,
            Self::MissingPrerequisite { .. } => ErrorClass::Dependency,
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }
}

/// Faults of the engine itself, as opposed to a stage handler.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no stage registered under name '{0}'")]
    UnknownStage(String),

    #[error("no route from stage '{stage}' for status '{status}'")]
    MissingRoute { stage: String, status: String },

    #[error("step ceiling of {ceiling} exceeded; routing is likely cyclic")]
    StepCeilingExceeded { ceiling: u32 },

    #[error("checkpoint store error: {0}")]
    Checkpoint(anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
