//! External collaborator interfaces.
//!
//! The engine never talks to the outside world directly: every side effect
//! goes through one of these traits. Stages receive the whole
//! [`Collaborators`] bundle and pick what they need; tests swap in mocks.
//!
//! All calls are blocking from the calling stage's point of view and run
//! under a bounded timeout; transient failures are retried with backoff by
//! the caller via [`retry::with_retry`].

pub mod exec;
pub mod git;
pub mod http;
pub mod retry;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::StageError;
use crate::state::TicketRef;

/// Tracker lifecycle states the engine transitions tickets through.
pub mod lifecycle {
    pub const READY: &str = "ready";
    pub const IN_PROGRESS: &str = "in_progress";
    pub const FAILED: &str = "failed";
    pub const DONE: &str = "done";
}

/// Issue tracker: source of tickets and sink for lifecycle updates.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_ready_tickets(&self) -> Result<Vec<TicketRef>, StageError>;
    async fn transition(&self, ticket_id: &str, target_state: &str) -> Result<(), StageError>;
    async fn add_note(&self, ticket_id: &str, text: &str) -> Result<(), StageError>;
}

/// Version control operations the engine invokes. Anything finer-grained
/// than this is the collaborator's business.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create `name` from `base`, or check it out if it already exists.
    /// Idempotence here is what makes a crashed `advance()` retryable.
    async fn create_branch(&self, name: &str, base: &str) -> Result<(), StageError>;
    /// Stage and commit. An empty `files` slice stages everything.
    async fn commit(&self, message: &str, files: &[String]) -> Result<(), StageError>;
    async fn push(&self, branch: &str) -> Result<(), StageError>;
    /// Open a change request and return its URL.
    async fn open_change_request(
        &self,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<String, StageError>;
    /// Merge commit of a change request, `None` while unmerged.
    async fn merge_ref(&self, change_request: &str) -> Result<Option<String>, StageError>;
    async fn revert(&self, commit_ref: &str) -> Result<(), StageError>;
    async fn current_branch(&self) -> Result<String, StageError>;
}

/// Generation collaborator. Output may carry decorative wrapping; the decode
/// boundary strips it before structured parsing.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<String, StageError>;
}

/// Outcome of an end-to-end validation run.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub diagnostics: String,
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn run(&self, preview_url: &str, files: &[String])
    -> Result<ValidationReport, StageError>;
}

/// Deployment collaborator. `Ok(None)` means the capability is not
/// configured and the stage should skip rather than fail.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy_preview(&self, branch: &str) -> Result<Option<String>, StageError>;
    async fn provision_ephemeral_store(&self, branch: &str)
    -> Result<Option<String>, StageError>;
}

/// Error-rate sampling over an observation window.
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn query_error_rate(&self, window: Duration) -> Result<u64, StageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[async_trait]
pub trait Alerter: Send + Sync {
    async fn notify(&self, message: &str, severity: Severity) -> Result<(), StageError>;
}

/// Bundle of collaborator handles shared by all stages.
#[derive(Clone)]
pub struct Collaborators {
    pub tracker: Arc<dyn IssueTracker>,
    pub vcs: Arc<dyn VersionControl>,
    pub generator: Arc<dyn Generator>,
    pub validator: Arc<dyn Validator>,
    pub deployer: Arc<dyn Deployer>,
    pub telemetry: Arc<dyn Telemetry>,
    pub alerter: Arc<dyn Alerter>,
}

impl Collaborators {
    /// Wire up the live collaborators from config and environment.
    pub fn live(config: &crate::config::Config) -> anyhow::Result<Self> {
        Ok(Self {
            tracker: Arc::new(http::HttpIssueTracker::from_env()?),
            vcs: Arc::new(git::GitVersionControl::new(config.project_dir.clone())),
            generator: Arc::new(exec::CliGenerator::new(
                &config.generator_cmd,
                config.call_timeout,
            )),
            validator: Arc::new(exec::CliValidator::from_env(config.call_timeout)),
            deployer: Arc::new(exec::CliDeployer::from_env()),
            telemetry: Arc::new(http::HttpTelemetry::from_env()),
            alerter: Arc::new(http::WebhookAlerter::from_env()),
        })
    }
}
