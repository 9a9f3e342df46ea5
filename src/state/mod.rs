//! Shared execution state and the per-field merge contract.
//!
//! One [`ExecutionState`] is created per incoming ticket and threaded through
//! every stage. Stages never mutate the state directly: they return a
//! [`StateUpdate`] and the engine applies it via [`ExecutionState::apply`],
//! which enforces the merge policy — scalar fields overwrite, append-only
//! log fields concatenate.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorClass;

/// Kind of a work item inside a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkItemKind {
    /// Data schema / API contract the rest of the stack builds on.
    Contract,
    /// Server-side implementation consuming the contract.
    Backend,
    /// UI implementation consuming the contract.
    Frontend,
}

impl WorkItemKind {
    /// Lowercase identifier used in branch names.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Backend => "backend",
            Self::Frontend => "frontend",
        }
    }
}

impl std::fmt::Display for WorkItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contract => write!(f, "CONTRACT"),
            Self::Backend => write!(f, "BACKEND"),
            Self::Frontend => write!(f, "FRONTEND"),
        }
    }
}

/// Lifecycle status of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One stage-ordered unit of the stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: WorkItemKind,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Index of the work item this one branches from. Must point at an
    /// earlier CONTRACT item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<usize>,
    /// Assigned once by the stack manager, stable across retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_request_ref: Option<String>,
    #[serde(default)]
    pub status: WorkItemStatus,
}

impl WorkItem {
    pub fn new(kind: WorkItemKind, title: &str, description: &str) -> Self {
        Self {
            kind,
            title: title.to_string(),
            description: description.to_string(),
            acceptance_criteria: Vec::new(),
            depends_on: None,
            branch_name: None,
            change_request_ref: None,
            status: WorkItemStatus::Pending,
        }
    }

    pub fn with_depends_on(mut self, index: usize) -> Self {
        self.depends_on = Some(index);
        self
    }
}

/// Validate the structural invariants of a planned stack.
///
/// Every non-CONTRACT item must name an earlier CONTRACT item as its
/// dependency. Violations are rejected before the stack manager ever runs.
pub fn validate_stack(items: &[WorkItem]) -> Result<(), String> {
    for (index, item) in items.iter().enumerate() {
        match item.kind {
            WorkItemKind::Contract => {}
            WorkItemKind::Backend | WorkItemKind::Frontend => {
                let Some(dep) = item.depends_on else {
                    return Err(format!(
                        "{} item '{}' has no contract dependency",
                        item.kind, item.title
                    ));
                };
                if dep >= index {
                    return Err(format!(
                        "{} item '{}' depends on item {} which does not precede it",
                        item.kind, item.title, dep
                    ));
                }
                if items[dep].kind != WorkItemKind::Contract {
                    return Err(format!(
                        "{} item '{}' depends on a non-CONTRACT item",
                        item.kind, item.title
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Feedback produced by one reviewer for one review cycle. Immutable once
/// created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub reviewer_id: String,
    pub approved: bool,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Reference to the ticket being processed, as fetched from the issue
/// tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRef {
    pub id: String,
    /// Human-readable identifier, e.g. "ENG-42".
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub state: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
}

/// Closed status set routed on by the task graph.
///
/// Routing keys reference these variants and are validated when the graph is
/// built, so a misspelled status is a construction error rather than a
/// silent dead end at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Producing or revising an artifact.
    Drafting,
    /// Artifact ready, review cycle pending or underway.
    Reviewing,
    /// Stack planned, work items recorded.
    Planned,
    /// Current cycle's reviewers all approved.
    Approved,
    /// Change request opened for the current work item.
    Published,
    /// Stack manager selected a work item and its branch.
    Working,
    /// All work items completed.
    StackComplete,
    /// Ephemeral environment is up.
    Deployed,
    /// End-to-end validation passed against the preview.
    ValidationPassed,
    /// Telemetry window sampled below threshold.
    Healthy,
    /// A stage could not run and declined to guess (telemetry unreachable,
    /// nothing deployed). Distinct from `Healthy` by design.
    Skipped,
    /// Telemetry window sampled above threshold.
    ErrorSpike,
    /// Merge commit reverted and pushed back to trunk. Terminal.
    Reverted,
    /// Published and observed healthy. Terminal.
    Complete,
    /// Unrecoverable rejection or exhausted budget. Terminal.
    Failed,
    /// A stage handler failed; routed to the recovery stage.
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Reverted)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Drafting => "drafting",
            Self::Reviewing => "reviewing",
            Self::Planned => "planned",
            Self::Approved => "approved",
            Self::Published => "published",
            Self::Working => "working",
            Self::StackComplete => "stack_complete",
            Self::Deployed => "deployed",
            Self::ValidationPassed => "validation_passed",
            Self::Healthy => "healthy",
            Self::Skipped => "skipped",
            Self::ErrorSpike => "error_spike",
            Self::Reverted => "reverted",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Recorded stage failure, consumed by the recovery stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFault {
    pub stage: String,
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The accumulating record passed between stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<TicketRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_artifact: Option<String>,
    /// Feedback for the current review cycle. Append-only within a cycle;
    /// cleared only by the stage that starts the next cycle, after the
    /// previous cycle's concerns have been consumed.
    #[serde(default)]
    pub feedback: Vec<ReviewFeedback>,
    /// Revise/review cycles consumed by the current work item. Resets to
    /// zero only when advancing to a new work item.
    #[serde(default)]
    pub iteration_count: u32,
    pub status: RunStatus,
    /// Append-only audit log. Never shrinks.
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    #[serde(default)]
    pub current_work_index: usize,
    /// Branch recorded by the CONTRACT item for its dependents to base on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_base_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_request_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<StageFault>,
}

impl ExecutionState {
    /// Fresh state for a free-form task with no tracker ticket.
    pub fn for_task(task: &str) -> Self {
        Self {
            task_description: task.to_string(),
            ticket: None,
            current_artifact: None,
            feedback: Vec::new(),
            iteration_count: 0,
            status: RunStatus::Drafting,
            messages: Vec::new(),
            work_items: Vec::new(),
            current_work_index: 0,
            stack_base_reference: None,
            change_request_ref: None,
            preview_url: None,
            store_ref: None,
            merge_ref: None,
            error_count: None,
            last_fault: None,
        }
    }

    /// Fresh state seeded from a tracker ticket.
    pub fn for_ticket(ticket: TicketRef) -> Self {
        let task = match &ticket.description {
            Some(desc) => format!("{}\n\n{}", ticket.title, desc),
            None => ticket.title.clone(),
        };
        let mut state = Self::for_task(&task);
        state.ticket = Some(ticket);
        state
    }

    /// Key under which this state is checkpointed.
    pub fn checkpoint_key(&self) -> String {
        match &self.ticket {
            Some(t) => t.identifier.to_lowercase(),
            None => "task".to_string(),
        }
    }

    pub fn current_work_item(&self) -> Option<&WorkItem> {
        self.work_items.get(self.current_work_index)
    }

    /// Apply a partial update per the merge contract: scalars overwrite when
    /// present, `messages` and `feedback` concatenate. `feedback` may be
    /// cleared first, but only when the update explicitly says so.
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(artifact) = update.current_artifact {
            self.current_artifact = Some(artifact);
        }
        if let Some(count) = update.iteration_count {
            self.iteration_count = count;
        }
        if update.clear_feedback {
            self.feedback.clear();
        }
        self.feedback.extend(update.feedback);
        self.messages.extend(update.messages);
        if let Some(items) = update.work_items {
            self.work_items = items;
        }
        if let Some(index) = update.current_work_index {
            self.current_work_index = index;
        }
        if let Some(base) = update.stack_base_reference {
            self.stack_base_reference = Some(base);
        }
        if let Some(cr) = update.change_request_ref {
            self.change_request_ref = Some(cr);
        }
        if let Some(url) = update.preview_url {
            self.preview_url = Some(url);
        }
        if let Some(store) = update.store_ref {
            self.store_ref = Some(store);
        }
        if let Some(merge) = update.merge_ref {
            self.merge_ref = Some(merge);
        }
        if let Some(count) = update.error_count {
            self.error_count = Some(count);
        }
        if let Some(fault) = update.last_fault {
            self.last_fault = Some(fault);
        }
    }
}

/// Partial update returned by a stage handler.
///
/// Scalar fields are `Option` — `None` leaves the state untouched. The two
/// log fields are plain vectors and are always appended, so a handler cannot
/// accidentally overwrite audit history.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub status: Option<RunStatus>,
    pub current_artifact: Option<String>,
    pub iteration_count: Option<u32>,
    /// Clear the review cycle's feedback before appending. Set by the
    /// drafter once concerns are folded into a revision, and by the
    /// publisher when advancing to the next work item.
    pub clear_feedback: bool,
    pub feedback: Vec<ReviewFeedback>,
    pub messages: Vec<String>,
    pub work_items: Option<Vec<WorkItem>>,
    pub current_work_index: Option<usize>,
    pub stack_base_reference: Option<String>,
    pub change_request_ref: Option<String>,
    pub preview_url: Option<String>,
    pub store_ref: Option<String>,
    pub merge_ref: Option<String>,
    pub error_count: Option<u64>,
    pub last_fault: Option<StageFault>,
}

impl StateUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}
