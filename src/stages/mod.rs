//! Stage handlers for the conveyor task graph.
//!
//! Each stage is one state transition: it reads the shared
//! [`ExecutionState`](crate::state::ExecutionState), does its work through
//! the collaborator traits, and returns a
//! [`StateUpdate`](crate::state::StateUpdate) the engine merges and routes
//! on. Stages hold no mutable state of their own.

pub mod deploy;
pub mod draft;
pub mod plan;
pub mod publish;
pub mod recover;
pub mod revert;
pub mod review;
pub mod stack;
pub mod telemetry;
pub mod validate;

use async_trait::async_trait;

use crate::errors::StageError;
use crate::graph::builder::StageName;
use crate::state::{ExecutionState, StateUpdate};

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    async fn run(&self, state: &ExecutionState) -> Result<StateUpdate, StageError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock collaborators shared by stage unit tests.

    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::collab::{
        Alerter, Collaborators, Deployer, Generator, IssueTracker, Severity, Telemetry,
        ValidationReport, Validator, VersionControl,
    };
    use crate::errors::StageError;
    use crate::state::TicketRef;

    /// Generator returning canned responses in order, recording prompts.
    #[derive(Default)]
    pub struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String, StageError>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub fn replying(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(
                    responses.into_iter().map(|r| Ok(r.to_string())).collect(),
                ),
                prompts: Mutex::new(Vec::new()),
            }
        }

    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn invoke(&self, prompt: &str) -> Result<String, StageError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(StageError::Fatal("scripted generator exhausted".into())))
        }
    }

    /// Version control recording calls; individual operations can be armed
    /// to fail.
    #[derive(Default)]
    pub struct RecordingVcs {
        pub branches: Mutex<Vec<(String, String)>>,
        pub commits: Mutex<Vec<String>>,
        pub pushes: Mutex<Vec<String>>,
        pub change_requests: Mutex<Vec<(String, String)>>,
        pub reverts: Mutex<Vec<String>>,
        pub fail_create_branch: Mutex<bool>,
        pub merge_commit: Mutex<Option<String>>,
    }

    #[async_trait]
    impl VersionControl for RecordingVcs {
        async fn create_branch(&self, name: &str, base: &str) -> Result<(), StageError> {
            if *self.fail_create_branch.lock().unwrap() {
                return Err(StageError::transient("vcs.create_branch", "remote hung up"));
            }
            self.branches
                .lock()
                .unwrap()
                .push((name.to_string(), base.to_string()));
            Ok(())
        }

        async fn commit(&self, message: &str, _files: &[String]) -> Result<(), StageError> {
            self.commits.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn push(&self, branch: &str) -> Result<(), StageError> {
            self.pushes.lock().unwrap().push(branch.to_string());
            Ok(())
        }

        async fn open_change_request(
            &self,
            title: &str,
            _body: &str,
            base: &str,
        ) -> Result<String, StageError> {
            self.change_requests
                .lock()
                .unwrap()
                .push((title.to_string(), base.to_string()));
            Ok(format!("https://example.test/pr/{}", title.len()))
        }

        async fn merge_ref(&self, _change_request: &str) -> Result<Option<String>, StageError> {
            Ok(self.merge_commit.lock().unwrap().clone())
        }

        async fn revert(&self, commit_ref: &str) -> Result<(), StageError> {
            self.reverts.lock().unwrap().push(commit_ref.to_string());
            Ok(())
        }

        async fn current_branch(&self) -> Result<String, StageError> {
            Ok("main".to_string())
        }
    }

    #[derive(Default)]
    pub struct RecordingTracker {
        pub transitions: Mutex<Vec<(String, String)>>,
        pub notes: Mutex<Vec<(String, String)>>,
        pub ready: Mutex<Vec<TicketRef>>,
    }

    #[async_trait]
    impl IssueTracker for RecordingTracker {
        async fn fetch_ready_tickets(&self) -> Result<Vec<TicketRef>, StageError> {
            Ok(self.ready.lock().unwrap().clone())
        }

        async fn transition(&self, ticket_id: &str, target_state: &str) -> Result<(), StageError> {
            self.transitions
                .lock()
                .unwrap()
                .push((ticket_id.to_string(), target_state.to_string()));
            Ok(())
        }

        async fn add_note(&self, ticket_id: &str, text: &str) -> Result<(), StageError> {
            self.notes
                .lock()
                .unwrap()
                .push((ticket_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    /// Deployer with configurable outcomes, `None` meaning unconfigured.
    #[derive(Default)]
    pub struct StubDeployer {
        pub preview: Option<String>,
        pub store: Option<String>,
    }

    #[async_trait]
    impl Deployer for StubDeployer {
        async fn deploy_preview(&self, _branch: &str) -> Result<Option<String>, StageError> {
            Ok(self.preview.clone())
        }

        async fn provision_ephemeral_store(
            &self,
            _branch: &str,
        ) -> Result<Option<String>, StageError> {
            Ok(self.store.clone())
        }
    }

    pub struct StubValidator {
        pub report: ValidationReport,
    }

    #[async_trait]
    impl Validator for StubValidator {
        async fn run(
            &self,
            _preview_url: &str,
            _files: &[String],
        ) -> Result<ValidationReport, StageError> {
            Ok(self.report.clone())
        }
    }

    /// Telemetry returning a fixed count, or unreachable when `None`.
    #[derive(Default)]
    pub struct StubTelemetry {
        pub error_count: Option<u64>,
    }

    #[async_trait]
    impl Telemetry for StubTelemetry {
        async fn query_error_rate(&self, _window: Duration) -> Result<u64, StageError> {
            match self.error_count {
                Some(count) => Ok(count),
                None => Err(StageError::unavailable(
                    "telemetry.query_error_rate",
                    "unreachable",
                )),
            }
        }
    }

    #[derive(Default)]
    pub struct RecordingAlerter {
        pub alerts: Mutex<Vec<(Severity, String)>>,
    }

    #[async_trait]
    impl Alerter for RecordingAlerter {
        async fn notify(&self, message: &str, severity: Severity) -> Result<(), StageError> {
            self.alerts
                .lock()
                .unwrap()
                .push((severity, message.to_string()));
            Ok(())
        }
    }

    /// A full bundle of recording mocks plus handles to inspect them.
    pub struct MockSet {
        pub collab: Collaborators,
        pub generator: Arc<ScriptedGenerator>,
        pub vcs: Arc<RecordingVcs>,
        pub tracker: Arc<RecordingTracker>,
        pub alerter: Arc<RecordingAlerter>,
    }

    pub fn mocks(responses: Vec<&str>) -> MockSet {
        mocks_with(responses, StubDeployer::default(), StubTelemetry::default())
    }

    pub fn mocks_with(
        responses: Vec<&str>,
        deployer: StubDeployer,
        telemetry: StubTelemetry,
    ) -> MockSet {
        let generator = Arc::new(ScriptedGenerator::replying(responses));
        let vcs = Arc::new(RecordingVcs::default());
        let tracker = Arc::new(RecordingTracker::default());
        let alerter = Arc::new(RecordingAlerter::default());
        let collab = Collaborators {
            tracker: tracker.clone(),
            vcs: vcs.clone(),
            generator: generator.clone(),
            validator: Arc::new(StubValidator {
                report: ValidationReport {
                    passed: true,
                    diagnostics: String::new(),
                },
            }),
            deployer: Arc::new(deployer),
            telemetry: Arc::new(telemetry),
            alerter: alerter.clone(),
        };
        MockSet {
            collab,
            generator,
            vcs,
            tracker,
            alerter,
        }
    }

    pub fn ticket(identifier: &str) -> TicketRef {
        TicketRef {
            id: format!("uuid-{}", identifier.to_lowercase()),
            identifier: identifier.to_string(),
            title: "Add patient profile".to_string(),
            description: Some("Profiles with name and date of birth".to_string()),
            state: "Ready".to_string(),
            priority: 1,
            parent_ref: None,
        }
    }
}
