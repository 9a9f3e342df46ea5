//! Runtime configuration for the conveyor engine.
//!
//! Settings resolve in three layers: built-in defaults, an optional
//! `conveyor.toml` in the project directory, then CLI flags. Credentials and
//! endpoints for collaborators stay in the environment and never land in the
//! TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_STEP_CEILING: u32 = 200;
pub const DEFAULT_PARSE_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TELEMETRY_WINDOW_SECS: u64 = 300;
pub const DEFAULT_ERROR_THRESHOLD: u64 = 100;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TRUNK: &str = "main";

/// Shape of `conveyor.toml`. Every field is optional; absent fields fall
/// back to the defaults above.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub max_iterations: Option<u32>,
    pub step_ceiling: Option<u32>,
    pub parse_attempts: Option<u32>,
    pub retry_attempts: Option<u32>,
    pub call_timeout_secs: Option<u64>,
    pub telemetry_window_secs: Option<u64>,
    pub error_threshold: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub trunk: Option<String>,
    pub generator_cmd: Option<String>,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// Checkpoint directory, `.conveyor/state` under the project.
    pub state_dir: PathBuf,
    /// Per-item ceiling on revise/review cycles.
    pub max_iterations: u32,
    /// Global ceiling on stage invocations per run. Guards against
    /// misconfigured routing cycles, independent of `max_iterations`.
    pub step_ceiling: u32,
    /// Bounded correction cycle for malformed generation output.
    pub parse_attempts: u32,
    /// Attempts per collaborator call for transient failures.
    pub retry_attempts: u32,
    /// Per-call timeout for blocking collaborator calls.
    pub call_timeout: Duration,
    /// Post-merge observation window sampled by the telemetry monitor.
    pub telemetry_window: Duration,
    /// Error count above which the rollback controller reverts.
    pub error_threshold: u64,
    pub poll_interval: Duration,
    /// Stable base branch CONTRACT items originate from.
    pub trunk: String,
    /// Command for the generation collaborator CLI.
    pub generator_cmd: String,
    pub verbose: bool,
}

impl Config {
    /// Resolve configuration for a project directory, reading
    /// `conveyor.toml` when present.
    pub fn load(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let file = {
            let path = project_dir.join("conveyor.toml");
            if path.exists() {
                FileConfig::load(&path)?
            } else {
                FileConfig::default()
            }
        };
        Ok(Self::from_parts(project_dir, file, verbose))
    }

    fn from_parts(project_dir: PathBuf, file: FileConfig, verbose: bool) -> Self {
        let state_dir = project_dir.join(".conveyor").join("state");
        let generator_cmd = file
            .generator_cmd
            .or_else(|| std::env::var("CONVEYOR_GENERATOR_CMD").ok())
            .unwrap_or_else(|| "claude".to_string());
        Self {
            project_dir,
            state_dir,
            max_iterations: file.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            step_ceiling: file.step_ceiling.unwrap_or(DEFAULT_STEP_CEILING),
            parse_attempts: file.parse_attempts.unwrap_or(DEFAULT_PARSE_ATTEMPTS),
            retry_attempts: file.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            call_timeout: Duration::from_secs(
                file.call_timeout_secs.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
            ),
            telemetry_window: Duration::from_secs(
                file.telemetry_window_secs
                    .unwrap_or(DEFAULT_TELEMETRY_WINDOW_SECS),
            ),
            error_threshold: file.error_threshold.unwrap_or(DEFAULT_ERROR_THRESHOLD),
            poll_interval: Duration::from_secs(
                file.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            trunk: file.trunk.unwrap_or_else(|| DEFAULT_TRUNK.to_string()),
            generator_cmd,
            verbose,
        }
    }

    /// In-memory config for tests, rooted at an existing directory.
    pub fn for_dir(project_dir: PathBuf) -> Self {
        Self::from_parts(project_dir, FileConfig::default(), false)
    }
}
