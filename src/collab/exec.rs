//! Subprocess-backed collaborators: generation, validation, deployment.
//!
//! Each wraps an external CLI. The command line comes from config or the
//! environment, the prompt or parameters go in over stdin and env vars, and
//! stdout comes back as the result. Every spawn runs under the configured
//! call timeout.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{Deployer, Generator, ValidationReport, Validator};
use crate::errors::StageError;

/// Split a configured command line into program and arguments.
fn split_cmd(cmdline: &str, call: &str) -> Result<(String, Vec<String>), StageError> {
    let mut parts = cmdline.split_whitespace().map(String::from);
    let program = parts
        .next()
        .ok_or_else(|| StageError::unavailable(call, "empty command line"))?;
    Ok((program, parts.collect()))
}

struct CmdOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run_cmd(
    cmdline: &str,
    stdin: Option<&str>,
    env: &HashMap<String, String>,
    timeout: Duration,
    call: &str,
) -> Result<CmdOutput, StageError> {
    let (program, args) = split_cmd(cmdline, call)?;
    debug!(call, program, "spawning collaborator process");
    let mut command = Command::new(&program);
    command
        .args(&args)
        .envs(env)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| StageError::unavailable(call, format!("failed to spawn {program}: {e}")))?;

    if let Some(input) = stdin
        && let Some(mut handle) = child.stdin.take()
    {
        handle
            .write_all(input.as_bytes())
            .await
            .map_err(|e| StageError::transient(call, format!("failed to write stdin: {e}")))?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| StageError::transient(call, format!("wait failed: {e}")))?
        }
        Err(_) => {
            return Err(StageError::Timeout {
                call: call.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    Ok(CmdOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Generation collaborator invoking an external CLI with the prompt on
/// stdin.
pub struct CliGenerator {
    cmdline: String,
    timeout: Duration,
}

impl CliGenerator {
    pub fn new(cmdline: &str, timeout: Duration) -> Self {
        Self {
            cmdline: cmdline.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Generator for CliGenerator {
    async fn invoke(&self, prompt: &str) -> Result<String, StageError> {
        let call = "generator.invoke";
        let out = run_cmd(
            &self.cmdline,
            Some(prompt),
            &HashMap::new(),
            self.timeout,
            call,
        )
        .await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(StageError::transient(call, out.stderr.trim().to_string()))
        }
    }
}

/// Validation collaborator running an end-to-end test command against a
/// preview deployment. The target URL and changed files are passed through
/// the environment.
pub struct CliValidator {
    cmdline: Option<String>,
    timeout: Duration,
}

impl CliValidator {
    pub fn from_env(timeout: Duration) -> Self {
        Self {
            cmdline: std::env::var("CONVEYOR_VALIDATE_CMD").ok(),
            timeout,
        }
    }

    pub fn new(cmdline: &str, timeout: Duration) -> Self {
        Self {
            cmdline: Some(cmdline.to_string()),
            timeout,
        }
    }
}

#[async_trait]
impl Validator for CliValidator {
    async fn run(
        &self,
        preview_url: &str,
        files: &[String],
    ) -> Result<ValidationReport, StageError> {
        let call = "validator.run";
        let cmdline = self
            .cmdline
            .as_deref()
            .ok_or_else(|| StageError::unavailable(call, "CONVEYOR_VALIDATE_CMD not set"))?;
        let mut env = HashMap::new();
        env.insert("BASE_URL".to_string(), preview_url.to_string());
        env.insert("CHANGED_FILES".to_string(), files.join(","));
        let out = run_cmd(cmdline, None, &env, self.timeout, call).await?;
        let diagnostics = if out.success {
            out.stdout.trim().to_string()
        } else {
            format!("{}\n{}", out.stdout.trim(), out.stderr.trim())
                .trim()
                .to_string()
        };
        Ok(ValidationReport {
            passed: out.success,
            diagnostics,
        })
    }
}

/// Deployment collaborator shelling out to preview-deploy and store
/// provisioning commands. Either command being unconfigured yields
/// `Ok(None)` so the pipeline can skip deployment instead of failing.
pub struct CliDeployer {
    deploy_cmd: Option<String>,
    store_cmd: Option<String>,
    timeout: Duration,
}

impl CliDeployer {
    pub fn from_env() -> Self {
        Self {
            deploy_cmd: std::env::var("CONVEYOR_DEPLOY_CMD").ok(),
            store_cmd: std::env::var("CONVEYOR_STORE_CMD").ok(),
            timeout: Duration::from_secs(crate::config::DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    async fn run_for_branch(
        &self,
        cmdline: &str,
        branch: &str,
        call: &str,
    ) -> Result<String, StageError> {
        let mut env = HashMap::new();
        env.insert("BRANCH".to_string(), branch.to_string());
        let out = run_cmd(cmdline, None, &env, self.timeout, call).await?;
        if !out.success {
            return Err(StageError::transient(call, out.stderr.trim().to_string()));
        }
        // The command's last line carries the URL or connection reference.
        out.stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(String::from)
            .ok_or_else(|| StageError::transient(call, "command produced no output"))
    }
}

#[async_trait]
impl Deployer for CliDeployer {
    async fn deploy_preview(&self, branch: &str) -> Result<Option<String>, StageError> {
        match &self.deploy_cmd {
            None => Ok(None),
            Some(cmd) => Ok(Some(
                self.run_for_branch(cmd, branch, "deployer.deploy_preview")
                    .await?,
            )),
        }
    }

    async fn provision_ephemeral_store(&self, branch: &str) -> Result<Option<String>, StageError> {
        match &self.store_cmd {
            None => Ok(None),
            Some(cmd) => Ok(Some(
                self.run_for_branch(cmd, branch, "deployer.provision_ephemeral_store")
                    .await?,
            )),
        }
    }
}
