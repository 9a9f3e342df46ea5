//! Git-backed version control collaborator.
//!
//! Local operations (branches, commits) go through `git2`; anything that
//! crosses the network (push, change requests) shells out to `git` and `gh`
//! so credential helpers and host configuration keep working.

use async_trait::async_trait;
use git2::{BranchType, Repository, Signature, build::CheckoutBuilder};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::VersionControl;
use crate::errors::{ErrorClass, StageError};

pub struct GitVersionControl {
    repo_dir: PathBuf,
}

impl GitVersionControl {
    pub fn new(repo_dir: PathBuf) -> Self {
        Self { repo_dir }
    }

    async fn run(&self, program: &str, args: &[&str], call: &str) -> Result<String, StageError> {
        debug!(call, ?args, "running {program}");
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| StageError::unavailable(call, format!("failed to run {program}: {e}")))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(StageError::transient(
                call,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

fn local_err(call: &str, err: git2::Error) -> StageError {
    StageError::Collaborator {
        call: call.to_string(),
        class: ErrorClass::Domain,
        message: err.message().to_string(),
    }
}

fn resolve_base<'r>(repo: &'r Repository, base: &str) -> Result<git2::Commit<'r>, git2::Error> {
    if let Ok(branch) = repo.find_branch(base, BranchType::Local) {
        return branch.get().peel_to_commit();
    }
    if let Ok(branch) = repo.find_branch(&format!("origin/{base}"), BranchType::Remote) {
        return branch.get().peel_to_commit();
    }
    repo.revparse_single(base)?.peel_to_commit()
}

fn create_branch_blocking(dir: &Path, name: &str, base: &str) -> Result<(), StageError> {
    let call = "vcs.create_branch";
    let repo = Repository::open(dir).map_err(|e| local_err(call, e))?;
    if repo.find_branch(name, BranchType::Local).is_err() {
        let base_commit = resolve_base(&repo, base).map_err(|e| {
            StageError::Collaborator {
                call: call.to_string(),
                class: ErrorClass::Dependency,
                message: format!("base branch '{base}' not found: {}", e.message()),
            }
        })?;
        repo.branch(name, &base_commit, false)
            .map_err(|e| local_err(call, e))?;
    }
    repo.set_head(&format!("refs/heads/{name}"))
        .map_err(|e| local_err(call, e))?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))
        .map_err(|e| local_err(call, e))?;
    Ok(())
}

fn commit_blocking(dir: &Path, message: &str, files: &[String]) -> Result<(), StageError> {
    let call = "vcs.commit";
    let repo = Repository::open(dir).map_err(|e| local_err(call, e))?;
    let mut index = repo.index().map_err(|e| local_err(call, e))?;
    if files.is_empty() {
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .map_err(|e| local_err(call, e))?;
    } else {
        for file in files {
            index
                .add_path(Path::new(file))
                .map_err(|e| local_err(call, e))?;
        }
    }
    index.write().map_err(|e| local_err(call, e))?;
    let tree_id = index.write_tree().map_err(|e| local_err(call, e))?;
    let tree = repo.find_tree(tree_id).map_err(|e| local_err(call, e))?;

    let parent = repo
        .head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok());
    if let Some(ref parent) = parent
        && parent.tree_id() == tree_id
    {
        // Nothing staged beyond the parent; a re-run after a crash lands
        // here and must not fail.
        return Ok(());
    }
    let sig = Signature::now("conveyor", "conveyor@localhost").map_err(|e| local_err(call, e))?;
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .map_err(|e| local_err(call, e))?;
    Ok(())
}

#[async_trait]
impl VersionControl for GitVersionControl {
    async fn create_branch(&self, name: &str, base: &str) -> Result<(), StageError> {
        let dir = self.repo_dir.clone();
        let (name, base) = (name.to_string(), base.to_string());
        tokio::task::spawn_blocking(move || create_branch_blocking(&dir, &name, &base))
            .await
            .map_err(|e| StageError::Fatal(format!("branch task panicked: {e}")))?
    }

    async fn commit(&self, message: &str, files: &[String]) -> Result<(), StageError> {
        let dir = self.repo_dir.clone();
        let message = message.to_string();
        let files = files.to_vec();
        tokio::task::spawn_blocking(move || commit_blocking(&dir, &message, &files))
            .await
            .map_err(|e| StageError::Fatal(format!("commit task panicked: {e}")))?
    }

    async fn push(&self, branch: &str) -> Result<(), StageError> {
        self.run("git", &["push", "-u", "origin", branch], "vcs.push")
            .await?;
        Ok(())
    }

    async fn open_change_request(
        &self,
        title: &str,
        body: &str,
        base: &str,
    ) -> Result<String, StageError> {
        self.run(
            "gh",
            &["pr", "create", "--title", title, "--body", body, "--base", base],
            "vcs.open_change_request",
        )
        .await
    }

    async fn merge_ref(&self, change_request: &str) -> Result<Option<String>, StageError> {
        let out = self
            .run(
                "gh",
                &[
                    "pr",
                    "view",
                    change_request,
                    "--json",
                    "mergeCommit",
                    "--jq",
                    ".mergeCommit.oid",
                ],
                "vcs.merge_ref",
            )
            .await?;
        if out.is_empty() || out == "null" {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    async fn revert(&self, commit_ref: &str) -> Result<(), StageError> {
        self.run("git", &["revert", "--no-edit", commit_ref], "vcs.revert")
            .await?;
        Ok(())
    }

    async fn current_branch(&self) -> Result<String, StageError> {
        let dir = self.repo_dir.clone();
        tokio::task::spawn_blocking(move || {
            let call = "vcs.current_branch";
            let repo = Repository::open(&dir).map_err(|e| local_err(call, e))?;
            let head = repo.head().map_err(|e| local_err(call, e))?;
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        })
        .await
        .map_err(|e| StageError::Fatal(format!("branch task panicked: {e}")))?
    }
}
