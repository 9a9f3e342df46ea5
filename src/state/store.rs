//! Checkpoint store for crash recovery.
//!
//! After every stage transition the engine persists the merged state plus
//! the name of the stage that runs next, keyed by ticket identifier. A
//! restarted engine picks up from the pending stage instead of replaying the
//! whole item. Terminal states are moved to an archive directory rather than
//! deleted, so postmortems keep the full record.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use super::ExecutionState;

/// One persisted checkpoint: the state after a transition and the stage the
/// engine was about to enter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: ExecutionState,
    /// Stage to resume from; `None` once the run has reached a terminal
    /// status.
    pub pending_stage: Option<String>,
    pub saved_at: chrono::DateTime<Utc>,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Persist a checkpoint, replacing any previous one for the same key.
    pub fn save(&self, key: &str, state: &ExecutionState, pending_stage: Option<&str>) -> Result<()> {
        fs::create_dir_all(&self.dir).context("Failed to create checkpoint directory")?;
        let checkpoint = Checkpoint {
            state: state.clone(),
            pending_stage: pending_stage.map(|s| s.to_string()),
            saved_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&checkpoint)
            .context("Failed to serialize checkpoint")?;
        let path = self.path_for(key);
        // Write-then-rename so a crash mid-write never corrupts the
        // checkpoint a restart depends on.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write checkpoint: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move checkpoint into place: {}", path.display()))?;
        Ok(())
    }

    /// Load the checkpoint for a key, if one exists.
    pub fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Move a terminal run's checkpoint into the archive directory.
    pub fn archive(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(());
        }
        let archive_dir = self.dir.join("archive");
        fs::create_dir_all(&archive_dir).context("Failed to create archive directory")?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let target = archive_dir.join(format!("{key}-{stamp}.json"));
        fs::rename(&path, &target)
            .with_context(|| format!("Failed to archive checkpoint: {}", target.display()))?;
        Ok(())
    }
}
