//! Per-task workspace directories.
//!
//! Layout under the configured root:
//!
//! ```text
//! {root}/{task_id}/
//!   logs/           decrypted, unarchived log tree
//!   code/           optional source mirror for needs_code rules
//!   prompt.txt      the assembled agent prompt
//!   transcript.txt  captured agent stdout
//!   snapshot.tar    post-mortem archive, failed tasks only
//! ```

use crate::errors::{MaterializeError, MaterializeResult};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A scoped filesystem directory owned by exactly one task.
#[derive(Debug, Clone)]
pub struct Workspace {
    task_id: Uuid,
    root: PathBuf,
}

impl Workspace {
    /// Create the directory skeleton for a task.
    pub fn create(workspace_root: &Path, task_id: Uuid) -> MaterializeResult<Self> {
        let root = workspace_root.join(task_id.to_string());
        std::fs::create_dir_all(root.join("logs"))?;
        debug!(task_id = %task_id, dir = %root.display(), "Workspace created");
        Ok(Self { task_id, root })
    }

    /// Re-open an existing workspace (recovery, tests).
    pub fn open(workspace_root: &Path, task_id: Uuid) -> Option<Self> {
        let root = workspace_root.join(task_id.to_string());
        root.is_dir().then_some(Self { task_id, root })
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn code_dir(&self) -> PathBuf {
        self.root.join("code")
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.root.join("prompt.txt")
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.root.join("transcript.txt")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot.tar")
    }

    pub fn write_prompt(&self, prompt: &str) -> MaterializeResult<()> {
        std::fs::write(self.prompt_path(), prompt)?;
        Ok(())
    }

    pub fn write_transcript(&self, transcript: &str) -> MaterializeResult<()> {
        std::fs::write(self.transcript_path(), transcript)?;
        Ok(())
    }

    /// Successful-path cleanup: the whole directory goes away.
    pub fn remove(&self) -> MaterializeResult<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        info!(task_id = %self.task_id, "Workspace removed");
        Ok(())
    }

    /// Failure-path cleanup: pack the logs tree, prompt, and transcript into
    /// `snapshot.tar` for post-mortem, then drop everything else. The
    /// snapshot lives until the retention sweeper deletes the directory.
    pub fn snapshot_and_clean(&self) -> MaterializeResult<()> {
        let snapshot = self.snapshot_path();
        let file = File::create(&snapshot)?;
        let mut builder = tar::Builder::new(file);

        let logs = self.logs_dir();
        if logs.is_dir() {
            builder.append_dir_all("logs", &logs)?;
        }
        for name in ["prompt.txt", "transcript.txt"] {
            let path = self.root.join(name);
            if path.is_file() {
                builder.append_path_with_name(&path, name)?;
            }
        }
        builder.finish()?;
        drop(builder);

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path() == snapshot {
                continue;
            }
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        info!(task_id = %self.task_id, snapshot = %snapshot.display(), "Workspace snapshotted");
        Ok(())
    }

    /// Bytes currently on disk under the workspace, for quota accounting.
    pub fn disk_usage(&self) -> MaterializeResult<u64> {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                MaterializeError::IoError(std::io::Error::other(e.to_string()))
            })?;
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}

/// Delete workspace directories whose last modification is older than the
/// retention window. Runs periodically from the daemon.
pub fn sweep_expired(workspace_root: &Path, retention_days: u32, now: DateTime<Utc>) -> usize {
    let mut removed = 0;
    let entries = match std::fs::read_dir(workspace_root) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from);
        let Ok(modified) = modified else { continue };

        let age_days = (now - modified).num_days();
        if age_days >= retention_days as i64 {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(dir = %path.display(), age_days, "Expired workspace removed");
                    removed += 1;
                }
                Err(e) => warn!(dir = %path.display(), error = %e, "Failed to remove expired workspace"),
            }
        }
    }
    removed
}
