//! Crash-safe state snapshots.
//!
//! The whole job table is serialized to JSON, written to `<path>.tmp` and
//! renamed over `<path>`, so readers only ever see a complete document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;
use crate::scheduler::job::{FailureKind, Job, JobState};
use crate::scheduler::queue::JobTable;

/// A job as read back from a snapshot file. The spec is kept as raw JSON
/// because callables cannot be restored from their names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub spec: serde_json::Value,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub pid: Option<u32>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

/// Writes snapshots of a job table. Writes are serialized so a slower,
/// older snapshot can never land after a newer one.
#[derive(Debug)]
pub struct SnapshotWriter {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl SnapshotWriter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot every job in `table`. Best effort: failures are logged.
    pub async fn persist(&self, table: &RwLock<JobTable>) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let _guard = self.write_lock.lock().await;

        let shared = table.read().await.jobs();
        let mut jobs = BTreeMap::new();
        for job in shared {
            let job = job.read().await.clone();
            jobs.insert(job.id.clone(), job);
        }

        if let Err(e) = write_snapshot(path, &jobs).await {
            tracing::error!(path = %path.display(), error = %e, "Failed to persist job snapshot");
        } else {
            tracing::trace!(path = %path.display(), jobs = jobs.len(), "Persisted job snapshot");
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Atomically replace `path` with a JSON snapshot of `jobs`.
pub async fn write_snapshot(path: &Path, jobs: &BTreeMap<String, Job>) -> Result<()> {
    let json = serde_json::to_vec_pretty(jobs)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a snapshot written by [`SnapshotWriter`].
pub fn load_snapshot(path: &Path) -> Result<BTreeMap<String, JobRecord>> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
