//! Snapshot and recovery of the runtime state.
//!
//! The snapshot holds only non-terminal tasks and enabled cron jobs: finished
//! work already lives in the result log and the archive. Writes go to a
//! temporary file that is renamed over the target, so a crash mid-write
//! leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cron::CronJob;
use crate::error::PersistenceError;
use crate::runtime::state::{QueueCursors, RuntimeState};
use crate::tasks::{Task, TaskStore};

pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk form of `RuntimeState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub cron_jobs: Vec<CronJob>,
    #[serde(default)]
    pub inputs_cursor: u64,
    #[serde(default)]
    pub results_cursor: u64,
}

impl RuntimeSnapshot {
    pub fn capture(state: &RuntimeState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            tasks: state.tasks.non_terminal(),
            cron_jobs: state
                .cron_jobs
                .iter()
                .filter(|j| j.enabled)
                .cloned()
                .collect(),
            inputs_cursor: state.cursors.inputs,
            results_cursor: state.cursors.results,
        }
    }

    pub fn cursors(&self) -> QueueCursors {
        QueueCursors {
            inputs: self.inputs_cursor,
            results: self.results_cursor,
        }
    }
}

/// Rebuild state from a snapshot and the cursor files.
///
/// Running tasks are demoted to pending: whatever was executing died with
/// the previous process, and re-running is preferred over dropping work. The
/// controller map always starts empty. Cursors take the larger of the two
/// sources.
pub fn hydrate(snapshot: Option<RuntimeSnapshot>, cursor_files: QueueCursors) -> RuntimeState {
    let Some(snapshot) = snapshot else {
        return RuntimeState {
            cursors: cursor_files,
            ..Default::default()
        };
    };

    let cursors = snapshot.cursors().max(cursor_files);
    let mut tasks = TaskStore::from_tasks(
        snapshot
            .tasks
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect(),
    );
    let demoted = tasks.demote_running();
    if !demoted.is_empty() {
        info!(count = demoted.len(), "Recovered running tasks as pending");
    }

    RuntimeState {
        tasks,
        cron_jobs: snapshot
            .cron_jobs
            .into_iter()
            .filter(|j| j.enabled)
            .collect(),
        running_controllers: Default::default(),
        create_debounce: Default::default(),
        cursors,
    }
}

/// Load the snapshot at `path`.
///
/// A missing file is `None`. A file that does not parse is moved aside to
/// `<path>.corrupt` and also yields `None`, so the process can still start.
pub async fn load_snapshot(path: &Path) -> Result<Option<RuntimeSnapshot>, PersistenceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };

    match serde_json::from_slice::<RuntimeSnapshot>(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            let aside = sibling(path, ".corrupt");
            warn!(
                path = %path.display(),
                error = %e,
                "Snapshot is corrupt; moving it aside and starting empty"
            );
            tokio::fs::rename(path, &aside)
                .await
                .map_err(|e| PersistenceError::io(&aside, e))?;
            Ok(None)
        }
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| PersistenceError::serde(path, e))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistenceError::io(parent, e))?;
    }

    let tmp = sibling(path, &format!(".{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(PersistenceError::io(path, e));
    }
    Ok(())
}

/// Write the full output of a finished task to `<archive_dir>/<id>.md`.
pub async fn write_archive(
    archive_dir: &Path,
    task: &Task,
    body: &str,
) -> Result<PathBuf, PersistenceError> {
    tokio::fs::create_dir_all(archive_dir)
        .await
        .map_err(|e| PersistenceError::io(archive_dir, e))?;
    let path = archive_dir.join(format!("{}.md", task.id));
    let document = format!(
        "# {}\n\n- id: {}\n- profile: {}\n- attempts: {}\n- created: {}\n\n## Prompt\n\n{}\n\n## Output\n\n{}\n",
        task.title,
        task.id,
        task.profile,
        task.attempts,
        task.created_at.to_rfc3339(),
        task.prompt,
        body
    );
    tokio::fs::write(&path, document)
        .await
        .map_err(|e| PersistenceError::io(&path, e))?;
    Ok(path)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
