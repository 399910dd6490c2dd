//! Append-only JSON-lines logs and their consumption cursors.
//!
//! Cursors are byte offsets into the log file. A reader only ever consumes
//! complete lines, so a line being appended concurrently is picked up on the
//! next read.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::runtime::persist::write_json_atomic;

/// Who produced an input line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRole {
    #[default]
    User,
    System,
    Cron,
}

/// One line of the input log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEntry {
    pub id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub role: InputRole,
}

impl InputEntry {
    pub fn new(text: impl Into<String>, role: InputRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            created_at: Utc::now(),
            role,
        }
    }
}

/// Entries read from a log plus the offset just past the last consumed line.
#[derive(Debug)]
pub struct LogBatch<T> {
    pub entries: Vec<T>,
    pub next_offset: u64,
}

/// Append-only JSON-lines file.
#[derive(Debug)]
pub struct JsonlLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line.
    pub async fn append<T: Serialize>(&self, entry: &T) -> Result<(), PersistenceError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| PersistenceError::serde(&self.path, e))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistenceError::io(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        Ok(())
    }

    /// Read every complete line starting at byte `offset`.
    ///
    /// Malformed lines are skipped (and consumed) with a warning. A file
    /// shorter than `offset` yields nothing and keeps the offset; the cursor
    /// never rewinds.
    pub async fn read_from<T: DeserializeOwned>(
        &self,
        offset: u64,
    ) -> Result<LogBatch<T>, PersistenceError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogBatch {
                    entries: Vec::new(),
                    next_offset: offset,
                });
            }
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };

        let len = file
            .metadata()
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?
            .len();
        if len < offset {
            warn!(
                path = %self.path.display(),
                len,
                offset,
                "Log is shorter than its cursor; not rewinding"
            );
            return Ok(LogBatch {
                entries: Vec::new(),
                next_offset: offset,
            });
        }

        // Only the unread tail is loaded.
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        let mut tail = Vec::with_capacity(usize::try_from(len - offset).unwrap_or_default());
        file.read_to_end(&mut tail)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        let Some(last_newline) = tail.iter().rposition(|b| *b == b'\n') else {
            return Ok(LogBatch {
                entries: Vec::new(),
                next_offset: offset,
            });
        };

        let mut entries = Vec::new();
        for raw in tail[..last_newline].split(|b| *b == b'\n') {
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<T>(raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Skipping malformed log line"
                ),
            }
        }

        Ok(LogBatch {
            entries,
            next_offset: offset + last_newline as u64 + 1,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorFile {
    offset: u64,
    updated_at: DateTime<Utc>,
}

/// Per-channel cursor files under `cursors/`.
#[derive(Debug, Clone)]
pub struct CursorStore {
    dir: PathBuf,
}

impl CursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{channel}.json"))
    }

    /// Stored offset for `channel`, 0 when none was ever written.
    ///
    /// An unreadable cursor file is treated as 0; the snapshot's copy of the
    /// cursor still bounds recovery from below.
    pub async fn load(&self, channel: &str) -> u64 {
        let path = self.path_for(channel);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<CursorFile>(&bytes) {
                Ok(file) => file.offset,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt cursor file");
                    0
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read cursor file");
                0
            }
        }
    }

    pub async fn store(&self, channel: &str, offset: u64) -> Result<(), PersistenceError> {
        let file = CursorFile {
            offset,
            updated_at: Utc::now(),
        };
        write_json_atomic(&self.path_for(channel), &file).await
    }
}
