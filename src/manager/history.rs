//! Manager conversation history, backed by `history.jsonl`.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::runtime::{InputRole, JsonlLog, LogBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    /// Feedback and task results.
    System,
    Cron,
}

impl From<InputRole> for ChatRole {
    fn from(role: InputRole) -> Self {
        match role {
            InputRole::User => Self::User,
            InputRole::System => Self::System,
            InputRole::Cron => Self::Cron,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub role: ChatRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ChatEntry {
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// The newest `retain` entries in memory; every entry on disk.
#[derive(Debug)]
pub struct ChatHistory {
    log: JsonlLog,
    entries: VecDeque<ChatEntry>,
    retain: usize,
}

impl ChatHistory {
    /// Reload the tail of the history file.
    pub async fn load(path: impl Into<PathBuf>, retain: usize) -> Result<Self, PersistenceError> {
        let log = JsonlLog::new(path);
        let batch: LogBatch<ChatEntry> = log.read_from(0).await?;
        let skip = batch.entries.len().saturating_sub(retain);
        Ok(Self {
            log,
            entries: batch.entries.into_iter().skip(skip).collect(),
            retain,
        })
    }

    /// Add an entry to memory, then to disk.
    ///
    /// The in-memory entry stays even when the write fails, so the next
    /// prompt still sees it.
    pub async fn append(&mut self, entry: ChatEntry) -> Result<(), PersistenceError> {
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.retain {
            self.entries.pop_front();
        }
        self.log.append(&entry).await
    }

    /// Entries newest first, the order windowed selection expects.
    pub fn newest_first(&self) -> Vec<&ChatEntry> {
        self.entries.iter().rev().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
