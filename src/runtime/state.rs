//! Process-wide mutable state, guarded by the runtime's mutex.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cron::CronJob;
use crate::tasks::TaskStore;

/// Byte offsets marking how far each append-only log has been consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCursors {
    pub inputs: u64,
    pub results: u64,
}

impl QueueCursors {
    /// Field-wise maximum. Recovery never rewinds below either source.
    pub fn max(self, other: QueueCursors) -> QueueCursors {
        QueueCursors {
            inputs: self.inputs.max(other.inputs),
            results: self.results.max(other.results),
        }
    }
}

/// Tasks, cron jobs, cancellation controllers, create-debounce map, cursors.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub tasks: TaskStore,
    pub cron_jobs: Vec<CronJob>,
    /// Cancellation token of every task currently executing.
    pub running_controllers: HashMap<Uuid, CancellationToken>,
    /// Create-task semantic key -> last attempt.
    pub create_debounce: HashMap<String, DateTime<Utc>>,
    pub cursors: QueueCursors,
}

impl RuntimeState {
    /// Whether a create for `key` repeats one seen within `window`.
    ///
    /// Records `now` for the key when it is not a repeat. The map is pruned
    /// once it grows past `prune_threshold`.
    pub fn is_debounced_create(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        prune_threshold: usize,
    ) -> bool {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        if let Some(last) = self.create_debounce.get(key)
            && now.signed_duration_since(*last) < window
        {
            return true;
        }

        self.create_debounce.insert(key.to_string(), now);
        if self.create_debounce.len() > prune_threshold {
            self.prune_create_debounce(now, window);
        }
        false
    }

    /// Drop entries older than four debounce windows.
    fn prune_create_debounce(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        let horizon = window.checked_mul(4).unwrap_or(chrono::Duration::MAX);
        let before = self.create_debounce.len();
        self.create_debounce
            .retain(|_, last| now.signed_duration_since(*last) < horizon);
        tracing::debug!(
            dropped = before - self.create_debounce.len(),
            "Pruned create debounce map"
        );
    }

    pub fn cron_job_mut(&mut self, id: Uuid) -> Option<&mut CronJob> {
        self.cron_jobs.iter_mut().find(|j| j.id == id)
    }

    /// Earliest pending cron fire among enabled jobs.
    pub fn next_cron_run(&self) -> Option<DateTime<Utc>> {
        self.cron_jobs
            .iter()
            .filter(|j| j.enabled)
            .filter_map(|j| j.next_run_at)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(120);

    #[test]
    fn cursor_max_is_fieldwise() {
        let a = QueueCursors {
            inputs: 10,
            results: 3,
        };
        let b = QueueCursors {
            inputs: 4,
            results: 9,
        };
        assert_eq!(
            a.max(b),
            QueueCursors {
                inputs: 10,
                results: 9
            }
        );
    }

    #[test]
    fn repeat_create_within_window_is_debounced() {
        let mut state = RuntimeState::default();
        let now = Utc::now();
        assert!(!state.is_debounced_create("k", now, WINDOW, 100));
        assert!(state.is_debounced_create("k", now + chrono::Duration::seconds(30), WINDOW, 100));
        assert!(!state.is_debounced_create("k", now + chrono::Duration::seconds(200), WINDOW, 100));
        assert!(!state.is_debounced_create("other", now, WINDOW, 100));
    }

    #[test]
    fn prune_drops_only_stale_entries() {
        let mut state = RuntimeState::default();
        let old = Utc::now() - chrono::Duration::hours(1);
        for i in 0..4 {
            state.is_debounced_create(&format!("old-{i}"), old, WINDOW, 100);
        }
        let now = Utc::now();
        state.is_debounced_create("fresh-1", now, WINDOW, 100);
        state.is_debounced_create("fresh-2", now, WINDOW, 5);
        assert_eq!(state.create_debounce.len(), 2);
        assert!(state.create_debounce.contains_key("fresh-1"));
    }
}
