//! The runtime aggregate shared by every loop.
//!
//! One `Runtime` per orchestrator instance, passed around as `Arc<Runtime>`.
//! All task and cron mutation goes through its mutex, which is only held for
//! synchronous sections; file writes, provider calls and signal waits happen
//! after the guard is dropped.

pub mod event;
pub mod persist;
pub mod queue;
pub mod state;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{OrchestratorConfig, RuntimePaths};
use crate::cron::CronJob;
use crate::error::{Error, PersistenceError};
use crate::signal::Signals;
use crate::tasks::{
    CancelInfo, CancelSource, CompletionPatch, EnqueueOutcome, NewTask, Task, TaskResult,
    TaskStatus, TaskStore, resolve_next_tasks,
};

pub use event::{EVENT_CHANNEL_CAPACITY, OrchestratorEvent};
pub use persist::{RuntimeSnapshot, hydrate, load_snapshot, write_archive, write_json_atomic};
pub use queue::{CursorStore, InputEntry, InputRole, JsonlLog, LogBatch};
pub use state::{QueueCursors, RuntimeState};

/// Cursor channel names (file stems under `cursors/`).
pub const INPUTS_CHANNEL: &str = "inputs";
pub const RESULTS_CHANNEL: &str = "results";

/// Point-in-time counters for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub stopped: bool,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
    pub in_flight: usize,
    pub cron_jobs: usize,
    pub cursors: QueueCursors,
}

pub struct Runtime {
    config: OrchestratorConfig,
    paths: RuntimePaths,
    state: Mutex<RuntimeState>,
    signals: Signals,
    /// Fired once on shutdown; `is_stopped()` reads it.
    shutdown: CancellationToken,
    inputs: JsonlLog,
    results: JsonlLog,
    cursor_store: CursorStore,
    /// Serialises snapshot writes so they land in capture order.
    persist_lock: Mutex<()>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Runtime {
    /// Hydrate from `config.data_dir` and return a runtime ready to start.
    pub async fn open(config: OrchestratorConfig) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let paths = config.paths();
        tokio::fs::create_dir_all(&paths.data_dir)
            .await
            .map_err(|e| PersistenceError::io(&paths.data_dir, e))?;

        let cursor_store = CursorStore::new(&paths.cursor_dir);
        let cursor_files = QueueCursors {
            inputs: cursor_store.load(INPUTS_CHANNEL).await,
            results: cursor_store.load(RESULTS_CHANNEL).await,
        };
        let snapshot = load_snapshot(&paths.state_file).await?;
        let state = hydrate(snapshot, cursor_files);
        info!(
            tasks = state.tasks.len(),
            cron_jobs = state.cron_jobs.len(),
            inputs_cursor = state.cursors.inputs,
            results_cursor = state.cursors.results,
            "Runtime state hydrated"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let runtime = Arc::new(Self {
            inputs: JsonlLog::new(&paths.inputs_log),
            results: JsonlLog::new(&paths.results_log),
            cursor_store,
            config,
            paths,
            state: Mutex::new(state),
            signals: Signals::new(),
            shutdown: CancellationToken::new(),
            persist_lock: Mutex::new(()),
            events,
        });

        // Record demotions right away.
        runtime.persist_logged().await;
        Ok(runtime)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn inputs_log(&self) -> &JsonlLog {
        &self.inputs
    }

    pub fn results_log(&self) -> &JsonlLog {
        &self.results
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Set `stopped` and wake every loop so it can observe it.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.signals.notify_all();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().await
    }

    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
        self.signals.ui.notify();
    }

    // ── Tasks ────────────────────────────────────────────────────────────

    /// Create a task, or return the active one holding the same fingerprint.
    ///
    /// A task blocked by a dependency that already failed or was canceled
    /// can never run, so it is canceled on the spot and returned canceled.
    pub async fn enqueue(&self, request: NewTask) -> EnqueueOutcome {
        let (outcome, blocked) = self.create(request).await;
        if let Some(task) = blocked {
            self.finish(vec![task]).await;
        }
        outcome
    }

    /// Insert and announce a task. The second value is the task itself when
    /// it was canceled for an ended dependency; the caller runs it through
    /// `finish`.
    async fn create(&self, request: NewTask) -> (EnqueueOutcome, Option<Task>) {
        let (mut outcome, blocked) = {
            let mut state = self.state.lock().await;
            let outcome = state.tasks.enqueue(&request);
            let ended = if outcome.created {
                state.tasks.ended_dependency(outcome.task.id)
            } else {
                None
            };
            let blocked = ended.and_then(|(dep, status)| {
                let info = CancelInfo::new(
                    format!("dependency {dep} {status}"),
                    CancelSource::Dependency,
                );
                state
                    .tasks
                    .mark_canceled(outcome.task.id, info, CompletionPatch::default())
            });
            (outcome, blocked)
        };

        if !outcome.created {
            debug!(task_id = %outcome.task.id, "Enqueue matched an active task");
            return (outcome, None);
        }

        info!(
            task_id = %outcome.task.id,
            title = %outcome.task.title,
            profile = %outcome.task.profile,
            source = ?outcome.task.source,
            "Task created"
        );
        self.emit(OrchestratorEvent::TaskCreated {
            task: outcome.task.clone(),
        });

        match blocked {
            Some(canceled) => {
                warn!(
                    task_id = %canceled.id,
                    reason = canceled.cancel.as_ref().map(|c| c.reason.as_str()).unwrap_or_default(),
                    "Task blocked by an ended dependency; canceled"
                );
                outcome.task = canceled.clone();
                (outcome, Some(canceled))
            }
            None => {
                self.signals.worker.notify();
                self.persist_logged().await;
                (outcome, None)
            }
        }
    }

    /// Cancel a task.
    ///
    /// A pending task is canceled on the spot. A running task records the
    /// request and has its token fired; the worker writes the terminal
    /// status once the provider call unwinds. On a finished task only the
    /// cancel metadata is recorded.
    pub async fn cancel(&self, id: Uuid, info: CancelInfo) -> Option<Task> {
        enum Action {
            Finished(Task),
            Interrupt(Task, CancellationToken),
            Recorded(Task),
        }

        let action = {
            let mut state = self.state.lock().await;
            let status = state.tasks.get(id)?.status;
            let token = state.running_controllers.get(&id).cloned();
            match (status, token) {
                (TaskStatus::Running, Some(token)) => {
                    Action::Interrupt(state.tasks.request_cancel(id, info)?, token)
                }
                (TaskStatus::Pending | TaskStatus::Running, None) => {
                    let task = state
                        .tasks
                        .mark_canceled(id, info, CompletionPatch::default())?;
                    state.running_controllers.remove(&id);
                    Action::Finished(task)
                }
                _ => Action::Recorded(state.tasks.request_cancel(id, info)?),
            }
        };

        match action {
            Action::Finished(task) => {
                info!(task_id = %id, "Task canceled before it started");
                self.finish(vec![task.clone()]).await;
                Some(task)
            }
            Action::Interrupt(task, token) => {
                info!(task_id = %id, "Cancelling running task");
                token.cancel();
                self.persist_logged().await;
                Some(task)
            }
            Action::Recorded(task) => {
                debug!(task_id = %id, status = %task.status, "Cancel recorded on finished task");
                self.persist_logged().await;
                Some(task)
            }
        }
    }

    /// Claim the best runnable task if there is spare capacity.
    ///
    /// The task is marked running and gets a fresh cancellation token in
    /// `running_controllers` under the same lock, so a concurrent cancel sees
    /// either a pending task or a running one with a token.
    pub async fn start_next(&self, now: DateTime<Utc>) -> Option<(Task, CancellationToken)> {
        if self.is_stopped() {
            return None;
        }
        let (task, token) = {
            let mut state = self.state.lock().await;
            if state.running_controllers.len() >= self.config.max_concurrent {
                return None;
            }
            let id = state.tasks.runnable(now).first()?.id;
            let task = state.tasks.mark_running(id)?;
            let token = CancellationToken::new();
            state.running_controllers.insert(id, token.clone());
            (task, token)
        };

        self.emit(OrchestratorEvent::task_updated(&task));
        self.persist_logged().await;
        Some((task, token))
    }

    pub async fn record_attempt(&self, id: Uuid) -> Option<u32> {
        let attempt = self.state.lock().await.tasks.record_attempt(id);
        if attempt.is_some() {
            self.persist_logged().await;
        }
        attempt
    }

    pub async fn record_completion(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Option<Task> {
        self.state
            .lock()
            .await
            .tasks
            .record_completion(id, completed_at, duration_ms)
    }

    pub async fn mark_succeeded(&self, id: Uuid, patch: CompletionPatch) -> Option<Task> {
        self.settle(id, |tasks| tasks.mark_succeeded(id, patch))
            .await
    }

    pub async fn mark_failed(&self, id: Uuid, patch: CompletionPatch) -> Option<Task> {
        self.settle(id, |tasks| tasks.mark_failed(id, patch)).await
    }

    pub async fn mark_canceled(
        &self,
        id: Uuid,
        info: CancelInfo,
        patch: CompletionPatch,
    ) -> Option<Task> {
        self.settle(id, |tasks| tasks.mark_canceled(id, info, patch))
            .await
    }

    /// Forget the controller of a task that left `running` some other way.
    pub async fn release_controller(&self, id: Uuid) {
        self.state.lock().await.running_controllers.remove(&id);
    }

    /// Apply a terminal transition, then run the terminal bookkeeping if this
    /// call is the one that ended the task.
    async fn settle<F>(&self, id: Uuid, apply: F) -> Option<Task>
    where
        F: FnOnce(&mut TaskStore) -> Option<Task>,
    {
        let (task, ended_here) = {
            let mut state = self.state.lock().await;
            let was_active = state.tasks.get(id).is_some_and(|t| t.status.is_active());
            let task = apply(&mut state.tasks)?;
            if task.status.is_terminal() {
                state.running_controllers.remove(&id);
            }
            let ended_here = was_active && task.status.is_terminal();
            (task, ended_here)
        };

        if ended_here {
            self.finish(vec![task.clone()]).await;
        }
        Some(task)
    }

    /// Terminal bookkeeping: append results, cancel dependents of failed or
    /// canceled tasks, enqueue follow-ups, then wake the manager and worker
    /// and persist.
    async fn finish(&self, finished: Vec<Task>) {
        let mut queue: VecDeque<Task> = finished.into();

        while let Some(task) = queue.pop_front() {
            info!(
                task_id = %task.id,
                status = %task.status,
                attempts = task.attempts,
                duration_ms = ?task.duration_ms,
                "Task finished"
            );

            if let Some(result) = &task.result {
                let entry = self.result_log_entry(result);
                if let Err(e) = self.results.append(&entry).await {
                    error!(task_id = %task.id, error = %e, "Failed to append task result");
                }
            }
            self.emit(OrchestratorEvent::task_updated(&task));

            if matches!(task.status, TaskStatus::Failed | TaskStatus::Canceled) {
                let reason = format!("dependency {} {}", task.id, task.status);
                let mut state = self.state.lock().await;
                let dependents = state.tasks.dependents_of(task.id);
                for dep in dependents {
                    let info = CancelInfo::new(reason.clone(), CancelSource::Dependency);
                    if let Some(canceled) =
                        state
                            .tasks
                            .mark_canceled(dep, info, CompletionPatch::default())
                    {
                        queue.push_back(canceled);
                    }
                }
            }

            for next in resolve_next_tasks(&task, task.status) {
                if let (_, Some(blocked)) = self.create(NewTask::from(&next)).await {
                    queue.push_back(blocked);
                }
            }
        }

        let pruned = self
            .state
            .lock()
            .await
            .tasks
            .prune_terminal(self.config.retain_terminal_tasks);
        if pruned > 0 {
            debug!(pruned, "Pruned terminal tasks from memory");
        }

        self.signals.manager.notify();
        self.signals.worker.notify();
        self.persist_logged().await;
    }

    fn result_log_entry(&self, result: &TaskResult) -> TaskResult {
        let mut entry = result.clone();
        entry.output = truncate(&entry.output, self.config.result_output_limit);
        entry
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn get_status(&self) -> RuntimeStatus {
        let state = self.state.lock().await;
        RuntimeStatus {
            stopped: self.is_stopped(),
            pending: state.tasks.count(TaskStatus::Pending),
            running: state.tasks.count(TaskStatus::Running),
            succeeded: state.tasks.count(TaskStatus::Succeeded),
            failed: state.tasks.count(TaskStatus::Failed),
            canceled: state.tasks.count(TaskStatus::Canceled),
            in_flight: state.running_controllers.len(),
            cron_jobs: state.cron_jobs.iter().filter(|j| j.enabled).count(),
            cursors: state.cursors,
        }
    }

    /// Tasks newest first, optionally filtered by status.
    pub async fn get_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let state = self.state.lock().await;
        state
            .tasks
            .recent()
            .into_iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect()
    }

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    pub async fn earliest_scheduled(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.state.lock().await.tasks.next_scheduled_at(now)
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.running_controllers.len()
    }

    // ── Inputs, cursors, debounce ────────────────────────────────────────

    /// Append an input line and wake the manager.
    pub async fn submit_input(
        &self,
        text: impl Into<String>,
        role: InputRole,
    ) -> Result<InputEntry, PersistenceError> {
        let entry = InputEntry::new(text, role);
        self.inputs.append(&entry).await?;
        debug!(input_id = %entry.id, role = ?entry.role, "Input appended");
        self.signals.manager.notify();
        Ok(entry)
    }

    pub async fn cursors(&self) -> QueueCursors {
        self.state.lock().await.cursors
    }

    /// Advance the consumption cursors: cursor files first, snapshot second.
    pub async fn commit_cursors(&self, cursors: QueueCursors) -> Result<(), PersistenceError> {
        self.cursor_store.store(INPUTS_CHANNEL, cursors.inputs).await?;
        self.cursor_store
            .store(RESULTS_CHANNEL, cursors.results)
            .await?;
        {
            let mut state = self.state.lock().await;
            state.cursors = state.cursors.max(cursors);
        }
        self.persist().await
    }

    /// Whether a create-task command for `key` repeats a recent one.
    pub async fn is_debounced_create(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.state.lock().await.is_debounced_create(
            key,
            now,
            self.config.create_debounce,
            self.config.debounce_prune_threshold,
        )
    }

    // ── Cron ─────────────────────────────────────────────────────────────

    pub async fn add_cron_job(&self, job: CronJob) -> CronJob {
        info!(job_id = %job.id, name = %job.name, next_run_at = ?job.next_run_at, "Cron job added");
        self.state.lock().await.cron_jobs.push(job.clone());
        self.signals.cron.notify();
        self.persist_logged().await;
        job
    }

    /// Disable a job for good. Disabling twice keeps the first reason.
    pub async fn disable_cron_job(&self, id: Uuid, reason: &str) -> Option<CronJob> {
        let job = {
            let mut state = self.state.lock().await;
            let job = state.cron_job_mut(id)?;
            if job.disable(reason) {
                info!(job_id = %id, reason, "Cron job disabled");
            }
            job.clone()
        };
        self.signals.cron.notify();
        self.persist_logged().await;
        Some(job)
    }

    pub async fn cron_jobs(&self) -> Vec<CronJob> {
        self.state.lock().await.cron_jobs.clone()
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Write the snapshot atomically.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = RuntimeSnapshot::capture(&*self.state.lock().await);
        write_json_atomic(&self.paths.state_file, &snapshot).await
    }

    /// `persist()`, logging instead of failing. Durability is best-effort.
    pub async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist runtime snapshot");
        }
    }
}

/// Cut `s` to at most `max` bytes on a char boundary, marking the cut.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
