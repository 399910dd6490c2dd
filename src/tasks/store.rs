//! In-memory task collection with the lifecycle transitions and the
//! fingerprint index.
//!
//! Every operation is total: a missing id or a transition the current status
//! does not allow yields `None` and leaves the store untouched. Callers log if
//! they care.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::tasks::model::{
    CancelInfo, NewTask, NextTask, Task, TaskResult, TaskStatus, Usage,
};

/// Outcome of `TaskStore::enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub task: Task,
    /// False when an active task with the same fingerprint was returned instead.
    pub created: bool,
}

/// Fields merged into a task when it reaches a terminal state.
///
/// Timing fields already present on the task are never overwritten.
#[derive(Debug, Clone, Default)]
pub struct CompletionPatch {
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub usage: Option<Usage>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub archive_path: Option<PathBuf>,
}

impl CompletionPatch {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_archive(mut self, path: PathBuf) -> Self {
        self.archive_path = Some(path);
        self
    }
}

/// Task collection in creation order.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: Vec<Task>,
    /// fingerprint -> id of the pending/running task holding it
    active: HashMap<String, Uuid>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store (and its fingerprint index) from recovered tasks.
    pub fn from_tasks(mut tasks: Vec<Task>) -> Self {
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut active = HashMap::new();
        for task in tasks.iter().filter(|t| t.status.is_active()) {
            if let Some(existing) = active.insert(task.fingerprint.clone(), task.id) {
                tracing::warn!(
                    task_id = %task.id,
                    existing = %existing,
                    "Two active tasks share a fingerprint; newest wins the index"
                );
            }
        }
        Self { tasks, active }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// All tasks in creation order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Tasks newest first.
    pub fn recent(&self) -> Vec<&Task> {
        self.tasks.iter().rev().collect()
    }

    /// Clones of every pending/running task.
    pub fn non_terminal(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect()
    }

    pub fn find_active(&self, fingerprint: &str) -> Option<&Task> {
        self.active.get(fingerprint).and_then(|id| self.get(*id))
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Create a pending task, or return the active task holding the same
    /// fingerprint.
    pub fn enqueue(&mut self, request: &NewTask) -> EnqueueOutcome {
        let fingerprint = request.fingerprint();
        if let Some(existing) = self.find_active(&fingerprint) {
            return EnqueueOutcome {
                task: existing.clone(),
                created: false,
            };
        }

        let task = Task::from_request(request);
        self.active.insert(fingerprint, task.id);
        self.tasks.push(task.clone());
        EnqueueOutcome {
            task,
            created: true,
        }
    }

    /// pending -> running, stamping `started_at`.
    pub fn mark_running(&mut self, id: Uuid) -> Option<Task> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Pending {
            return None;
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Some(task.clone())
    }

    /// Count one more provider attempt on a running task.
    pub fn record_attempt(&mut self, id: Uuid) -> Option<u32> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Running {
            return None;
        }
        task.attempts += 1;
        Some(task.attempts)
    }

    /// Stamp completion timing on a running task ahead of its terminal write.
    pub fn record_completion(
        &mut self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Option<Task> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Running {
            return None;
        }
        task.completed_at.get_or_insert(completed_at);
        task.duration_ms.get_or_insert(duration_ms);
        Some(task.clone())
    }

    /// running -> succeeded. A repeat call returns the task unchanged.
    pub fn mark_succeeded(&mut self, id: Uuid, patch: CompletionPatch) -> Option<Task> {
        self.complete(id, TaskStatus::Succeeded, patch)
    }

    /// running -> failed. A repeat call returns the task unchanged.
    pub fn mark_failed(&mut self, id: Uuid, patch: CompletionPatch) -> Option<Task> {
        self.complete(id, TaskStatus::Failed, patch)
    }

    fn complete(&mut self, id: Uuid, target: TaskStatus, patch: CompletionPatch) -> Option<Task> {
        let task = self.get_mut(id)?;
        if task.status == target {
            return Some(task.clone());
        }
        if !task.status.can_transition_to(target) {
            return None;
        }

        task.status = target;
        apply_completion(task, &patch);
        let finished = task.clone();
        self.release(&finished);
        Some(finished)
    }

    /// Record cancel metadata without changing status.
    ///
    /// Also recorded on tasks that already succeeded or failed, so the intent
    /// stays visible even when completion won the race.
    pub fn request_cancel(&mut self, id: Uuid, info: CancelInfo) -> Option<Task> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Canceled && task.cancel.is_none() {
            task.cancel = Some(info);
        }
        Some(task.clone())
    }

    /// Any non-terminal status -> canceled.
    ///
    /// Completion timing recorded before the cancellation landed is preserved;
    /// only `status` and `cancel` are forced. On a task that already succeeded
    /// or failed the status is left alone and only the cancel metadata is
    /// recorded.
    pub fn mark_canceled(
        &mut self,
        id: Uuid,
        info: CancelInfo,
        patch: CompletionPatch,
    ) -> Option<Task> {
        let task = self.get_mut(id)?;
        match task.status {
            TaskStatus::Canceled => return Some(task.clone()),
            TaskStatus::Succeeded | TaskStatus::Failed => {
                if task.cancel.is_none() {
                    task.cancel = Some(info);
                }
                return Some(task.clone());
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        let reason = task
            .cancel
            .as_ref()
            .map(|c| c.reason.clone())
            .unwrap_or_else(|| info.reason.clone());
        if task.cancel.is_none() {
            task.cancel = Some(info);
        }
        task.status = TaskStatus::Canceled;
        let patch = CompletionPatch {
            error: patch.error.or_else(|| Some(format!("canceled: {reason}"))),
            ..patch
        };
        apply_completion(task, &patch);

        let finished = task.clone();
        self.release(&finished);
        Some(finished)
    }

    /// Crash recovery: every running task goes back to pending.
    ///
    /// Returns the demoted ids.
    pub fn demote_running(&mut self) -> Vec<Uuid> {
        let mut demoted = Vec::new();
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Running)
        {
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.completed_at = None;
            task.duration_ms = None;
            demoted.push(task.id);
        }
        demoted
    }

    /// Pending tasks ready to start, best first.
    ///
    /// Skips tasks scheduled in the future and tasks whose `blocked_by` ids
    /// have not succeeded. An id no longer in the store counts as satisfied.
    pub fn runnable(&self, now: DateTime<Utc>) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.is_due(now))
            .filter(|t| self.dependencies_met(t))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        ready
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.blocked_by.iter().all(|dep| match self.get(*dep) {
            Some(d) => d.status == TaskStatus::Succeeded,
            None => true,
        })
    }

    /// First `blocked_by` id of task `id` that already ended failed or
    /// canceled, with its status. Such a task can never become runnable.
    pub fn ended_dependency(&self, id: Uuid) -> Option<(Uuid, TaskStatus)> {
        let task = self.get(id)?;
        task.blocked_by.iter().find_map(|dep| {
            self.get(*dep)
                .map(|d| d.status)
                .filter(|s| matches!(s, TaskStatus::Failed | TaskStatus::Canceled))
                .map(|s| (*dep, s))
        })
    }

    /// Earliest future `scheduled_at` among pending tasks.
    pub fn next_scheduled_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| t.scheduled_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Pending tasks waiting on `id`.
    pub fn dependents_of(&self, id: Uuid) -> Vec<Uuid> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.blocked_by.contains(&id))
            .map(|t| t.id)
            .collect()
    }

    /// Drop the oldest terminal tasks beyond `retain`. Returns how many went.
    pub fn prune_terminal(&mut self, retain: usize) -> usize {
        let mut terminal: Vec<(DateTime<Utc>, Uuid)> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(|t| (t.completed_at.unwrap_or(t.created_at), t.id))
            .collect();
        if terminal.len() <= retain {
            return 0;
        }
        terminal.sort();
        let excess = terminal.len() - retain;
        let doomed: Vec<Uuid> = terminal.into_iter().take(excess).map(|(_, id)| id).collect();
        self.tasks.retain(|t| !doomed.contains(&t.id));
        excess
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn release(&mut self, task: &Task) {
        if self.active.get(&task.fingerprint) == Some(&task.id) {
            self.active.remove(&task.fingerprint);
        }
    }
}

/// Follow-up definitions whose condition matches `status`.
///
/// The caller enqueues them.
pub fn resolve_next_tasks(task: &Task, status: TaskStatus) -> Vec<NextTask> {
    task.next
        .iter()
        .filter(|n| n.when.matches(status))
        .cloned()
        .collect()
}

fn apply_completion(task: &mut Task, patch: &CompletionPatch) {
    let now = Utc::now();
    if task.completed_at.is_none() {
        task.completed_at = Some(patch.completed_at.unwrap_or(now));
    }
    if task.duration_ms.is_none() {
        task.duration_ms = patch
            .duration_ms
            .or_else(|| task.started_at.map(|_| task.elapsed_ms(now)));
    }
    if let Some(usage) = &patch.usage {
        task.usage.get_or_insert_with(Usage::default).merge(usage);
    }
    if task.result.is_none() {
        task.result = Some(TaskResult {
            task_id: task.id,
            title: task.title.clone(),
            profile: task.profile,
            status: task.status,
            output: patch.output.clone().unwrap_or_default(),
            error: patch.error.clone(),
            usage: task.usage.clone(),
            archive_path: patch.archive_path.clone(),
            attempts: task.attempts,
            completed_at: task.completed_at.unwrap_or(now),
            duration_ms: task.duration_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::tasks::model::{CancelSource, NextCondition, Profile};

    fn cancel_info() -> CancelInfo {
        CancelInfo::new("no longer needed", CancelSource::User)
    }

    #[test]
    fn enqueue_twice_returns_same_active_task() {
        let mut store = TaskStore::new();
        let request = NewTask::new("write the changelog").with_title("Changelog");
        let first = store.enqueue(&request);
        let second = store.enqueue(&request);
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.task.id, second.task.id);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn dedup_example_a_b_a() {
        let mut store = TaskStore::new();
        let a = NewTask::new("task A");
        let b = NewTask::new("task B");
        let first = store.enqueue(&a);
        store.enqueue(&b);
        let third = store.enqueue(&a);
        assert!(!third.created);
        assert_eq!(third.task.id, first.task.id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn terminal_task_does_not_block_recreation() {
        let mut store = TaskStore::new();
        let request = NewTask::new("ping the server");
        let first = store.enqueue(&request).task;
        store.mark_running(first.id).unwrap();
        store
            .mark_succeeded(first.id, CompletionPatch::output("pong"))
            .unwrap();

        let again = store.enqueue(&request);
        assert!(again.created);
        assert_ne!(again.task.id, first.id);
    }

    #[test]
    fn mark_running_only_from_pending() {
        let mut store = TaskStore::new();
        let id = store.enqueue(&NewTask::new("a")).task.id;
        let running = store.mark_running(id).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());
        assert!(store.mark_running(id).is_none());
        assert!(store.mark_running(Uuid::new_v4()).is_none());
    }

    #[test]
    fn succeeded_twice_is_idempotent() {
        let mut store = TaskStore::new();
        let id = store.enqueue(&NewTask::new("a")).task.id;
        store.mark_running(id);
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 20,
            ..Default::default()
        };
        let first = store
            .mark_succeeded(id, CompletionPatch::output("done").with_usage(usage.clone()))
            .unwrap();
        let second = store
            .mark_succeeded(id, CompletionPatch::output("again").with_usage(usage))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.usage.unwrap().total_tokens(), 120);
        assert_eq!(second.result.unwrap().output, "done");
    }

    #[test]
    fn success_requires_running() {
        let mut store = TaskStore::new();
        let id = store.enqueue(&NewTask::new("a")).task.id;
        assert!(store.mark_succeeded(id, CompletionPatch::default()).is_none());
        assert!(store.mark_failed(id, CompletionPatch::default()).is_none());
        assert_eq!(store.get(id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn cancel_preserves_recorded_completion() {
        let mut store = TaskStore::new();
        let id = store.enqueue(&NewTask::new("a")).task.id;
        store.mark_running(id);
        let completed_at = Utc::now() - Duration::seconds(5);
        store.record_completion(id, completed_at, 1234).unwrap();

        let canceled = store
            .mark_canceled(id, cancel_info(), CompletionPatch::default())
            .unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert_eq!(canceled.completed_at, Some(completed_at));
        assert_eq!(canceled.duration_ms, Some(1234));
        assert_eq!(canceled.cancel.unwrap().reason, "no longer needed");
    }

    #[test]
    fn cancel_after_success_only_records_intent() {
        let mut store = TaskStore::new();
        let id = store.enqueue(&NewTask::new("a")).task.id;
        store.mark_running(id);
        let done = store
            .mark_succeeded(id, CompletionPatch::output("ok"))
            .unwrap();

        let after = store
            .mark_canceled(id, cancel_info(), CompletionPatch::default())
            .unwrap();
        assert_eq!(after.status, TaskStatus::Succeeded);
        assert_eq!(after.completed_at, done.completed_at);
        assert!(after.cancel.is_some());
    }

    #[test]
    fn pending_cancel_releases_fingerprint() {
        let mut store = TaskStore::new();
        let request = NewTask::new("a");
        let id = store.enqueue(&request).task.id;
        let canceled = store
            .mark_canceled(id, cancel_info(), CompletionPatch::default())
            .unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert!(canceled.duration_ms.is_none());
        assert_eq!(
            canceled.result.unwrap().error.as_deref(),
            Some("canceled: no longer needed")
        );
        assert!(store.enqueue(&request).created);
    }

    #[test]
    fn success_after_cancel_loses() {
        let mut store = TaskStore::new();
        let id = store.enqueue(&NewTask::new("a")).task.id;
        store.mark_running(id);
        store.mark_canceled(id, cancel_info(), CompletionPatch::default());
        assert!(store.mark_succeeded(id, CompletionPatch::output("late")).is_none());
        assert_eq!(store.get(id).unwrap().status, TaskStatus::Canceled);
    }

    #[test]
    fn demote_running_resets_to_pending() {
        let mut store = TaskStore::new();
        let id = store.enqueue(&NewTask::new("a")).task.id;
        store.mark_running(id);
        store.record_attempt(id);
        assert_eq!(store.demote_running(), vec![id]);
        let task = store.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn runnable_orders_by_priority_then_age() {
        let mut store = TaskStore::new();
        let low = store.enqueue(&NewTask::new("low")).task.id;
        let high = store
            .enqueue(&NewTask::new("high").with_priority(5))
            .task
            .id;
        let low2 = store.enqueue(&NewTask::new("low two")).task.id;
        let order: Vec<Uuid> = store.runnable(Utc::now()).iter().map(|t| t.id).collect();
        assert_eq!(order, vec![high, low, low2]);
    }

    #[test]
    fn runnable_skips_blocked_and_future_tasks() {
        let mut store = TaskStore::new();
        let dep = store.enqueue(&NewTask::new("dependency")).task.id;
        let blocked = store
            .enqueue(&NewTask::new("blocked").blocked_by(dep))
            .task
            .id;
        let later = Utc::now() + Duration::hours(1);
        store.enqueue(&NewTask::new("later").scheduled_at(later));

        let ids: Vec<Uuid> = store.runnable(Utc::now()).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![dep]);
        assert_eq!(store.next_scheduled_at(Utc::now()), Some(later));
        assert_eq!(store.dependents_of(dep), vec![blocked]);

        store.mark_running(dep);
        store.mark_succeeded(dep, CompletionPatch::default());
        let ids: Vec<Uuid> = store.runnable(Utc::now()).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![blocked]);
    }

    #[test]
    fn missing_dependency_counts_as_satisfied() {
        let mut store = TaskStore::new();
        let id = store
            .enqueue(&NewTask::new("orphan").blocked_by(Uuid::new_v4()))
            .task
            .id;
        assert_eq!(store.runnable(Utc::now())[0].id, id);
    }

    #[test]
    fn resolve_next_filters_by_condition() {
        let request = NewTask::new("build")
            .with_next(NextTask {
                prompt: "deploy".into(),
                title: None,
                profile: Some(Profile::Specialist),
                when: NextCondition::Succeeded,
            })
            .with_next(NextTask {
                prompt: "report failure".into(),
                title: None,
                profile: None,
                when: NextCondition::Failed,
            })
            .with_next(NextTask {
                prompt: "notify".into(),
                title: None,
                profile: None,
                when: NextCondition::Any,
            });
        let task = Task::from_request(&request);

        let on_success: Vec<String> = resolve_next_tasks(&task, TaskStatus::Succeeded)
            .into_iter()
            .map(|n| n.prompt)
            .collect();
        assert_eq!(on_success, vec!["deploy", "notify"]);
        assert_eq!(resolve_next_tasks(&task, TaskStatus::Canceled).len(), 1);
    }

    #[test]
    fn prune_keeps_newest_terminal() {
        let mut store = TaskStore::new();
        for i in 0..5 {
            let id = store.enqueue(&NewTask::new(format!("t{i}"))).task.id;
            store.mark_running(id);
            store.mark_failed(id, CompletionPatch::error("boom"));
        }
        store.enqueue(&NewTask::new("still pending"));
        assert_eq!(store.prune_terminal(2), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.count(TaskStatus::Pending), 1);
    }

    #[test]
    fn from_tasks_rebuilds_index() {
        let mut original = TaskStore::new();
        let request = NewTask::new("recover me");
        original.enqueue(&request);
        let mut rebuilt = TaskStore::from_tasks(original.non_terminal());
        assert!(!rebuilt.enqueue(&request).created);
    }

    #[test]
    fn ended_dependency_reports_failed_blocker() {
        let mut store = TaskStore::new();
        let ok = store.enqueue(&NewTask::new("fetch data")).task.id;
        let bad = store.enqueue(&NewTask::new("parse data")).task.id;
        for id in [ok, bad] {
            store.mark_running(id);
        }
        store.mark_succeeded(ok, CompletionPatch::output("fetched"));
        store.mark_failed(bad, CompletionPatch::error("bad input"));

        let child = store
            .enqueue(&NewTask::new("report").blocked_by(ok).blocked_by(bad))
            .task
            .id;
        assert_eq!(
            store.ended_dependency(child),
            Some((bad, TaskStatus::Failed))
        );

        let clean = store.enqueue(&NewTask::new("archive").blocked_by(ok)).task.id;
        assert_eq!(store.ended_dependency(clean), None);
        assert_eq!(store.ended_dependency(Uuid::new_v4()), None);
    }
}
