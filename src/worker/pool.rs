//! Worker pool driver.
//!
//! Claims runnable tasks while there is capacity, runs each one on its own
//! tokio task, and otherwise parks on the worker signal. The signal is
//! notified on enqueue and whenever a task finishes, so there is no polling;
//! `worker_tick` is only a fallback, shortened when a deferred task comes due
//! sooner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::llm::Provider;
use crate::runtime::Runtime;
use crate::tasks::CompletionPatch;
use crate::worker::execute::run_task;

pub struct WorkerPool {
    runtime: Arc<Runtime>,
    provider: Arc<dyn Provider>,
    /// Supervisors, one per running task; each yields its task id.
    in_flight: JoinSet<Uuid>,
    /// Abort handles of the inner execution tasks.
    executions: HashMap<Uuid, AbortHandle>,
}

impl WorkerPool {
    pub fn new(runtime: Arc<Runtime>, provider: Arc<dyn Provider>) -> Self {
        Self {
            runtime,
            provider,
            in_flight: JoinSet::new(),
            executions: HashMap::new(),
        }
    }

    /// Spawn the driver loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            max_concurrent = self.runtime.config().max_concurrent,
            "Worker pool started"
        );

        while !self.runtime.is_stopped() {
            self.fill().await;

            let wait = self.next_wait().await;
            let runtime = Arc::clone(&self.runtime);
            tokio::select! {
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.reap(joined);
                }
                _ = runtime.signals().worker.wait(wait, || runtime.is_stopped()) => {}
            }
        }

        self.drain().await;
        info!("Worker pool stopped");
    }

    /// Start tasks until capacity or runnable work runs out.
    async fn fill(&mut self) {
        while let Some((task, token)) = self.runtime.start_next(Utc::now()).await {
            let id = task.id;
            let execution = tokio::spawn(run_task(
                Arc::clone(&self.runtime),
                Arc::clone(&self.provider),
                task,
                token,
            ));
            self.executions.insert(id, execution.abort_handle());

            let runtime = Arc::clone(&self.runtime);
            self.in_flight.spawn(async move {
                match execution.await {
                    Ok(()) => {}
                    Err(e) if e.is_panic() => {
                        error!(task_id = %id, "Task execution panicked");
                        let patch = CompletionPatch::error(format!("worker panicked: {e}"));
                        if runtime.mark_failed(id, patch).await.is_none() {
                            runtime.release_controller(id).await;
                        }
                    }
                    // Aborted during shutdown: stays running in the snapshot.
                    Err(_) => {}
                }
                id
            });
            debug!(task_id = %id, in_flight = self.executions.len(), "Task dispatched");
        }
    }

    fn reap(&mut self, joined: Result<Uuid, tokio::task::JoinError>) {
        match joined {
            Ok(id) => {
                self.executions.remove(&id);
            }
            Err(e) => warn!(error = %e, "Task supervisor ended abnormally"),
        }
    }

    /// `worker_tick`, or less if a scheduled task comes due sooner.
    async fn next_wait(&self) -> Duration {
        let tick = self.runtime.config().worker_tick;
        let now = Utc::now();
        wait_until(self.runtime.earliest_scheduled(now).await, now, tick)
    }

    /// Let in-flight tasks finish for up to `drain_timeout`, then abort the
    /// rest. Aborted tasks stay `running` and come back as pending on the
    /// next start.
    async fn drain(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let timeout = self.runtime.config().drain_timeout;
        info!(
            in_flight = self.in_flight.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Draining worker pool"
        );

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.in_flight.join_next().await {
                self.reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                aborted = self.executions.len(),
                "Drain timed out; aborting remaining tasks"
            );
            for handle in self.executions.values() {
                handle.abort();
            }
            while let Some(joined) = self.in_flight.join_next().await {
                self.reap(joined);
            }
        }
    }
}

fn wait_until(next: Option<DateTime<Utc>>, now: DateTime<Utc>, tick: Duration) -> Duration {
    match next {
        Some(at) => (at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(tick),
        None => tick,
    }
}

/// Spawn a worker pool over `runtime`.
pub fn spawn_worker_pool(runtime: Arc<Runtime>, provider: Arc<dyn Provider>) -> JoinHandle<()> {
    WorkerPool::new(runtime, provider).spawn()
}
