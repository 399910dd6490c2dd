//! Public facade: open a runtime, start the loops, shut them down.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::actions::ActionParser;
use crate::config::OrchestratorConfig;
use crate::cron::{CronJob, spawn_cron_loop};
use crate::error::{Error, ProtocolError};
use crate::llm::Provider;
use crate::manager::ManagerLoop;
use crate::runtime::{InputEntry, InputRole, Runtime, RuntimeStatus};
use crate::tasks::{CancelInfo, CancelSource, EnqueueOutcome, NewTask, Task, TaskStatus};
use crate::worker::spawn_worker_pool;

pub use crate::runtime::OrchestratorEvent;

/// One orchestrator instance: a hydrated runtime plus the manager, worker
/// pool and cron loops running over it.
pub struct Orchestrator {
    runtime: Arc<Runtime>,
    worker_provider: Arc<dyn Provider>,
    manager_provider: Arc<dyn Provider>,
    parser: Arc<dyn ActionParser>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Orchestrator {
    /// Hydrate the runtime from `config.data_dir`. Nothing runs until
    /// [`start`](Self::start).
    pub async fn open(
        config: OrchestratorConfig,
        worker_provider: Arc<dyn Provider>,
        manager_provider: Arc<dyn Provider>,
        parser: Arc<dyn ActionParser>,
    ) -> Result<Self, Error> {
        let runtime = Runtime::open(config).await?;
        Ok(Self {
            runtime,
            worker_provider,
            manager_provider,
            parser,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker pool, manager and cron loops. Calling it again while
    /// they run is a no-op.
    pub async fn start(&self) -> Result<(), Error> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Ok(());
        }

        let manager = ManagerLoop::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.manager_provider),
            Arc::clone(&self.parser),
        )
        .await?;

        handles.push((
            "worker",
            spawn_worker_pool(Arc::clone(&self.runtime), Arc::clone(&self.worker_provider)),
        ));
        handles.push(("manager", manager.spawn()));
        handles.push(("cron", spawn_cron_loop(Arc::clone(&self.runtime))));

        info!(
            data_dir = %self.runtime.paths().data_dir.display(),
            max_concurrent = self.runtime.config().max_concurrent,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop every loop, drain in-flight work and write a final snapshot.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.runtime.stop();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let (names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;
        for (name, result) in names.into_iter().zip(joined) {
            if let Err(e) = result {
                error!(loop_name = name, error = %e, "Loop ended abnormally");
            }
        }

        self.runtime.persist_logged().await;
        info!("Orchestrator stopped");
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.runtime.subscribe()
    }

    /// Queue a task on behalf of a user.
    pub async fn enqueue(&self, request: NewTask) -> Result<EnqueueOutcome, Error> {
        if request.prompt.trim().is_empty() {
            return Err(ProtocolError::Invalid {
                command: "create_task".to_string(),
                reason: "prompt is empty".to_string(),
            }
            .into());
        }
        Ok(self.runtime.enqueue(request).await)
    }

    /// Cancel a task on behalf of a user. `None` if the id is unknown.
    pub async fn cancel(&self, id: Uuid, reason: impl Into<String>) -> Option<Task> {
        self.runtime
            .cancel(id, CancelInfo::new(reason, CancelSource::User))
            .await
    }

    pub async fn get_status(&self) -> RuntimeStatus {
        self.runtime.get_status().await
    }

    pub async fn get_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.runtime.get_tasks(status).await
    }

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        self.runtime.get_task(id).await
    }

    /// Hand a user message to the manager.
    pub async fn submit_input(&self, text: impl Into<String>) -> Result<InputEntry, Error> {
        Ok(self.runtime.submit_input(text, InputRole::User).await?)
    }

    pub async fn add_cron_job(&self, job: CronJob) -> CronJob {
        self.runtime.add_cron_job(job).await
    }

    pub async fn disable_cron_job(&self, id: Uuid, reason: &str) -> Option<CronJob> {
        self.runtime.disable_cron_job(id, reason).await
    }

    pub async fn cron_jobs(&self) -> Vec<CronJob> {
        self.runtime.cron_jobs().await
    }
}
