//! The manager loop: drain the logs, wait out the debounce, run a turn.
//!
//! A turn renders the prompt, calls the provider with the manager profile,
//! parses the reply and applies its commands. Cursors are only committed
//! after the turn is recorded, so a crash mid-turn replays the batch.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{ActionParser, Command};
use crate::error::{PersistenceError, ProviderError};
use crate::llm::{Provider, ProviderRequest, run_guarded};
use crate::manager::batch::{TurnBuffer, TurnDecision};
use crate::manager::history::{ChatEntry, ChatHistory, ChatRole};
use crate::manager::prompt::{build_prompt, manager_timeout};
use crate::runtime::{InputEntry, LogBatch, OrchestratorEvent, Runtime};
use crate::tasks::{CancelInfo, CancelSource, Profile, TaskResult, TaskSource, TaskStatus};
use crate::worker::retry_delay;

pub struct ManagerLoop {
    runtime: Arc<Runtime>,
    provider: Arc<dyn Provider>,
    parser: Arc<dyn ActionParser>,
    history: ChatHistory,
    buffer: TurnBuffer,
    consecutive_failures: u32,
}

impl ManagerLoop {
    pub async fn new(
        runtime: Arc<Runtime>,
        provider: Arc<dyn Provider>,
        parser: Arc<dyn ActionParser>,
    ) -> Result<Self, PersistenceError> {
        let history =
            ChatHistory::load(&runtime.paths().history_log, runtime.config().history_retain)
                .await?;
        let buffer = TurnBuffer::new(runtime.cursors().await);
        Ok(Self {
            runtime,
            provider,
            parser,
            history,
            buffer,
            consecutive_failures: 0,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(history = self.history.len(), "Manager loop started");
        let debounce = self.runtime.config().debounce;
        let max_result_wait = self.runtime.config().max_result_wait;

        while !self.runtime.is_stopped() {
            if let Err(e) = self.drain_logs().await {
                warn!(error = %e, "Failed to read manager queues");
            }

            match self.buffer.decide(Instant::now(), debounce, max_result_wait) {
                TurnDecision::Fire => self.fire_turn().await,
                TurnDecision::Wait(wait) => {
                    let runtime = Arc::clone(&self.runtime);
                    runtime
                        .signals()
                        .manager
                        .wait(wait, || runtime.is_stopped())
                        .await;
                }
            }
        }

        info!(
            buffered_inputs = self.buffer.inputs.len(),
            buffered_results = self.buffer.results.len(),
            "Manager loop stopped"
        );
    }

    /// Move new log lines into the buffer.
    async fn drain_logs(&mut self) -> Result<(), PersistenceError> {
        let now = Instant::now();
        let inputs: LogBatch<InputEntry> = self
            .runtime
            .inputs_log()
            .read_from(self.buffer.offsets.inputs)
            .await?;
        let results: LogBatch<TaskResult> = self
            .runtime
            .results_log()
            .read_from(self.buffer.offsets.results)
            .await?;
        if !inputs.entries.is_empty() || !results.entries.is_empty() {
            debug!(
                inputs = inputs.entries.len(),
                results = results.entries.len(),
                "Buffered manager queue entries"
            );
        }
        self.buffer
            .push_inputs(inputs.entries, inputs.next_offset, now);
        self.buffer
            .push_results(results.entries, results.next_offset, now);
        Ok(())
    }

    /// Run one turn over the current buffer.
    pub async fn fire_turn(&mut self) {
        let config = self.runtime.config().clone();
        let tasks = self.runtime.get_tasks(None).await;
        let prompt = build_prompt(
            &config,
            &self.history,
            &tasks,
            &self.buffer.inputs,
            &self.buffer.results,
        );
        let timeout = manager_timeout(&config, prompt.len());
        info!(
            inputs = self.buffer.inputs.len(),
            results = self.buffer.results.len(),
            prompt_bytes = prompt.len(),
            timeout_secs = timeout.as_secs(),
            "Manager turn"
        );

        let request = ProviderRequest::new(prompt, Profile::Manager, timeout);
        match run_guarded(
            self.provider.as_ref(),
            request,
            self.runtime.shutdown_token(),
        )
        .await
        {
            Ok(response) => {
                self.consecutive_failures = 0;
                self.complete_turn(&response.output).await;
            }
            Err(ProviderError::Canceled) => {
                debug!("Manager turn interrupted by shutdown; batch will replay");
            }
            Err(e) => self.turn_failed(e).await,
        }
    }

    async fn complete_turn(&mut self, raw: &str) {
        let parsed = self.parser.parse(raw);
        let mut feedback: Vec<String> = parsed
            .errors
            .iter()
            .map(|e| format!("rejected action: {e}"))
            .collect();
        for command in parsed.commands {
            feedback.push(self.apply(command).await);
        }

        self.record_batch().await;
        if !parsed.visible_text.is_empty() {
            self.record(ChatEntry::new(ChatRole::Assistant, parsed.visible_text.clone()))
                .await;
            self.runtime.emit(OrchestratorEvent::ManagerReply {
                text: parsed.visible_text,
            });
        }
        for line in feedback {
            debug!(feedback = %line, "Manager action feedback");
            self.record(ChatEntry::new(ChatRole::System, line)).await;
        }

        self.commit().await;
    }

    async fn turn_failed(&mut self, error: ProviderError) {
        self.consecutive_failures += 1;
        let limit = self.runtime.config().manager_max_turn_failures;

        if self.consecutive_failures >= limit {
            warn!(
                failures = self.consecutive_failures,
                error = %error,
                "Manager turn keeps failing; committing batch without a reply"
            );
            self.record_batch().await;
            self.record(ChatEntry::new(
                ChatRole::System,
                format!(
                    "manager turn failed {} times, last error: {error}",
                    self.consecutive_failures
                ),
            ))
            .await;
            self.commit().await;
            self.consecutive_failures = 0;
            return;
        }

        let delay = retry_delay(self.runtime.config(), self.consecutive_failures);
        warn!(
            failures = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Manager turn failed; batch kept for retry"
        );
        tokio::select! {
            _ = self.runtime.shutdown_token().cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Apply one command and describe what happened.
    async fn apply(&mut self, command: Command) -> String {
        let debounce_key = command.debounce_key();
        match command {
            Command::CreateTask(mut request) => {
                if let Some(key) = debounce_key
                    && self.runtime.is_debounced_create(&key, Utc::now()).await
                {
                    return format!("skipped duplicate create: {}", request.resolved_title());
                }
                request.source = TaskSource::Manager;
                let outcome = self.runtime.enqueue(request).await;
                if outcome.created {
                    format!("created task {} ({})", outcome.task.id, outcome.task.title)
                } else {
                    format!(
                        "task {} already active ({})",
                        outcome.task.id, outcome.task.title
                    )
                }
            }
            Command::CancelTask { task_id, reason } => {
                let info = CancelInfo::new(
                    reason.unwrap_or_else(|| "canceled by manager".to_string()),
                    CancelSource::Manager,
                );
                match self.runtime.cancel(task_id, info).await {
                    None => format!("unknown task {task_id}"),
                    Some(task) => match task.status {
                        TaskStatus::Canceled => format!("canceled task {task_id}"),
                        TaskStatus::Running => {
                            format!("cancel requested for running task {task_id}")
                        }
                        status => format!("task {task_id} already {status}"),
                    },
                }
            }
            command @ Command::CreateCron { .. } => match command.to_cron_job() {
                Ok(job) => {
                    let job = self.runtime.add_cron_job(job).await;
                    let next = job
                        .next_run_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    format!("created cron job {} ({}), next run {next}", job.id, job.name)
                }
                Err(e) => format!("rejected action: {e}"),
            },
            Command::DisableCron { job_id, reason } => {
                let reason = reason.unwrap_or_else(|| "disabled by manager".to_string());
                match self.runtime.disable_cron_job(job_id, &reason).await {
                    Some(_) => format!("disabled cron job {job_id}"),
                    None => format!("unknown cron job {job_id}"),
                }
            }
            Command::SummarizeResult { task_id, summary } => {
                self.runtime.emit(OrchestratorEvent::ManagerReply {
                    text: summary.clone(),
                });
                self.record(ChatEntry::new(
                    ChatRole::Assistant,
                    format!("summary of task {task_id}: {summary}"),
                ))
                .await;
                format!("summarized task {task_id}")
            }
        }
    }

    /// Move the buffered inputs and results into history.
    async fn record_batch(&mut self) {
        let inputs: Vec<ChatEntry> = self
            .buffer
            .inputs
            .iter()
            .map(|input| ChatEntry {
                role: input.role.into(),
                text: input.text.clone(),
                created_at: input.created_at,
            })
            .collect();
        let results: Vec<ChatEntry> = self
            .buffer
            .results
            .iter()
            .map(|r| {
                let mut text = format!("task {} {}: {}", r.task_id, r.status, r.title);
                if let Some(error) = &r.error {
                    text.push_str(&format!(" ({error})"));
                }
                ChatEntry::new(ChatRole::System, text)
            })
            .collect();

        for entry in inputs.into_iter().chain(results) {
            self.record(entry).await;
        }
    }

    async fn record(&mut self, entry: ChatEntry) {
        if let Err(e) = self.history.append(entry).await {
            warn!(error = %e, "Failed to append manager history");
        }
    }

    /// Commit the buffered offsets and clear the buffer.
    async fn commit(&mut self) {
        if let Err(e) = self.runtime.commit_cursors(self.buffer.offsets).await {
            warn!(error = %e, "Failed to commit queue cursors; batch may replay");
        }
        self.buffer.clear();
    }
}
