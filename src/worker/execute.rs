//! Running a single task: provider attempts, backoff, terminal write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::llm::{Provider, ProviderRequest, ProviderResponse, run_guarded};
use crate::runtime::{Runtime, write_archive};
use crate::tasks::{CancelInfo, CancelSource, CompletionPatch, Task};

/// How the attempt loop ended.
#[derive(Debug)]
enum Outcome {
    Succeeded(ProviderResponse),
    /// Attempts exhausted; carries the last error verbatim.
    Failed(String),
    Canceled,
    /// The task left `running` under us (nothing left to write).
    Gone,
}

/// Delay before attempt `attempt + 1`: `retry_backoff * 2^(attempt-1)`,
/// capped at `retry_backoff_max`.
pub fn retry_delay(config: &OrchestratorConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    config
        .retry_backoff
        .saturating_mul(1u32 << exponent)
        .min(config.retry_backoff_max)
}

/// Execute `task` until it succeeds, exhausts its attempts or is canceled,
/// then write the terminal status.
///
/// The token is checked before every attempt and raced against every
/// backoff sleep, so a cancel always wins before a new attempt starts.
pub async fn run_task(
    runtime: Arc<Runtime>,
    provider: Arc<dyn Provider>,
    task: Task,
    token: CancellationToken,
) {
    let config = runtime.config().clone();
    let started = Instant::now();
    info!(task_id = %task.id, title = %task.title, profile = %task.profile, "Task started");

    let outcome = loop {
        if token.is_cancelled() {
            break Outcome::Canceled;
        }
        let Some(attempt) = runtime.record_attempt(task.id).await else {
            break Outcome::Gone;
        };

        let request = ProviderRequest::new(task.prompt.clone(), task.profile, config.task_timeout)
            .with_model(task.model.clone());
        debug!(task_id = %task.id, attempt, "Calling provider");

        match run_guarded(provider.as_ref(), request, &token).await {
            Ok(response) => break Outcome::Succeeded(response),
            Err(_) if token.is_cancelled() => break Outcome::Canceled,
            Err(e) if !e.is_retryable() => break Outcome::Failed(e.message()),
            Err(e) => {
                if attempt >= config.retry_max_attempts {
                    warn!(task_id = %task.id, attempt, error = %e, "Task attempts exhausted");
                    break Outcome::Failed(e.message());
                }
                let delay = retry_delay(&config, attempt);
                warn!(
                    task_id = %task.id,
                    attempt,
                    max_attempts = config.retry_max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Provider call failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => break Outcome::Canceled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    finish(&runtime, &task, &token, outcome, duration_ms).await;
}

async fn finish(
    runtime: &Runtime,
    task: &Task,
    token: &CancellationToken,
    outcome: Outcome,
    duration_ms: u64,
) {
    let (output, usage, error) = match outcome {
        Outcome::Gone => {
            debug!(task_id = %task.id, "Task no longer running; nothing to record");
            runtime.release_controller(task.id).await;
            return;
        }
        Outcome::Canceled => {
            runtime
                .mark_canceled(task.id, interrupted(), CompletionPatch::default())
                .await;
            return;
        }
        Outcome::Succeeded(response) => (response.output, response.usage, None),
        Outcome::Failed(error) => (String::new(), None, Some(error)),
    };

    // From here on the outcome is known. Stamp the timing first so a cancel
    // landing during the archive write keeps it.
    let completed_at = Utc::now();
    let Some(current) = runtime
        .record_completion(task.id, completed_at, duration_ms)
        .await
    else {
        runtime.release_controller(task.id).await;
        return;
    };

    let body = error.as_deref().unwrap_or(&output);
    let archive_path = match write_archive(&runtime.paths().archive_dir, &current, body).await {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Failed to write task archive");
            None
        }
    };

    let patch = CompletionPatch {
        completed_at: Some(completed_at),
        duration_ms: Some(duration_ms),
        usage,
        output: Some(output),
        error: error.clone(),
        archive_path,
    };

    if token.is_cancelled() {
        runtime.mark_canceled(task.id, interrupted(), patch).await;
    } else if error.is_some() {
        runtime.mark_failed(task.id, patch).await;
    } else {
        runtime.mark_succeeded(task.id, patch).await;
    }
}

/// Cancel metadata used when no earlier request recorded a reason.
fn interrupted() -> CancelInfo {
    CancelInfo::new("canceled during execution", CancelSource::System)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::ProviderError;
    use crate::tasks::{NewTask, TaskStatus};

    /// Fails every call.
    #[derive(Default)]
    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for AlwaysFails {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(
            &self,
            _request: ProviderRequest,
            _cancel: CancellationToken,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::RequestFailed {
                provider: "failing".into(),
                reason: "upstream 503".into(),
            })
        }
    }

    /// Succeeds, firing the task token on the way out.
    struct CanceledOnReturn;

    #[async_trait]
    impl Provider for CanceledOnReturn {
        fn name(&self) -> &str {
            "late-cancel"
        }

        async fn run(
            &self,
            _request: ProviderRequest,
            cancel: CancellationToken,
        ) -> Result<ProviderResponse, ProviderError> {
            cancel.cancel();
            Ok(ProviderResponse {
                output: "chart.png".into(),
                ..Default::default()
            })
        }
    }

    async fn open(dir: &std::path::Path) -> Arc<Runtime> {
        let config = OrchestratorConfig {
            data_dir: dir.to_path_buf(),
            retry_max_attempts: 3,
            retry_backoff: Duration::from_secs(10),
            retry_backoff_max: Duration::from_secs(10),
            ..Default::default()
        };
        Runtime::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_retries() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = open(dir.path()).await;
        let provider = Arc::new(AlwaysFails::default());
        runtime.enqueue(NewTask::new("upload artifacts")).await;
        let (task, token) = runtime.start_next(Utc::now()).await.unwrap();
        let id = task.id;
        let handle = tokio::spawn(run_task(
            Arc::clone(&runtime),
            provider.clone(),
            task,
            token,
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while provider.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            runtime
                .cancel(id, CancelInfo::new("no longer needed", CancelSource::User))
                .await;
            handle.await.unwrap();
        })
        .await
        .expect("cancel should cut the backoff short");

        let task = runtime.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.attempts, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.cancel.unwrap().source, CancelSource::User);
    }

    #[tokio::test]
    async fn cancel_after_success_keeps_output_and_timing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = open(dir.path()).await;
        runtime.enqueue(NewTask::new("render chart")).await;
        let (task, token) = runtime.start_next(Utc::now()).await.unwrap();
        let id = task.id;

        run_task(Arc::clone(&runtime), Arc::new(CanceledOnReturn), task, token).await;

        let task = runtime.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.completed_at.is_some());
        assert!(task.duration_ms.is_some());
        assert_eq!(task.cancel.unwrap().source, CancelSource::System);
        let result = task.result.unwrap();
        assert_eq!(result.output, "chart.png");
        assert!(result.archive_path.is_some());
        assert_eq!(runtime.in_flight().await, 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = OrchestratorConfig {
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(&config, 4), Duration::from_millis(500));
        assert_eq!(retry_delay(&config, 60), Duration::from_millis(500));
    }
}
