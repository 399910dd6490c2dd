//! Cron loop: fires due jobs, then sleeps until the next one is due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cron::job::{CronAction, CronJob};
use crate::runtime::{InputRole, OrchestratorEvent, Runtime};

/// Spawn the cron loop.
///
/// Each pass fires every due job, then waits on the cron signal until the
/// earliest `next_run_at` (never longer than `cron_tick`). Adding or
/// disabling a job notifies the signal so the sleep is recomputed.
pub fn spawn_cron_loop(runtime: Arc<Runtime>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            tick_secs = runtime.config().cron_tick.as_secs(),
            "Cron loop started"
        );

        while !runtime.is_stopped() {
            let now = Utc::now();
            let fired = fire_due_jobs(&runtime, now).await;
            if fired > 0 {
                debug!(fired, "Cron pass complete");
            }

            let wait = next_wait(
                runtime.lock().await.next_cron_run(),
                Utc::now(),
                runtime.config().cron_tick,
            );
            let stopped = || runtime.is_stopped();
            runtime.signals().cron.wait(wait, stopped).await;
        }

        info!("Cron loop stopped");
    })
}

/// Fire every enabled job whose `next_run_at` has passed. Returns how many
/// fired.
pub async fn fire_due_jobs(runtime: &Runtime, now: DateTime<Utc>) -> usize {
    let due: Vec<CronJob> = {
        let mut state = runtime.lock().await;
        let mut due = Vec::new();
        for job in state.cron_jobs.iter_mut().filter(|j| j.is_due(now)) {
            due.push(job.clone());
            job.record_fire(now);
            if !job.enabled {
                info!(
                    job_id = %job.id,
                    reason = job.disabled_reason.as_deref().unwrap_or_default(),
                    "Cron job disabled after firing"
                );
            }
        }
        due
    };

    for job in &due {
        info!(job_id = %job.id, name = %job.name, "Cron job fired");
        match &job.action {
            CronAction::EnqueueTask(template) => {
                let outcome = runtime.enqueue(template.to_new_task()).await;
                if !outcome.created {
                    debug!(
                        job_id = %job.id,
                        task_id = %outcome.task.id,
                        "Cron task already active"
                    );
                }
            }
            CronAction::WakeManager { text } => {
                if let Err(e) = runtime.submit_input(text.clone(), InputRole::Cron).await {
                    warn!(job_id = %job.id, error = %e, "Failed to append cron input");
                }
            }
        }
        runtime.emit(OrchestratorEvent::CronFired {
            job_id: job.id,
            name: job.name.clone(),
        });
    }

    if !due.is_empty() {
        runtime.persist_logged().await;
    }
    due.len()
}

/// Time until `next`, clamped to `[0, tick]`.
fn next_wait(next: Option<DateTime<Utc>>, now: DateTime<Utc>, tick: Duration) -> Duration {
    match next {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO).min(tick),
        None => tick,
    }
}
