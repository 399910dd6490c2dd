//! Scheduled and recurring triggers.
//!
//! A cron job fires on a cron expression or once at a fixed timestamp. Firing
//! either enqueues a task from a template or wakes the manager with a note.
//! Disabling is terminal.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CronError;
use crate::tasks::{NewTask, Profile, TaskSource};

/// When a job fires. The two forms are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CronSchedule {
    /// Recurring. Five-field expressions get a leading seconds field.
    Cron { expr: String },
    /// One-shot.
    At { at: DateTime<Utc> },
}

impl CronSchedule {
    pub fn cron(expr: impl Into<String>) -> Self {
        Self::Cron { expr: expr.into() }
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self::At { at }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::At { .. })
    }

    /// First fire time strictly after `after`.
    ///
    /// A one-shot schedule reports its timestamp until it has fired, even
    /// when that timestamp is already in the past.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        fired: bool,
    ) -> Result<Option<DateTime<Utc>>, CronError> {
        match self {
            Self::Cron { expr } => next_cron_fire(expr, after),
            Self::At { at } => Ok((!fired).then_some(*at)),
        }
    }
}

/// Prompt/title/profile used to build the task a job enqueues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub priority: i32,
}

impl TaskTemplate {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            title: None,
            profile: None,
            priority: 0,
        }
    }

    pub fn to_new_task(&self) -> NewTask {
        NewTask {
            prompt: self.prompt.clone(),
            title: self.title.clone(),
            profile: self.profile,
            priority: self.priority,
            source: TaskSource::Cron,
            ..Default::default()
        }
    }
}

/// What happens when a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CronAction {
    /// Enqueue a task built from the template (deduplicated by fingerprint).
    EnqueueTask(TaskTemplate),
    /// Append a note to the input log and wake the manager.
    WakeManager { text: String },
}

/// A scheduled or recurring trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub schedule: CronSchedule,
    pub action: CronAction,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
}

impl CronJob {
    /// Build an enabled job, validating the schedule and computing its first
    /// fire time.
    pub fn new(
        name: impl Into<String>,
        schedule: CronSchedule,
        action: CronAction,
    ) -> Result<Self, CronError> {
        let now = Utc::now();
        let next_run_at = schedule.next_after(now, false)?;
        if next_run_at.is_none() {
            let expr = match &schedule {
                CronSchedule::Cron { expr } => expr.clone(),
                CronSchedule::At { at } => at.to_rfc3339(),
            };
            return Err(CronError::NoUpcoming(expr));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            schedule,
            action,
            created_at: now,
            last_run_at: None,
            next_run_at,
            run_count: 0,
            disabled_reason: None,
            disabled_at: None,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Disable for good. Returns false if the job was already disabled.
    pub fn disable(&mut self, reason: impl Into<String>) -> bool {
        if !self.enabled {
            return false;
        }
        self.enabled = false;
        self.next_run_at = None;
        self.disabled_reason = Some(reason.into());
        self.disabled_at = Some(Utc::now());
        true
    }

    /// Bookkeeping after a fire: bump counters and schedule the next run.
    ///
    /// One-shot jobs disable themselves with reason `fired`. A recurring job
    /// whose expression no longer yields a time is disabled with the error.
    pub fn record_fire(&mut self, now: DateTime<Utc>) {
        self.last_run_at = Some(now);
        self.run_count += 1;

        if self.schedule.is_one_shot() {
            self.disable("fired");
            return;
        }

        match self.schedule.next_after(now, true) {
            Ok(Some(next)) => self.next_run_at = Some(next),
            Ok(None) => {
                self.disable("no upcoming fire time");
            }
            Err(e) => {
                self.disable(e.to_string());
            }
        }
    }
}

/// Parse a cron expression, accepting the five-field form.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, CronError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a cron expression and compute the next fire time after `after`.
pub fn next_cron_fire(
    expr: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CronError> {
    Ok(parse_cron(expr)?.after(&after).next())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn wake(text: &str) -> CronAction {
        CronAction::WakeManager {
            text: text.to_string(),
        }
    }

    #[test]
    fn five_field_expression_is_accepted() {
        let now = Utc::now();
        let next = next_cron_fire("*/5 * * * *", now).unwrap().unwrap();
        assert!(next > now);
        assert!(next - now <= Duration::minutes(5));
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let result = CronJob::new(
            "broken",
            CronSchedule::cron("not a cron"),
            wake("hello"),
        );
        assert!(matches!(result, Err(CronError::InvalidExpression { .. })));
    }

    #[test]
    fn one_shot_disables_after_fire() {
        let at = Utc::now() - Duration::seconds(1);
        let mut job = CronJob::new("once", CronSchedule::at(at), wake("ping")).unwrap();
        assert!(job.is_due(Utc::now()));

        job.record_fire(Utc::now());
        assert!(!job.enabled);
        assert_eq!(job.disabled_reason.as_deref(), Some("fired"));
        assert_eq!(job.run_count, 1);
        assert!(!job.is_due(Utc::now() + Duration::days(1)));
    }

    #[test]
    fn recurring_job_advances() {
        let mut job = CronJob::new(
            "every second",
            CronSchedule::cron("* * * * * *"),
            CronAction::EnqueueTask(TaskTemplate::new("check the queue")),
        )
        .unwrap();
        let first = job.next_run_at.unwrap();
        job.record_fire(first);
        assert!(job.enabled);
        assert!(job.next_run_at.unwrap() > first);
    }

    #[test]
    fn disable_is_terminal() {
        let mut job =
            CronJob::new("daily", CronSchedule::cron("0 9 * * *"), wake("standup")).unwrap();
        assert!(job.disable("not needed"));
        assert!(!job.disable("again"));
        assert_eq!(job.disabled_reason.as_deref(), Some("not needed"));
    }

    #[test]
    fn template_tasks_come_from_cron() {
        let template = TaskTemplate {
            prompt: "rotate logs".into(),
            title: Some("Log rotation".into()),
            profile: Some(Profile::Deferred),
            priority: 2,
        };
        let request = template.to_new_task();
        assert_eq!(request.source, TaskSource::Cron);
        assert_eq!(request.resolved_profile(), Profile::Deferred);
        assert_eq!(request.priority, 2);
    }

    #[test]
    fn job_serializes_tagged() {
        let job = CronJob::new("nightly", CronSchedule::cron("0 0 3 * * *"), wake("report"))
            .unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["schedule"]["type"], "cron");
        assert_eq!(json["action"]["type"], "wake_manager");
        assert!(json.get("nextRunAt").is_some());
    }
}
