//! Commands the manager can issue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cron::{CronAction, CronJob, CronSchedule, TaskTemplate};
use crate::error::ProtocolError;
use crate::tasks::NewTask;

/// Every `type` tag the protocol knows.
pub const COMMAND_KINDS: &[&str] = &[
    "create_task",
    "cancel_task",
    "create_cron",
    "disable_cron",
    "summarize_result",
];

/// A structured manager command, validated before it touches any state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    CreateTask(NewTask),
    CancelTask {
        task_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
    CreateCron {
        name: String,
        /// Recurring expression; exclusive with `at`.
        #[serde(default)]
        cron: Option<String>,
        /// One-shot time; exclusive with `cron`.
        #[serde(default)]
        at: Option<DateTime<Utc>>,
        /// Task to enqueue on fire; exclusive with `wake`.
        #[serde(default)]
        task: Option<TaskTemplate>,
        /// Note for the manager on fire; exclusive with `task`.
        #[serde(default)]
        wake: Option<String>,
    },
    DisableCron {
        job_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
    SummarizeResult {
        task_id: Uuid,
        summary: String,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateTask(_) => "create_task",
            Self::CancelTask { .. } => "cancel_task",
            Self::CreateCron { .. } => "create_cron",
            Self::DisableCron { .. } => "disable_cron",
            Self::SummarizeResult { .. } => "summarize_result",
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::Invalid {
            command: self.kind().to_string(),
            reason: reason.into(),
        }
    }

    /// Check the fields a deserializer cannot.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::CreateTask(request) => {
                if request.prompt.trim().is_empty() {
                    return Err(self.invalid("prompt is empty"));
                }
                if request.next.iter().any(|n| n.prompt.trim().is_empty()) {
                    return Err(self.invalid("follow-up prompt is empty"));
                }
                Ok(())
            }
            Self::CreateCron { .. } => self.to_cron_job().map(|_| ()),
            Self::SummarizeResult { summary, .. } if summary.trim().is_empty() => {
                Err(self.invalid("summary is empty"))
            }
            Self::CancelTask { .. } | Self::DisableCron { .. } | Self::SummarizeResult { .. } => {
                Ok(())
            }
        }
    }

    /// Build the cron job a `create_cron` command describes.
    pub fn to_cron_job(&self) -> Result<CronJob, ProtocolError> {
        let Self::CreateCron {
            name,
            cron,
            at,
            task,
            wake,
        } = self
        else {
            return Err(self.invalid("not a create_cron command"));
        };

        if name.trim().is_empty() {
            return Err(self.invalid("name is empty"));
        }
        let schedule = match (cron, at) {
            (Some(expr), None) => CronSchedule::cron(expr.clone()),
            (None, Some(at)) => CronSchedule::at(*at),
            _ => return Err(self.invalid("exactly one of cron or at is required")),
        };
        let action = match (task, wake) {
            (Some(template), None) if !template.prompt.trim().is_empty() => {
                CronAction::EnqueueTask(template.clone())
            }
            (None, Some(text)) if !text.trim().is_empty() => {
                CronAction::WakeManager { text: text.clone() }
            }
            _ => return Err(self.invalid("exactly one non-empty task or wake is required")),
        };

        CronJob::new(name.clone(), schedule, action).map_err(|e| self.invalid(e.to_string()))
    }

    /// Key used to drop repeated create commands within the debounce window.
    pub fn debounce_key(&self) -> Option<String> {
        match self {
            Self::CreateTask(request) => Some(request.fingerprint()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn create_task_parses_camel_case_fields() {
        let value = json!({
            "type": "create_task",
            "prompt": "Write release notes",
            "profile": "specialist",
            "priority": 2,
            "blockedBy": [],
        });
        let command: Command = serde_json::from_value(value).unwrap();
        let Command::CreateTask(request) = &command else {
            panic!("wrong variant: {command:?}");
        };
        assert_eq!(request.priority, 2);
        assert!(command.validate().is_ok());
        assert!(command.debounce_key().unwrap().starts_with("specialist|"));
    }

    #[test]
    fn cancel_task_uses_task_id() {
        let id = Uuid::new_v4();
        let command: Command =
            serde_json::from_value(json!({"type": "cancel_task", "taskId": id})).unwrap();
        assert_eq!(
            command,
            Command::CancelTask {
                task_id: id,
                reason: None
            }
        );
    }

    #[test]
    fn empty_prompt_is_invalid() {
        let command = Command::CreateTask(NewTask::new("   "));
        assert!(matches!(
            command.validate(),
            Err(ProtocolError::Invalid { command, .. }) if command == "create_task"
        ));
    }

    #[test]
    fn create_cron_requires_one_schedule_and_one_action() {
        let both = Command::CreateCron {
            name: "x".into(),
            cron: Some("0 * * * *".into()),
            at: Some(Utc::now()),
            task: None,
            wake: Some("hi".into()),
        };
        assert!(both.validate().is_err());

        let ok = Command::CreateCron {
            name: "hourly digest".into(),
            cron: Some("0 * * * *".into()),
            at: None,
            task: Some(TaskTemplate::new("summarize the inbox")),
            wake: None,
        };
        let job = ok.to_cron_job().unwrap();
        assert!(job.enabled);
        assert!(matches!(job.action, CronAction::EnqueueTask(_)));
    }

    #[test]
    fn create_cron_reports_bad_expression() {
        let bad = Command::CreateCron {
            name: "broken".into(),
            cron: Some("every tuesday".into()),
            at: None,
            task: None,
            wake: Some("hi".into()),
        };
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("every tuesday"));
    }

    #[test]
    fn kinds_table_matches_variants() {
        let commands = [
            Command::CreateTask(NewTask::new("a")),
            Command::CancelTask {
                task_id: Uuid::nil(),
                reason: None,
            },
            Command::DisableCron {
                job_id: Uuid::nil(),
                reason: None,
            },
            Command::SummarizeResult {
                task_id: Uuid::nil(),
                summary: "s".into(),
            },
        ];
        for command in commands {
            assert!(COMMAND_KINDS.contains(&command.kind()));
            let json = serde_json::to_value(&command).unwrap();
            assert_eq!(json["type"], command.kind());
        }
    }
}
