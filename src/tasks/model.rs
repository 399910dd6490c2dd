//! Task data model: status machine, profiles, usage and results.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest derived title, in characters.
const MAX_DERIVED_TITLE_CHARS: usize = 80;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                // crash recovery demotion
                | (Running, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Pending or running: blocks re-creation under the same fingerprint.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Execution tier, used by providers to pick a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Standard,
    Specialist,
    Deferred,
    Manager,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Specialist => "specialist",
            Self::Deferred => "deferred",
            Self::Manager => "manager",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "specialist" => Ok(Self::Specialist),
            "deferred" => Ok(Self::Deferred),
            "manager" => Ok(Self::Manager),
            other => Err(format!("unknown profile: {other}")),
        }
    }
}

/// Who asked for the task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    #[default]
    User,
    Manager,
    Cron,
    FollowUp,
}

/// Token and cost accounting. Merging only ever adds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: Decimal,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        if other.cost_usd > Decimal::ZERO {
            self.cost_usd += other.cost_usd;
        }
    }
}

/// Where a cancellation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSource {
    User,
    Manager,
    Dependency,
    System,
}

/// Metadata recorded when cancellation is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInfo {
    pub reason: String,
    pub source: CancelSource,
    pub requested_at: DateTime<Utc>,
}

impl CancelInfo {
    pub fn new(reason: impl Into<String>, source: CancelSource) -> Self {
        Self {
            reason: reason.into(),
            source,
            requested_at: Utc::now(),
        }
    }
}

/// Terminal output record. Written exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: Uuid,
    pub title: String,
    pub profile: Profile,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Trigger condition for a follow-up task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextCondition {
    #[default]
    Succeeded,
    Failed,
    Any,
}

impl NextCondition {
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            Self::Any => true,
            Self::Succeeded => status == TaskStatus::Succeeded,
            Self::Failed => status == TaskStatus::Failed,
        }
    }
}

/// Follow-up task definition consumed when its parent ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTask {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub when: NextCondition,
}

/// Everything needed to enqueue a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub prompt: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub profile: Option<Profile>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub next: Vec<NextTask>,
    #[serde(default)]
    pub blocked_by: Vec<Uuid>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: TaskSource,
}

impl NewTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_next(mut self, next: NextTask) -> Self {
        self.next.push(next);
        self
    }

    pub fn blocked_by(mut self, id: Uuid) -> Self {
        self.blocked_by.push(id);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    /// Title used for storage and fingerprinting.
    pub fn resolved_title(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => derive_title(&self.prompt),
        }
    }

    pub fn resolved_profile(&self) -> Profile {
        self.profile.unwrap_or_default()
    }

    /// Dedup key for this request.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.prompt, &self.resolved_title(), self.resolved_profile())
    }
}

impl From<&NextTask> for NewTask {
    fn from(next: &NextTask) -> Self {
        Self {
            prompt: next.prompt.clone(),
            title: next.title.clone(),
            profile: next.profile,
            source: TaskSource::FollowUp,
            ..Default::default()
        }
    }
}

/// A unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub fingerprint: String,
    pub prompt: String,
    pub title: String,
    pub profile: Profile,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub source: TaskSource,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<CancelInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<NextTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task from a request.
    pub fn from_request(request: &NewTask) -> Self {
        let title = request.resolved_title();
        let profile = request.resolved_profile();
        Self {
            id: Uuid::new_v4(),
            fingerprint: fingerprint(&request.prompt, &title, profile),
            prompt: request.prompt.clone(),
            title,
            profile,
            status: TaskStatus::Pending,
            priority: request.priority,
            model: request.model.clone(),
            source: request.source,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            attempts: 0,
            usage: None,
            cancel: None,
            result: None,
            next: request.next.clone(),
            blocked_by: request.blocked_by.clone(),
            scheduled_at: request.scheduled_at,
        }
    }

    /// Milliseconds from `started_at` (or `created_at`) to `end`.
    pub fn elapsed_ms(&self, end: DateTime<Utc>) -> u64 {
        let start = self.started_at.unwrap_or(self.created_at);
        u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
    }

    /// Whether `scheduled_at` has passed (or was never set).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// Collapse whitespace runs to single spaces and case-fold.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Dedup key derived from prompt, title and profile.
pub fn fingerprint(prompt: &str, title: &str, profile: Profile) -> String {
    format!("{}|{}|{}", profile, normalize(title), normalize(prompt))
}

/// First non-empty prompt line, truncated on a char boundary.
pub fn derive_title(prompt: &str) -> String {
    let line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Untitled task");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_DERIVED_TITLE_CHARS {
        collapsed
    } else {
        let cut: String = collapsed.chars().take(MAX_DERIVED_TITLE_CHARS).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Canceled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Succeeded));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Succeeded));
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Canceled));
        assert!(!TaskStatus::Canceled.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Running.is_active());
    }

    #[test]
    fn fingerprint_ignores_case_and_whitespace() {
        let a = fingerprint("Summarize   the\nreport", "Report", Profile::Standard);
        let b = fingerprint("summarize the report", "  report ", Profile::Standard);
        assert_eq!(a, b);
        let c = fingerprint("summarize the report", "report", Profile::Specialist);
        assert_ne!(a, c);
    }

    #[test]
    fn derived_title_is_stable() {
        let request = NewTask::new("\n  Draft the weekly   update\nwith details");
        assert_eq!(request.resolved_title(), "Draft the weekly update");
        let same = NewTask::new("draft the weekly update\nWITH details");
        assert_eq!(request.fingerprint(), same.fingerprint());
    }

    #[test]
    fn derived_title_truncates_long_lines() {
        let prompt = "é".repeat(200);
        let title = derive_title(&prompt);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), MAX_DERIVED_TITLE_CHARS + 3);
    }

    #[test]
    fn next_condition_matching() {
        assert!(NextCondition::Any.matches(TaskStatus::Canceled));
        assert!(NextCondition::Succeeded.matches(TaskStatus::Succeeded));
        assert!(!NextCondition::Succeeded.matches(TaskStatus::Failed));
        assert!(NextCondition::Failed.matches(TaskStatus::Failed));
    }

    #[test]
    fn usage_merge_never_decreases() {
        let mut usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: dec!(0.01),
        };
        usage.merge(&Usage {
            input_tokens: 3,
            output_tokens: 2,
            cost_usd: dec!(-5),
        });
        assert_eq!(usage.total_tokens(), 20);
        assert_eq!(usage.cost_usd, dec!(0.01));
    }

    #[test]
    fn profile_parse_display() {
        for profile in [
            Profile::Standard,
            Profile::Specialist,
            Profile::Deferred,
            Profile::Manager,
        ] {
            let parsed: Profile = profile.to_string().parse().unwrap();
            assert_eq!(parsed, profile);
        }
        assert!("gpu".parse::<Profile>().is_err());
    }

    #[test]
    fn task_serializes_camel_case() {
        let task = Task::from_request(&NewTask::new("check inbox"));
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["status"], "pending");
        assert_eq!(json["attempts"], 0);
    }
}
