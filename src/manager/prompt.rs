//! Manager prompt assembly.
//!
//! Chat history and recent tasks are unbounded, so both go through
//! `select_by_window` with their own budgets before they are rendered.

use std::fmt::Write as _;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::manager::history::{ChatEntry, ChatHistory, ChatRole};
use crate::runtime::{InputEntry, truncate};
use crate::tasks::{Task, TaskResult};
use crate::window::select_by_window;

/// Fixed overhead added to every item's byte estimate.
const ITEM_OVERHEAD_BYTES: usize = 32;
/// Result output quoted in the prompt; the archive has the rest.
const RESULT_EXCERPT_BYTES: usize = 1_500;

const PROTOCOL: &str = "\
You coordinate background work. Reply with a short message for the user.
To act, add fenced blocks tagged `action`, each holding one JSON command or a JSON array of commands:
- {\"type\":\"create_task\",\"prompt\":\"...\",\"title\":\"...\",\"profile\":\"standard|specialist|deferred\",\"priority\":0,\"blockedBy\":[\"<task id>\"],\"next\":[{\"prompt\":\"...\",\"when\":\"succeeded|failed|any\"}]}
- {\"type\":\"cancel_task\",\"taskId\":\"<task id>\",\"reason\":\"...\"}
- {\"type\":\"create_cron\",\"name\":\"...\",\"cron\":\"0 9 * * *\",\"task\":{\"prompt\":\"...\"}} (or \"at\":\"<RFC 3339>\", or \"wake\":\"<note to yourself>\")
- {\"type\":\"disable_cron\",\"jobId\":\"<job id>\",\"reason\":\"...\"}
- {\"type\":\"summarize_result\",\"taskId\":\"<task id>\",\"summary\":\"...\"}
Only create a task when work is actually needed. Do not recreate tasks that are already pending or running.";

fn entry_bytes(entry: &&ChatEntry) -> usize {
    entry.text.len() + ITEM_OVERHEAD_BYTES
}

fn task_bytes(task: &Task) -> usize {
    task.title.len() + task.prompt.len().min(200) + ITEM_OVERHEAD_BYTES
}

fn role_label(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "manager",
        ChatRole::System => "system",
        ChatRole::Cron => "cron",
    }
}

/// Render the prompt for one manager turn.
///
/// `tasks` must be newest first.
pub fn build_prompt(
    config: &OrchestratorConfig,
    history: &ChatHistory,
    tasks: &[Task],
    inputs: &[InputEntry],
    results: &[TaskResult],
) -> String {
    let mut prompt = String::from(PROTOCOL);

    let newest = history.newest_first();
    let chat = select_by_window(&newest, config.history_window, entry_bytes);
    if !chat.is_empty() {
        prompt.push_str("\n\n## Conversation so far\n");
        for entry in chat.iter().rev() {
            let _ = writeln!(prompt, "[{}] {}", role_label(entry.role), entry.text);
        }
    }

    let recent = select_by_window(tasks, config.task_window, task_bytes);
    if !recent.is_empty() {
        prompt.push_str("\n## Recent tasks (newest first)\n");
        for task in recent {
            let _ = writeln!(
                prompt,
                "- {} [{}] {} ({}, attempts {})",
                task.id, task.status, task.title, task.profile, task.attempts
            );
        }
    }

    if !results.is_empty() {
        prompt.push_str("\n## Finished since last turn\n");
        for result in results {
            let _ = writeln!(
                prompt,
                "### {} [{}] {}",
                result.task_id, result.status, result.title
            );
            if let Some(error) = &result.error {
                let _ = writeln!(prompt, "error: {error}");
            }
            if !result.output.is_empty() {
                let _ = writeln!(prompt, "{}", truncate(&result.output, RESULT_EXCERPT_BYTES));
            }
        }
    }

    if !inputs.is_empty() {
        prompt.push_str("\n## New messages\n");
        for input in inputs {
            let role = role_label(input.role.into());
            let _ = writeln!(prompt, "[{role}] {}", input.text);
        }
    }

    prompt
}

/// Provider timeout for a prompt of `prompt_bytes`: the floor plus
/// `manager_timeout_per_kb` per KiB, capped at the ceiling.
pub fn manager_timeout(config: &OrchestratorConfig, prompt_bytes: usize) -> Duration {
    let kib = u32::try_from(prompt_bytes / 1024).unwrap_or(u32::MAX);
    config
        .manager_timeout_floor
        .saturating_add(config.manager_timeout_per_kb.saturating_mul(kib))
        .min(config.manager_timeout_ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InputRole;
    use crate::tasks::NewTask;
    use crate::window::WindowOptions;

    #[test]
    fn timeout_scales_then_caps() {
        let config = OrchestratorConfig::default();
        assert_eq!(manager_timeout(&config, 100), Duration::from_secs(60));
        assert_eq!(
            manager_timeout(&config, 10 * 1024),
            Duration::from_secs(65)
        );
        assert_eq!(
            manager_timeout(&config, 10 * 1024 * 1024),
            Duration::from_secs(120)
        );
    }

    #[tokio::test]
    async fn prompt_windows_tasks_and_includes_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = ChatHistory::load(dir.path().join("h.jsonl"), 100)
            .await
            .unwrap();
        history
            .append(ChatEntry::new(ChatRole::User, "earlier question"))
            .await
            .unwrap();

        let config = OrchestratorConfig {
            task_window: WindowOptions {
                min_count: 1,
                max_count: 2,
                max_bytes: 10_000,
            },
            ..Default::default()
        };
        let tasks: Vec<Task> = ["third", "second", "first"]
            .iter()
            .map(|p| Task::from_request(&NewTask::new(*p)))
            .collect();
        let inputs = vec![InputEntry::new("please tidy the repo", InputRole::User)];

        let prompt = build_prompt(&config, &history, &tasks, &inputs, &[]);
        assert!(prompt.contains("[user] earlier question"));
        assert!(prompt.contains("third"));
        assert!(prompt.contains("second"));
        assert!(!prompt.contains("] first ("));
        assert!(prompt.contains("[user] please tidy the repo"));
        assert!(!prompt.contains("## Finished since last turn"));
    }
}
