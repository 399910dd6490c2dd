//! Configuration types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::window::WindowOptions;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding the snapshot, logs, cursors and archive.
    pub data_dir: PathBuf,
    /// Maximum number of tasks executing at once.
    pub max_concurrent: usize,
    /// Total provider attempts per task (first try included).
    pub retry_max_attempts: u32,
    /// Base delay between attempts; doubled after every failure.
    pub retry_backoff: Duration,
    /// Upper bound for the retry delay.
    pub retry_backoff_max: Duration,
    /// Timeout applied to each worker provider call.
    pub task_timeout: Duration,
    /// Quiet period after the last input before the manager fires a turn.
    pub debounce: Duration,
    /// Longest a buffered result waits for a manager turn when no inputs are pending.
    pub max_result_wait: Duration,
    /// Fallback wake interval for the worker driver.
    pub worker_tick: Duration,
    /// Longest the cron loop sleeps between checks.
    pub cron_tick: Duration,
    /// Window in which a repeated create-task command for the same key is dropped.
    pub create_debounce: Duration,
    /// Size at which the create-debounce map is pruned.
    pub debounce_prune_threshold: usize,
    /// Manager provider timeout for small prompts.
    pub manager_timeout_floor: Duration,
    /// Manager provider timeout cap.
    pub manager_timeout_ceiling: Duration,
    /// Extra manager timeout granted per KiB of prompt.
    pub manager_timeout_per_kb: Duration,
    /// Chat history budget for a manager prompt.
    pub history_window: WindowOptions,
    /// Recent-task budget for a manager prompt.
    pub task_window: WindowOptions,
    /// Terminal tasks kept in memory for status queries and manager context.
    pub retain_terminal_tasks: usize,
    /// Chat history entries kept in memory.
    pub history_retain: usize,
    /// Bytes of output copied into a result log entry (the archive keeps all of it).
    pub result_output_limit: usize,
    /// How long shutdown waits for in-flight tasks.
    pub drain_timeout: Duration,
    /// Consecutive manager turn failures before a batch is committed anyway.
    pub manager_max_turn_failures: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_concurrent: 3,
            retry_max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(60),
            task_timeout: Duration::from_secs(600), // 10 minutes
            debounce: Duration::from_millis(1500),
            max_result_wait: Duration::from_secs(10),
            worker_tick: Duration::from_secs(30),
            cron_tick: Duration::from_secs(60),
            create_debounce: Duration::from_secs(120),
            debounce_prune_threshold: 256,
            manager_timeout_floor: Duration::from_secs(60),
            manager_timeout_ceiling: Duration::from_secs(120),
            manager_timeout_per_kb: Duration::from_millis(500),
            history_window: WindowOptions {
                min_count: 4,
                max_count: 40,
                max_bytes: 24_000,
            },
            task_window: WindowOptions {
                min_count: 3,
                max_count: 25,
                max_bytes: 12_000,
            },
            retain_terminal_tasks: 200,
            history_retain: 500,
            result_output_limit: 4_000,
            drain_timeout: Duration::from_secs(10),
            manager_max_turn_failures: 3,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from defaults overridden by `AI_ORCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(dir) = env_string("AI_ORCH_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_MAX_CONCURRENT")? {
            config.max_concurrent = v;
        }
        if let Some(v) = env_parse::<u32>("AI_ORCH_RETRY_MAX_ATTEMPTS")? {
            config.retry_max_attempts = v;
        }
        if let Some(v) = env_millis("AI_ORCH_RETRY_BACKOFF_MS")? {
            config.retry_backoff = v;
        }
        if let Some(v) = env_millis("AI_ORCH_RETRY_BACKOFF_MAX_MS")? {
            config.retry_backoff_max = v;
        }
        if let Some(v) = env_millis("AI_ORCH_TASK_TIMEOUT_MS")? {
            config.task_timeout = v;
        }
        if let Some(v) = env_millis("AI_ORCH_DEBOUNCE_MS")? {
            config.debounce = v;
        }
        if let Some(v) = env_millis("AI_ORCH_MAX_RESULT_WAIT_MS")? {
            config.max_result_wait = v;
        }
        if let Some(v) = env_millis("AI_ORCH_WORKER_TICK_MS")? {
            config.worker_tick = v;
        }
        if let Some(v) = env_millis("AI_ORCH_CRON_TICK_MS")? {
            config.cron_tick = v;
        }
        if let Some(v) = env_millis("AI_ORCH_CREATE_DEBOUNCE_MS")? {
            config.create_debounce = v;
        }
        if let Some(v) = env_millis("AI_ORCH_MANAGER_TIMEOUT_FLOOR_MS")? {
            config.manager_timeout_floor = v;
        }
        if let Some(v) = env_millis("AI_ORCH_MANAGER_TIMEOUT_CEILING_MS")? {
            config.manager_timeout_ceiling = v;
        }
        if let Some(v) = env_millis("AI_ORCH_MANAGER_TIMEOUT_PER_KB_MS")? {
            config.manager_timeout_per_kb = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_DEBOUNCE_PRUNE_THRESHOLD")? {
            config.debounce_prune_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_HISTORY_MIN_COUNT")? {
            config.history_window.min_count = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_HISTORY_MAX_COUNT")? {
            config.history_window.max_count = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_HISTORY_MAX_BYTES")? {
            config.history_window.max_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_TASK_CONTEXT_MIN_COUNT")? {
            config.task_window.min_count = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_TASK_CONTEXT_MAX_COUNT")? {
            config.task_window.max_count = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_TASK_CONTEXT_MAX_BYTES")? {
            config.task_window.max_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_RETAIN_TERMINAL_TASKS")? {
            config.retain_terminal_tasks = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_HISTORY_RETAIN")? {
            config.history_retain = v;
        }
        if let Some(v) = env_parse::<usize>("AI_ORCH_RESULT_OUTPUT_LIMIT")? {
            config.result_output_limit = v;
        }
        if let Some(v) = env_millis("AI_ORCH_DRAIN_TIMEOUT_MS")? {
            config.drain_timeout = v;
        }
        if let Some(v) = env_parse::<u32>("AI_ORCH_MANAGER_MAX_TURN_FAILURES")? {
            config.manager_max_turn_failures = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry_max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.manager_max_turn_failures == 0 {
            return Err(ConfigError::InvalidValue {
                key: "manager_max_turn_failures".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.manager_timeout_floor > self.manager_timeout_ceiling {
            return Err(ConfigError::InvalidValue {
                key: "manager_timeout_floor".to_string(),
                message: format!(
                    "{:?} exceeds ceiling {:?}",
                    self.manager_timeout_floor, self.manager_timeout_ceiling
                ),
            });
        }
        Ok(())
    }

    /// File locations derived from `data_dir`.
    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::new(&self.data_dir)
    }
}

/// Every durable file the orchestrator touches.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub data_dir: PathBuf,
    pub state_file: PathBuf,
    pub inputs_log: PathBuf,
    pub results_log: PathBuf,
    pub history_log: PathBuf,
    pub cursor_dir: PathBuf,
    pub archive_dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            state_file: data_dir.join("runtime-state.json"),
            inputs_log: data_dir.join("inputs.jsonl"),
            results_log: data_dir.join("results.jsonl"),
            history_log: data_dir.join("history.jsonl"),
            cursor_dir: data_dir.join("cursors"),
            archive_dir: data_dir.join("archive"),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let config = OrchestratorConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "max_concurrent"
        ));
    }

    #[test]
    fn inverted_manager_timeouts_rejected() {
        let config = OrchestratorConfig {
            manager_timeout_floor: Duration::from_secs(200),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn paths_live_under_data_dir() {
        let paths = RuntimePaths::new(Path::new("/tmp/orch"));
        assert_eq!(paths.state_file, Path::new("/tmp/orch/runtime-state.json"));
        assert_eq!(paths.cursor_dir, Path::new("/tmp/orch/cursors"));
        assert!(paths.archive_dir.starts_with(&paths.data_dir));
    }
}
