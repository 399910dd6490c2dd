//! Provider backed by an external command.
//!
//! The prompt goes to the child's stdin and stdout becomes the output. The
//! child is killed if the call is canceled or times out.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, ProviderError};
use crate::llm::provider::{Provider, ProviderRequest, ProviderResponse};
use crate::tasks::Profile;

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL_BYTES: usize = 2_000;

#[derive(Debug, Clone)]
pub struct CommandProvider {
    name: String,
    program: String,
    args: Vec<String>,
    /// Model passed to the command per profile, via `AI_ORCH_MODEL`.
    models: HashMap<Profile, String>,
}

impl CommandProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args,
            models: HashMap::new(),
        }
    }

    /// Run `command_line` through `sh -c`.
    pub fn shell(command_line: impl Into<String>) -> Self {
        let command_line = command_line.into();
        Self {
            name: "command".to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command_line],
            models: HashMap::new(),
        }
    }

    /// Build from `AI_ORCH_PROVIDER_CMD` plus optional
    /// `AI_ORCH_MODEL_<PROFILE>` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let command_line = std::env::var("AI_ORCH_PROVIDER_CMD")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "AI_ORCH_PROVIDER_CMD".to_string(),
                hint: "Set it to a command that reads a prompt on stdin and prints a reply"
                    .to_string(),
            })?;

        let mut provider = Self::shell(command_line);
        for profile in [
            Profile::Standard,
            Profile::Specialist,
            Profile::Deferred,
            Profile::Manager,
        ] {
            let key = format!("AI_ORCH_MODEL_{}", profile.to_string().to_uppercase());
            if let Ok(model) = std::env::var(&key)
                && !model.trim().is_empty()
            {
                provider = provider.with_model(profile, model);
            }
        }
        Ok(provider)
    }

    pub fn with_model(mut self, profile: Profile, model: impl Into<String>) -> Self {
        self.models.insert(profile, model.into());
        self
    }

    fn failure(&self, reason: impl Into<String>) -> ProviderError {
        ProviderError::RequestFailed {
            provider: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Provider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        let started = Instant::now();
        let model = request
            .model
            .clone()
            .or_else(|| self.models.get(&request.profile).cloned())
            .unwrap_or_default();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("AI_ORCH_PROFILE", request.profile.to_string())
            .env("AI_ORCH_MODEL", &model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Spawn(format!("{}: {e}", self.program)))?;

        // Stdin is fed from its own task while stdout and stderr are drained.
        let feeder = child.stdin.take().map(|mut stdin| {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                // A child that exits without reading stdin is not an error.
                match stdin.write_all(prompt.as_bytes()).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
                // Dropping stdin closes it so the child sees EOF.
            })
        });

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(feeder) = &feeder {
                    feeder.abort();
                }
                return Err(ProviderError::Canceled);
            }
            out = child.wait_with_output() => {
                out.map_err(|e| self.failure(format!("waiting for child: {e}")))?
            }
        };

        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(self.failure(format!("writing prompt: {e}"))),
                Err(e) => return Err(self.failure(format!("prompt writer failed: {e}"))),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail(stderr.trim(), STDERR_TAIL_BYTES);
            return Err(self.failure(format!("{}: {tail}", output.status)));
        }

        let text = String::from_utf8(output.stdout).map_err(|e| ProviderError::InvalidResponse {
            provider: self.name.clone(),
            reason: format!("stdout is not UTF-8: {e}"),
        })?;

        Ok(ProviderResponse {
            output: text.trim_end().to_string(),
            usage: None,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
