//! Provider trait: the slow, fallible call every unit of work goes through.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::tasks::{Profile, Usage};

/// One provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub profile: Profile,
    /// Explicit model override; otherwise the provider picks by profile.
    pub model: Option<String>,
    pub timeout: Duration,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>, profile: Profile, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            profile,
            model: None,
            timeout,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// What a successful call produced.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub output: String,
    pub usage: Option<Usage>,
    pub elapsed_ms: u64,
}

/// Something that turns a prompt into text.
///
/// Implementations should return promptly once `cancel` fires.
/// `run_guarded` enforces the timeout and the token regardless.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    async fn run(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Call `provider` with the request timeout and the cancel token enforced
/// from the outside.
pub async fn run_guarded(
    provider: &dyn Provider,
    request: ProviderRequest,
    cancel: &CancellationToken,
) -> Result<ProviderResponse, ProviderError> {
    if cancel.is_cancelled() {
        return Err(ProviderError::Canceled);
    }
    let timeout = request.timeout;
    let call = tokio::time::timeout(timeout, provider.run(request, cancel.clone()));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Canceled),
        outcome = call => outcome.unwrap_or_else(|_| {
            Err(ProviderError::Timeout {
                provider: provider.name().to_string(),
                timeout,
            })
        }),
    }
}
