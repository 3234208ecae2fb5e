use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use noteflow_core::domain::provider::ModelId;
use noteflow_core::domain::template::RenderedPrompt;
use noteflow_core::job_engine::AttemptFailure;

/// One chat completion call against an OpenAI-compatible endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub base_url: String,
    pub model: ModelId,
    pub prompt: RenderedPrompt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rate limited the request: {message}")]
    RateLimited { message: String, retry_after: Option<Duration> },
    #[error("provider returned an unusable response: {0}")]
    InvalidResponse(String),
    #[error("provider rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// Classification used by the retry policy.
    pub fn into_attempt_failure(self) -> AttemptFailure {
        let message = self.to_string();
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => AttemptFailure::Unavailable { message },
            Self::RateLimited { retry_after, .. } => {
                AttemptFailure::RateLimited { message, retry_after }
            }
            Self::InvalidResponse(_) => AttemptFailure::InvalidResponse { message },
            Self::Rejected { .. } => AttemptFailure::Rejected { message },
        }
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}
