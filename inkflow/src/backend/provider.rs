//! The completion provider seam and its request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A completion request handed to a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The user prompt.
    pub prompt: String,
    /// Optional system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Upper bound on completion tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Time the provider has to answer. Set by the router.
    #[serde(skip)]
    pub deadline: Option<Duration>,
    /// Model override. The router fills this from the tier config when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CompletionRequest {
    /// Creates a request for a prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Sets the completion token limit.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Why a provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Hit the token limit.
    Length,
    /// Anything else the provider reported.
    Other,
}

impl Default for FinishReason {
    fn default() -> Self {
        Self::Stop
    }
}

/// Token counts reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Creates a usage record.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A successful completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub content: String,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Creates a response with the given content and token counts.
    #[must_use]
    pub fn new(content: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            content: content.into(),
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::Stop,
        }
    }

    /// Sets the finish reason.
    #[must_use]
    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }

    /// Token usage of this response.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        TokenUsage::new(self.input_tokens, self.output_tokens)
    }
}

/// Classification of provider failures. Drives the router's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credentials rejected.
    Auth,
    /// Provider asked us to slow down.
    RateLimit,
    /// Provider-side failure.
    Server,
    /// The request itself is invalid.
    Malformed,
    /// The call exceeded its deadline.
    Timeout,
}

impl ProviderErrorKind {
    /// Returns true if a retry might succeed.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimit | Self::Server | Self::Timeout)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Malformed => "malformed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// A failed provider call.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    /// What kind of failure this is.
    pub kind: ProviderErrorKind,
    /// Provider-supplied detail.
    pub message: String,
    /// Minimum wait the provider asked for, if any.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    /// Tokens consumed despite the failure, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ProviderError {
    /// Creates a provider error.
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            usage: None,
        }
    }

    /// Shorthand for an auth failure.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    /// Shorthand for a rate-limit failure.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimit, message)
    }

    /// Shorthand for a server failure.
    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Server, message)
    }

    /// Shorthand for a malformed request.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Malformed, message)
    }

    /// Shorthand for a deadline expiry.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Sets the retry-after hint.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Records tokens consumed by the failed call.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// A backend that turns prompts into completions.
///
/// Implementations must be safe to call concurrently; the router shares one
/// instance across every stage of a run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str;

    /// Generates a completion.
    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("Write a poem")
            .with_system_prompt("You are terse.")
            .with_max_tokens(64)
            .with_model("small");

        assert_eq!(request.prompt, "Write a poem");
        assert_eq!(request.system_prompt.as_deref(), Some("You are terse."));
        assert_eq!(request.max_tokens, Some(64));
        assert_eq!(request.model.as_deref(), Some("small"));
        assert!(request.deadline.is_none());
    }

    #[test]
    fn test_error_kind_transience() {
        assert!(ProviderErrorKind::RateLimit.is_transient());
        assert!(ProviderErrorKind::Timeout.is_transient());
        assert!(!ProviderErrorKind::Auth.is_transient());
        assert!(!ProviderErrorKind::Malformed.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::rate_limited("slow down").with_retry_after(Duration::from_secs(2));
        assert_eq!(err.to_string(), "rate_limit: slow down");
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_mock_provider() {
        let mut provider = MockCompletionProvider::new();
        provider.expect_name().return_const("mock".to_string());
        provider
            .expect_generate()
            .returning(|req| Ok(CompletionResponse::new(req.prompt.to_uppercase(), 1, 1)));

        let response = provider.generate(&CompletionRequest::new("hi")).await.unwrap();
        assert_eq!(response.content, "HI");
        assert_eq!(provider.name(), "mock");
    }
}
