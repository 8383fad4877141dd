//! A deterministic offline provider for dry runs.

use super::provider::{CompletionProvider, CompletionRequest, CompletionResponse, FinishReason, ProviderError};
use crate::utils::estimate_tokens;
use async_trait::async_trait;

/// Answers every request with its own prompt, optionally prefixed.
///
/// Output is a pure function of the request, so two dry runs over the same
/// config produce byte-identical artifacts.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    prefix: Option<String>,
}

impl EchoProvider {
    /// Creates an echo provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefixes every completion.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

#[async_trait]
impl CompletionProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let mut content = match &self.prefix {
            Some(prefix) => format!("{prefix}{}", request.prompt),
            None => request.prompt.clone(),
        };

        let mut finish_reason = FinishReason::Stop;
        if let Some(limit) = request.max_tokens {
            // Trim whole words until the estimate fits.
            let mut kept: Vec<&str> = content.split_whitespace().collect();
            while !kept.is_empty() && estimate_tokens(&kept.join(" ")) > u64::from(limit) {
                kept.pop();
                finish_reason = FinishReason::Length;
            }
            if finish_reason == FinishReason::Length {
                content = kept.join(" ");
            }
        }

        let prompt_tokens = estimate_tokens(&request.prompt)
            + request.system_prompt.as_deref().map_or(0, estimate_tokens);
        let output_tokens = estimate_tokens(&content);

        Ok(CompletionResponse::new(content, prompt_tokens, output_tokens).with_finish_reason(finish_reason))
    }
}
