//! OpenAI-compatible chat completions over HTTP.

use super::provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, FinishReason, ProviderError,
    ProviderErrorKind, TokenUsage,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A provider speaking the `/chat/completions` protocol.
#[derive(Debug, Clone)]
pub struct HttpCompletionProvider {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl HttpCompletionProvider {
    /// Creates a provider for `base_url` (without the `/chat/completions` suffix).
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            default_model: default_model.into(),
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// The endpoint requests are posted to.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Maps an HTTP status to a failure kind. `None` means success.
#[must_use]
pub fn classify_status(status: StatusCode) -> Option<ProviderErrorKind> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        401 | 403 => ProviderErrorKind::Auth,
        429 => ProviderErrorKind::RateLimit,
        408 | 504 => ProviderErrorKind::Timeout,
        400 | 404 | 413 | 422 => ProviderErrorKind::Malformed,
        s if s >= 500 => ProviderErrorKind::Server,
        _ => ProviderErrorKind::Malformed,
    })
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let secs: f64 = value?.to_str().ok()?.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        debug!(provider = %self.name, model = %model, "Posting chat completion");

        let mut builder = self
            .client
            .post(self.endpoint())
            .timeout(request.deadline.unwrap_or(DEFAULT_TIMEOUT))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::timeout(e.to_string())
            } else {
                ProviderError::server(format!("transport error: {e}"))
            }
        })?;

        let status = response.status();
        if let Some(kind) = classify_status(status) {
            let retry_after = parse_retry_after(response.headers().get(reqwest::header::RETRY_AFTER));
            let detail = response.text().await.unwrap_or_default();
            let mut error = ProviderError::new(kind, format!("HTTP {status}: {detail}"));
            if let Some(wait) = retry_after {
                error = error.with_retry_after(wait);
            }
            return Err(error);
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::server(format!("unreadable response body: {e}")))?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            let mut error = ProviderError::server("response contained no choices");
            if let Some(usage) = usage {
                error = error.with_usage(usage);
            }
            error
        })?;

        let finish_reason = match choice.finish_reason.as_deref() {
            None | Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some(_) => FinishReason::Other,
        };
        let usage = usage.unwrap_or_default();

        Ok(CompletionResponse::new(
            choice.message.content.unwrap_or_default(),
            usage.input_tokens,
            usage.output_tokens,
        )
        .with_finish_reason(finish_reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), Some(ProviderErrorKind::Auth));
        assert_eq!(classify_status(StatusCode::FORBIDDEN), Some(ProviderErrorKind::Auth));
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), Some(ProviderErrorKind::RateLimit));
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), Some(ProviderErrorKind::Malformed));
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Some(ProviderErrorKind::Server));
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), Some(ProviderErrorKind::Timeout));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let header = HeaderValue::from_static("3");
        assert_eq!(parse_retry_after(Some(&header)), Some(Duration::from_secs(3)));
        let bad = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&bad)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let provider = HttpCompletionProvider::new("openai", "https://api.example.com/v1/", "gpt");
        assert_eq!(provider.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn test_chat_response_parsing() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hi"},"finish_reason":"length"}],
                       "usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hi"));
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 12);
    }
}
