//! Completion providers and the tiered router in front of them.
//!
//! Stages never talk to a provider directly. They hand a
//! [`CompletionRequest`] and their criticality to the [`BackendRouter`], which
//! picks a tier, applies the retry policy and charges the run's ledger.

mod echo;
#[cfg(feature = "http")]
mod http;
mod provider;
mod retry;
mod router;

pub use echo::EchoProvider;
#[cfg(feature = "http")]
pub use http::{classify_status, HttpCompletionProvider};
pub use provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, FinishReason, ProviderError,
    ProviderErrorKind, TokenUsage,
};
pub use retry::{BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy, RetryState};
pub use router::{BackendRouter, RoutedResponse, RouterConfig, TierConfig, TierPricing};

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declarative provider definition from a run config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// The offline echo provider.
    Echo {
        /// Optional prefix on every completion.
        #[serde(default)]
        prefix: Option<String>,
    },
    /// An OpenAI-compatible HTTP endpoint.
    Http {
        /// Base URL, e.g. `https://api.openai.com/v1`.
        base_url: String,
        /// Model used when a tier does not name one.
        model: String,
        /// Bearer token. Filled from `api_key_env` by the CLI.
        #[serde(default, skip_serializing)]
        api_key: Option<String>,
        /// Environment variable holding the token. Never read by the core.
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

/// Instantiates a provider from its config.
///
/// # Errors
///
/// Returns `ConfigError` for an HTTP provider when the crate was built
/// without the `http` feature.
pub fn build_provider(
    name: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn CompletionProvider>, ConfigError> {
    match config {
        ProviderConfig::Echo { prefix } => {
            let mut provider = EchoProvider::new();
            if let Some(prefix) = prefix {
                provider = provider.with_prefix(prefix.clone());
            }
            Ok(Arc::new(provider))
        }
        #[cfg(feature = "http")]
        ProviderConfig::Http {
            base_url,
            model,
            api_key,
            ..
        } => {
            let mut provider = HttpCompletionProvider::new(name, base_url.clone(), model.clone());
            if let Some(key) = api_key {
                provider = provider.with_api_key(key.clone());
            }
            Ok(Arc::new(provider))
        }
        #[cfg(not(feature = "http"))]
        ProviderConfig::Http { .. } => Err(ConfigError::new(format!(
            "Provider '{name}' needs the 'http' feature"
        ))
        .with_error_info(crate::errors::ContractErrorInfo::new(
            crate::errors::codes::UNKNOWN_PROVIDER,
            "HTTP providers are not compiled in",
        ))),
    }
}
