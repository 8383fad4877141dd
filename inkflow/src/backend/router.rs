//! Tier selection, retries and budget charging for provider calls.

use super::provider::{CompletionProvider, CompletionRequest, CompletionResponse, ProviderError};
use super::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::budget::{BudgetLedger, LedgerEntry};
use crate::core::{BackendTier, Criticality};
use crate::errors::{codes, ConfigError, ContractErrorInfo, InkflowError};
use crate::events::{names, RunEvents};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-tier pricing in budget units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPricing {
    /// Flat cost of every call.
    pub cost_per_call: f64,
    /// Cost per prompt token.
    pub cost_per_input_token: f64,
    /// Cost per completion token.
    pub cost_per_output_token: f64,
}

impl TierPricing {
    /// Pricing that charges a flat amount per call.
    #[must_use]
    pub fn per_call(cost: f64) -> Self {
        Self {
            cost_per_call: cost,
            ..Self::default()
        }
    }

    /// Cost of one call with the given token counts.
    #[must_use]
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        self.cost_per_call
            + input_tokens as f64 * self.cost_per_input_token
            + output_tokens as f64 * self.cost_per_output_token
    }
}

/// Configuration of one backend tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Name of the provider serving this tier.
    pub provider: String,
    /// Model requested from the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Pricing.
    #[serde(flatten)]
    pub pricing: TierPricing,
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Non-critical work goes to the cheapest tier once the remaining
    /// budget fraction is at or below this value.
    pub downshift_below_remaining: f64,
    /// Per-call deadline in milliseconds.
    pub call_deadline_ms: u64,
    /// Retry limits.
    pub retry: RetryPolicy,
    /// Configured tiers.
    pub tiers: BTreeMap<BackendTier, TierConfig>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            downshift_below_remaining: 0.2,
            call_deadline_ms: 120_000,
            retry: RetryPolicy::default(),
            tiers: BTreeMap::new(),
        }
    }
}

/// A completion plus routing diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResponse {
    /// The provider's answer.
    pub response: CompletionResponse,
    /// The tier that served the call.
    pub tier: BackendTier,
    /// Calls made, including the successful one.
    pub attempts: u32,
    /// Backoff delays slept before retries.
    pub backoff_delays: Vec<Duration>,
    /// Total cost charged for this invocation.
    pub cost: f64,
}

#[derive(Clone)]
struct TierBackend {
    provider: Arc<dyn CompletionProvider>,
    model: Option<String>,
    pricing: TierPricing,
}

/// Routes completion requests to a tier, retries transient failures and
/// charges every call to the run's ledger.
pub struct BackendRouter {
    ledger: Arc<BudgetLedger>,
    downshift_below_remaining: f64,
    call_deadline: Duration,
    retry: RetryPolicy,
    tiers: BTreeMap<BackendTier, TierBackend>,
    events: Option<RunEvents>,
    calls: AtomicU64,
}

impl std::fmt::Debug for BackendRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRouter")
            .field("tiers", &self.tiers.keys().collect::<Vec<_>>())
            .field("downshift_below_remaining", &self.downshift_below_remaining)
            .field("calls", &self.call_count())
            .finish()
    }
}

impl BackendRouter {
    /// Creates a router with no tiers.
    #[must_use]
    pub fn new(ledger: Arc<BudgetLedger>) -> Self {
        let defaults = RouterConfig::default();
        Self {
            ledger,
            downshift_below_remaining: defaults.downshift_below_remaining,
            call_deadline: Duration::from_millis(defaults.call_deadline_ms),
            retry: defaults.retry,
            tiers: BTreeMap::new(),
            events: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Builds a router from config, resolving tier providers by name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no tier is configured or a tier names an
    /// unknown provider.
    pub fn from_config(
        ledger: Arc<BudgetLedger>,
        config: &RouterConfig,
        providers: &HashMap<String, Arc<dyn CompletionProvider>>,
    ) -> Result<Self, ConfigError> {
        if config.tiers.is_empty() {
            return Err(ConfigError::new("At least one backend tier must be configured")
                .with_error_info(
                    ContractErrorInfo::new(codes::OUT_OF_RANGE, "No backend tiers")
                        .with_fix_hint("Add a 'router.tiers' entry such as \"standard\"."),
                ));
        }

        let mut router = Self::new(ledger)
            .with_downshift_below_remaining(config.downshift_below_remaining)
            .with_call_deadline(Duration::from_millis(config.call_deadline_ms))
            .with_retry_policy(config.retry.clone());

        for (tier, tier_config) in &config.tiers {
            let provider = providers.get(&tier_config.provider).ok_or_else(|| {
                ConfigError::new(format!(
                    "Tier '{tier}' references unknown provider '{}'",
                    tier_config.provider
                ))
                .with_error_info(
                    ContractErrorInfo::new(codes::UNKNOWN_PROVIDER, "Unknown provider")
                        .with_context_entry("provider", tier_config.provider.clone()),
                )
            })?;
            router.tiers.insert(
                *tier,
                TierBackend {
                    provider: Arc::clone(provider),
                    model: tier_config.model.clone(),
                    pricing: tier_config.pricing,
                },
            );
        }
        Ok(router)
    }

    /// Adds or replaces a tier.
    #[must_use]
    pub fn with_tier(
        mut self,
        tier: BackendTier,
        provider: Arc<dyn CompletionProvider>,
        pricing: TierPricing,
    ) -> Self {
        self.tiers.insert(
            tier,
            TierBackend {
                provider,
                model: None,
                pricing,
            },
        );
        self
    }

    /// Sets the downshift threshold.
    #[must_use]
    pub fn with_downshift_below_remaining(mut self, fraction: f64) -> Self {
        self.downshift_below_remaining = fraction;
        self
    }

    /// Sets the per-call deadline.
    #[must_use]
    pub fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.call_deadline = deadline;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Attaches an event handle.
    #[must_use]
    pub fn with_events(mut self, events: RunEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// The ledger this router charges.
    #[must_use]
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Provider calls made through this router.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Picks the tier for a criticality given the current budget.
    ///
    /// Returns the tier and whether it is a downshift from the nominal one.
    #[must_use]
    pub fn select_tier(&self, criticality: Criticality) -> Option<(BackendTier, bool)> {
        let nominal = self.resolve_configured(BackendTier::for_criticality(criticality))?;
        if criticality == Criticality::Critical {
            return Some((nominal, false));
        }
        if self.ledger.remaining_fraction() <= self.downshift_below_remaining {
            let cheapest = *self.tiers.keys().next()?;
            return Some((cheapest, cheapest != nominal));
        }
        Some((nominal, false))
    }

    // Nearest cheaper configured tier first, then anything more expensive.
    fn resolve_configured(&self, wanted: BackendTier) -> Option<BackendTier> {
        if self.tiers.contains_key(&wanted) {
            return Some(wanted);
        }
        self.tiers
            .range(..wanted)
            .next_back()
            .or_else(|| self.tiers.range(wanted..).next())
            .map(|(tier, _)| *tier)
    }

    /// Sends a request on behalf of `stage`.
    ///
    /// # Errors
    ///
    /// - `BudgetExceeded` if the ledger cannot hold the tier's flat cost
    ///   before a call
    /// - `ProviderAuth` or `Provider` for non-retryable provider errors
    /// - `BackendUnavailable` once retries are exhausted
    pub async fn invoke(
        &self,
        stage: &str,
        mut request: CompletionRequest,
        criticality: Criticality,
    ) -> Result<RoutedResponse, InkflowError> {
        let (tier, downshifted) = self.select_tier(criticality).ok_or_else(|| {
            InkflowError::Config(ConfigError::new("No backend tiers configured"))
        })?;
        let backend = self
            .tiers
            .get(&tier)
            .cloned()
            .ok_or_else(|| InkflowError::Internal(format!("tier {tier} vanished")))?;

        if downshifted {
            info!(
                stage = %stage,
                tier = %tier,
                remaining = self.ledger.remaining_fraction(),
                "Downshifting to cheaper tier"
            );
            if let Some(events) = &self.events {
                events.stage(
                    names::BACKEND_DOWNSHIFT,
                    stage,
                    json!({
                        "tier": tier,
                        "criticality": criticality,
                        "remaining_fraction": self.ledger.remaining_fraction(),
                    }),
                );
            }
        }

        if request.model.is_none() {
            request.model.clone_from(&backend.model);
        }
        request.deadline = Some(self.call_deadline);

        let mut state = RetryState::new();
        let mut cost = 0.0;

        loop {
            // Held under the ledger lock until this call is charged.
            let reservation = self.ledger.try_reserve(backend.pricing.cost_per_call)?;
            state.record_attempt();
            self.calls.fetch_add(1, Ordering::SeqCst);

            debug!(
                stage = %stage,
                tier = %tier,
                provider = backend.provider.name(),
                attempt = state.attempts(),
                reserved = reservation.amount(),
                "Invoking provider"
            );

            let outcome =
                match tokio::time::timeout(self.call_deadline, backend.provider.generate(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(format!(
                        "no response within {}ms",
                        self.call_deadline.as_millis()
                    ))),
                };

            match outcome {
                Ok(response) => {
                    let charge = backend.pricing.cost(response.input_tokens, response.output_tokens);
                    cost += charge;
                    let entry = LedgerEntry::new(
                        stage,
                        tier,
                        response.input_tokens,
                        response.output_tokens,
                        charge,
                    );
                    // An over-cap charge is still delivered; the orchestrator
                    // checkpoints it and then fails the run.
                    if let Err(exceeded) = reservation.settle(entry) {
                        debug!(stage = %stage, total = exceeded.total, "Call pushed ledger past cap");
                    }
                    let attempts = state.attempts();
                    return Ok(RoutedResponse {
                        response,
                        tier,
                        attempts,
                        backoff_delays: state.into_delays(),
                        cost,
                    });
                }
                Err(error) => {
                    if let Some(usage) = error.usage {
                        let charge = backend.pricing.cost(usage.input_tokens, usage.output_tokens);
                        cost += charge;
                        let entry = LedgerEntry::new(
                            stage,
                            tier,
                            usage.input_tokens,
                            usage.output_tokens,
                            charge,
                        )
                        .failed();
                        if let Err(exceeded) = reservation.settle(entry) {
                            debug!(stage = %stage, total = exceeded.total, "Failed call pushed ledger past cap");
                        }
                    } else {
                        drop(reservation);
                    }

                    match state.on_error(&error, &self.retry) {
                        RetryDecision::Retry(delay) => {
                            warn!(
                                stage = %stage,
                                tier = %tier,
                                attempt = state.attempts(),
                                kind = %error.kind,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error = %error,
                                "Retrying provider call"
                            );
                            if let Some(events) = &self.events {
                                events.stage(
                                    names::BACKEND_RETRY,
                                    stage,
                                    json!({
                                        "attempt": state.attempts(),
                                        "kind": error.kind,
                                        "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                    }),
                                );
                            }
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::NotRetryable => {
                            warn!(stage = %stage, kind = %error.kind, error = %error, "Provider error is not retryable");
                            return Err(InkflowError::from_terminal_provider_error(error));
                        }
                        RetryDecision::GiveUp => {
                            warn!(
                                stage = %stage,
                                attempts = state.attempts(),
                                error = %error,
                                "Provider retries exhausted"
                            );
                            return Err(InkflowError::BackendUnavailable {
                                attempts: state.attempts(),
                                last_error: error,
                            });
                        }
                    }
                }
            }
        }
    }
}
