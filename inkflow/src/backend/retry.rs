//! Retry classification with configurable backoff and jitter.
//!
//! The router consults a [`RetryState`] after every failed provider call. The
//! error kind decides whether to retry at all and which delay curve applies:
//! rate limits back off from a longer base without jitter, server errors and
//! timeouts back off from the normal base with jitter.

use super::provider::{ProviderError, ProviderErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied to server and timeout retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    #[default]
    Equal,
}

/// Retry limits for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum calls per invocation, including the first.
    pub max_attempts: u32,
    /// Base delay for server errors and timeouts.
    pub base_delay_ms: u64,
    /// Base delay for rate limits.
    pub rate_limit_base_delay_ms: u64,
    /// Cap on a single delay.
    pub max_delay_ms: u64,
    /// Cap on the summed delays of one invocation.
    pub max_total_delay_ms: u64,
    /// Backoff curve.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter for server errors and timeouts.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            rate_limit_base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            max_total_delay_ms: 120_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Equal,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay for server errors and timeouts.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the base delay for rate limits.
    #[must_use]
    pub fn with_rate_limit_base_delay_ms(mut self, delay: u64) -> Self {
        self.rate_limit_base_delay_ms = delay;
        self
    }

    /// Sets the per-delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the total-delay cap.
    #[must_use]
    pub fn with_max_total_delay_ms(mut self, delay: u64) -> Self {
        self.max_total_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    fn backoff(&self, base: u64, retry: u32) -> u64 {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }
}

/// What to do after a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then call again.
    Retry(Duration),
    /// Attempts or total delay exhausted.
    GiveUp,
    /// The error kind is never retried.
    NotRetryable,
}

/// Per-invocation retry bookkeeping.
#[derive(Debug, Default)]
pub struct RetryState {
    attempts: u32,
    rate_limit_retries: u32,
    transient_retries: u32,
    last_rate_limit_delay: u64,
    total_delay_ms: u64,
    delays: Vec<Duration>,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a call is about to be made.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Calls made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delays handed out so far.
    #[must_use]
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Consumes the state, returning the delays handed out.
    #[must_use]
    pub fn into_delays(self) -> Vec<Duration> {
        self.delays
    }

    /// Classifies a failure and computes the next delay.
    pub fn on_error(&mut self, error: &ProviderError, policy: &RetryPolicy) -> RetryDecision {
        let delay_ms = match error.kind {
            ProviderErrorKind::Auth | ProviderErrorKind::Malformed => {
                return RetryDecision::NotRetryable;
            }
            _ if self.attempts >= policy.max_attempts => return RetryDecision::GiveUp,
            ProviderErrorKind::RateLimit => {
                let mut delay =
                    policy.backoff(policy.rate_limit_base_delay_ms, self.rate_limit_retries);
                if let Some(hint) = error.retry_after {
                    delay = delay.max(u64::try_from(hint.as_millis()).unwrap_or(u64::MAX));
                }
                // Rate-limit waits never shrink within one invocation.
                delay = delay.max(self.last_rate_limit_delay);
                self.last_rate_limit_delay = delay;
                self.rate_limit_retries += 1;
                delay
            }
            ProviderErrorKind::Server | ProviderErrorKind::Timeout => {
                let delay = policy.backoff(policy.base_delay_ms, self.transient_retries);
                self.transient_retries += 1;
                apply_jitter(delay, policy.jitter_strategy)
            }
        };

        if self.total_delay_ms.saturating_add(delay_ms) > policy.max_total_delay_ms {
            return RetryDecision::GiveUp;
        }
        self.total_delay_ms += delay_ms;
        let delay = Duration::from_millis(delay_ms);
        self.delays.push(delay);
        RetryDecision::Retry(delay)
    }
}

fn apply_jitter(delay: u64, strategy: JitterStrategy) -> u64 {
    match strategy {
        JitterStrategy::None => delay,
        JitterStrategy::Full => {
            if delay == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..=delay)
            }
        }
        JitterStrategy::Equal => {
            let half = delay / 2;
            if half == 0 {
                delay
            } else {
                half + rand::thread_rng().gen_range(0..=half)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_rate_limit_base_delay_ms(1_000)
            .with_jitter(JitterStrategy::None)
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.rate_limit_base_delay_ms > policy.base_delay_ms);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn test_auth_and_malformed_are_not_retried() {
        let policy = no_jitter();
        let mut state = RetryState::new();
        state.record_attempt();

        assert_eq!(
            state.on_error(&ProviderError::auth("nope"), &policy),
            RetryDecision::NotRetryable
        );
        assert_eq!(
            state.on_error(&ProviderError::malformed("bad"), &policy),
            RetryDecision::NotRetryable
        );
        assert!(state.delays().is_empty());
    }

    #[test]
    fn test_rate_limit_delays_grow_from_longer_base() {
        let policy = no_jitter();
        let mut state = RetryState::new();
        let mut delays = Vec::new();
        for _ in 0..3 {
            state.record_attempt();
            match state.on_error(&ProviderError::rate_limited("429"), &policy) {
                RetryDecision::Retry(d) => delays.push(d.as_millis()),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000]);
    }

    #[test]
    fn test_retry_after_is_a_lower_bound() {
        let policy = no_jitter();
        let mut state = RetryState::new();
        state.record_attempt();
        let err = ProviderError::rate_limited("429").with_retry_after(Duration::from_secs(5));
        assert_eq!(
            state.on_error(&err, &policy),
            RetryDecision::Retry(Duration::from_millis(5_000))
        );

        // A later smaller computed delay is raised to the previous one.
        state.record_attempt();
        assert_eq!(
            state.on_error(&ProviderError::rate_limited("429"), &policy),
            RetryDecision::Retry(Duration::from_millis(5_000))
        );
    }

    #[test]
    fn test_server_backoff_without_jitter() {
        let policy = no_jitter();
        let mut state = RetryState::new();
        state.record_attempt();
        assert_eq!(
            state.on_error(&ProviderError::server("500"), &policy),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        state.record_attempt();
        assert_eq!(
            state.on_error(&ProviderError::timeout("deadline"), &policy),
            RetryDecision::Retry(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_equal_jitter_stays_in_range() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1_000)
            .with_jitter(JitterStrategy::Equal);
        for _ in 0..50 {
            let mut state = RetryState::new();
            state.record_attempt();
            match state.on_error(&ProviderError::server("500"), &policy) {
                RetryDecision::Retry(d) => {
                    assert!(d >= Duration::from_millis(500));
                    assert!(d <= Duration::from_millis(1_000));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = no_jitter().with_max_attempts(2);
        let mut state = RetryState::new();
        state.record_attempt();
        assert!(matches!(
            state.on_error(&ProviderError::server("500"), &policy),
            RetryDecision::Retry(_)
        ));
        state.record_attempt();
        assert_eq!(
            state.on_error(&ProviderError::server("500"), &policy),
            RetryDecision::GiveUp
        );
        assert_eq!(state.attempts(), 2);
    }

    #[test]
    fn test_gives_up_when_total_delay_exhausted() {
        let policy = no_jitter().with_max_total_delay_ms(2_500);
        let mut state = RetryState::new();
        state.record_attempt();
        assert!(matches!(
            state.on_error(&ProviderError::rate_limited("429"), &policy),
            RetryDecision::Retry(_)
        ));
        state.record_attempt();
        assert_eq!(
            state.on_error(&ProviderError::rate_limited("429"), &policy),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = no_jitter().with_max_delay_ms(3_000);
        assert_eq!(policy.backoff(1_000, 10), 3_000);
        let linear = no_jitter().with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.backoff(100, 2), 300);
    }
}
