//! Global subscriber initialisation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// The filter used when `RUST_LOG` is unset.
#[must_use]
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "inkflow=debug,info"
    } else {
        "inkflow=info,warn"
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `verbose`. With `json` every line is a JSON object.
/// Only the first call in a process takes effect.
pub fn init_tracing(verbose: bool, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
    };
    if result.is_ok() {
        tracing::debug!(verbose, json, "Tracing initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert!(default_filter(true).contains("debug"));
        assert!(!default_filter(false).contains("debug"));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(false, false);
        init_tracing(true, true);
    }
}
