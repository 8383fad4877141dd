//! Run control: cooperative pause and cancel.
//!
//! Pause lets in-flight stages finish and checkpoint before scheduling halts.
//! Cancel also aborts in-flight stages and discards their unchecked work.

mod token;

pub use token::CancellationToken;

use std::sync::Arc;

/// Pause and cancel tokens for one run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pause: Arc<CancellationToken>,
    cancel: Arc<CancellationToken>,
}

impl RunControl {
    /// Fresh, un-triggered control tokens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a pause.
    pub fn pause(&self, reason: impl Into<String>) {
        self.pause.cancel(reason);
    }

    /// Requests cancellation. Cancel implies pause.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.cancel.cancel(reason.clone());
        self.pause.cancel(reason);
    }

    /// True once a pause (or cancel) was requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause.is_cancelled()
    }

    /// True once a cancel was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The reason given with the first pause or cancel request.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.cancel.reason().or_else(|| self.pause.reason())
    }

    /// The pause token.
    #[must_use]
    pub fn pause_token(&self) -> &Arc<CancellationToken> {
        &self.pause
    }

    /// The cancel token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_implies_pause() {
        let control = RunControl::new();
        control.cancel("cancelled");
        assert!(control.is_paused());
        assert!(control.is_cancelled());
        assert_eq!(control.reason().as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_pause_does_not_cancel() {
        let control = RunControl::new();
        control.pause("operator");
        assert!(control.is_paused());
        assert!(!control.is_cancelled());
        assert_eq!(control.reason().as_deref(), Some("operator"));
    }
}
