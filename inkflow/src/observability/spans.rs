//! Run and stage spans.
//!
//! Every log line emitted while a stage executes carries `run_id`, `stage`
//! and `generation` from these spans, including lines from the router.

use std::time::Instant;
use tracing::Span;

/// Span covering one drive of a run.
#[must_use]
pub fn run_span(run_id: &str, name: &str) -> Span {
    tracing::info_span!("run", run_id = %run_id, pipeline = %name)
}

/// Span covering one stage execution.
#[must_use]
pub fn stage_span(run_id: &str, stage: &str, generation: u64) -> Span {
    tracing::info_span!("stage", run_id = %run_id, stage = %stage, generation)
}

/// Measures a stage execution.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// The timed name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("draft");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5.0);
        assert_eq!(timer.name(), "draft");
    }

    #[test]
    fn test_spans_build_without_subscriber() {
        let _run = run_span("run-1", "novel").entered();
        let _stage = stage_span("run-1", "draft", 2).entered();
    }
}
