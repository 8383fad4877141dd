//! Event sink trait and implementations.

use super::RunEvent;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives domain events from the orchestrator, the router and the canary
/// runner.
///
/// Emission must never fail or block for long: sinks are called from the
/// scheduling loop.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn emit(&self, event: &RunEvent);
}

/// A sink that discards all events.
///
/// Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &RunEvent) {}
}

/// A sink that forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &RunEvent) {
        let stage = event.stage.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(
                run_id = %event.run_id,
                stage = %stage,
                event_type = %event.event_type,
                data = %event.data,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                run_id = %event.run_id,
                stage = %stage,
                event_type = %event.event_type,
                data = %event.data,
                "Event: {}", event.event_type
            );
        }
    }
}

/// A sink that keeps every event in memory. Used by tests and by callers
/// that want to inspect a run after the fact.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RunEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.read().clone()
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<RunEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Counts events of exactly this type.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &RunEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::names;
    use serde_json::json;

    #[test]
    fn test_noop_and_logging_sinks_accept_events() {
        let event = RunEvent::new("run-1", names::STAGE_STARTED).with_stage("draft");
        NoOpEventSink.emit(&event);
        LoggingEventSink::default().emit(&event);
        LoggingEventSink::debug().emit(&event);
    }

    #[test]
    fn test_collecting_sink_filters() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&RunEvent::new("r", names::STAGE_STARTED));
        sink.emit(&RunEvent::new("r", names::STAGE_COMPLETED).with_data(json!({"hash": "ab"})));
        sink.emit(&RunEvent::new("r", names::BACKEND_RETRY));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.count(names::BACKEND_RETRY), 1);
        assert_eq!(sink.events()[1].data["hash"], "ab");

        sink.clear();
        assert!(sink.is_empty());
    }
}
