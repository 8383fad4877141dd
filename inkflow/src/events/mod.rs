//! Domain events emitted while a run executes.
//!
//! Events complement `tracing` logs: they are structured records meant for
//! callers (dashboards, tests) rather than operators. Every event carries the
//! run id and, where relevant, the stage it concerns.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stable event type names.
pub mod names {
    /// A run was created.
    pub const RUN_STARTED: &str = "run.started";
    /// A run was resumed from its checkpoint.
    pub const RUN_RESUMED: &str = "run.resumed";
    /// A run finished successfully.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run halted with a fatal error.
    pub const RUN_FAILED: &str = "run.failed";
    /// A run was paused (request, cancel or canary).
    pub const RUN_PAUSED: &str = "run.paused";
    /// A stage started executing.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage's output was accepted.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage was skipped because a verified artifact already exists.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage failed with no way forward.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage was blocked by a fatal upstream failure.
    pub const STAGE_BLOCKED: &str = "stage.blocked";
    /// An in-flight execution was aborted by a cancel or an invalidation.
    pub const STAGE_ABORTED: &str = "stage.aborted";
    /// A quality gate was evaluated.
    pub const GATE_EVALUATED: &str = "quality.gate";
    /// A repair plan was applied.
    pub const REPAIR_PLANNED: &str = "quality.repair";
    /// A canary finished.
    pub const CANARY_COMPLETED: &str = "canary.completed";
    /// The router picked a cheaper tier than requested.
    pub const BACKEND_DOWNSHIFT: &str = "backend.downshift";
    /// The router is retrying a failed call.
    pub const BACKEND_RETRY: &str = "backend.retry";
    /// A checkpoint was written.
    pub const CHECKPOINT_WRITTEN: &str = "checkpoint.written";
}

/// One structured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// The run this event belongs to.
    pub run_id: String,
    /// Event type (see [`names`]).
    pub event_type: String,
    /// The stage concerned, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Emission time (ISO 8601).
    pub timestamp: String,
}

impl RunEvent {
    /// Creates an event with an empty payload.
    #[must_use]
    pub fn new(run_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            event_type: event_type.into(),
            stage: None,
            data: serde_json::Value::Null,
            timestamp: crate::utils::iso_timestamp(),
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// A sink bound to one run, so call sites only name the event.
#[derive(Clone)]
pub struct RunEvents {
    run_id: String,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RunEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEvents").field("run_id", &self.run_id).finish()
    }
}

impl RunEvents {
    /// Binds a sink to a run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            run_id: run_id.into(),
            sink,
        }
    }

    /// A handle that drops everything.
    #[must_use]
    pub fn noop(run_id: impl Into<String>) -> Self {
        Self::new(run_id, Arc::new(NoOpEventSink))
    }

    /// The bound run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emits a run-level event.
    pub fn run(&self, event_type: &str, data: serde_json::Value) {
        self.sink
            .emit(&RunEvent::new(&self.run_id, event_type).with_data(data));
    }

    /// Emits a stage-level event.
    pub fn stage(&self, event_type: &str, stage: &str, data: serde_json::Value) {
        self.sink.emit(
            &RunEvent::new(&self.run_id, event_type)
                .with_stage(stage)
                .with_data(data),
        );
    }
}
