//! Quality gates and repair planning.
//!
//! Every stage output is scored by pure functions from a [`MetricRegistry`].
//! Blocking metrics that miss their threshold fail the gate and hand off to
//! the [`RepairPlanner`]; advisory ones only warn.

mod gate;
pub mod metrics;
mod repair;

pub use gate::{Comparison, GateReport, MetricResult, MetricScope, MetricSpec, QualityOrchestrator};
pub use metrics::{MetricInput, MetricRegistry, ScoringFunction};
pub use repair::{RepairExhausted, RepairPlan, RepairPlanner, RepairTable};
