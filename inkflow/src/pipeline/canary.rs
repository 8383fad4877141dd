//! Canary trials for multi-unit stages.
//!
//! Before committing to every unit of a stage, a few evenly spaced units run
//! first. A unit succeeds when it executes without error and its output
//! passes the stage's blocking unit-scoped metrics. If too few succeed the
//! stage is refused and the run pauses; passing outputs are reused by the
//! full execution.

use super::execution::run_units;
use crate::core::Artifact;
use crate::errors::InkflowError;
use crate::quality::QualityOrchestrator;
use crate::stages::{Stage, StageContext, StageUnit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

fn default_sample_size() -> usize {
    2
}

fn default_success_threshold() -> f64 {
    0.9
}

/// Canary configuration for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanarySettings {
    /// Units in the sample.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Minimum success rate in `[0, 1]`.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
}

impl Default for CanarySettings {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CanarySettings {
    /// Creates settings.
    #[must_use]
    pub fn new(sample_size: usize, success_threshold: f64) -> Self {
        Self {
            sample_size,
            success_threshold,
        }
    }

    /// True if a stage with `units` units should run a canary first.
    #[must_use]
    pub fn applies_to(&self, units: usize) -> bool {
        self.sample_size > 0 && units > self.sample_size
    }
}

/// Evenly spaced sample of `sample_size` indices out of `total`.
#[must_use]
pub fn sample_indices(total: usize, sample_size: usize) -> Vec<usize> {
    if sample_size == 0 || total == 0 {
        return Vec::new();
    }
    if sample_size >= total {
        return (0..total).collect();
    }
    let mut indices: Vec<usize> = (0..sample_size).map(|i| i * total / sample_size).collect();
    indices.dedup();
    indices
}

/// Outcome of a canary trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryResult {
    /// The stage tried.
    pub stage: String,
    /// Indices of the sampled units.
    pub sampled: Vec<usize>,
    /// Units that executed and passed the blocking gates.
    pub succeeded: usize,
    /// `succeeded / sampled`.
    pub success_rate: f64,
    /// Threshold applied.
    pub threshold: f64,
    /// Whether full execution may proceed.
    pub passed: bool,
    /// One line per failed unit.
    pub failures: Vec<String>,
}

impl CanaryResult {
    /// One-line diagnostic for the pause reason.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        let mut message = format!(
            "canary for stage '{}' succeeded on {}/{} units ({:.0}% < {:.0}%)",
            self.stage,
            self.succeeded,
            self.sampled.len(),
            self.success_rate * 100.0,
            self.threshold * 100.0
        );
        if let Some(first) = self.failures.first() {
            message.push_str(": ");
            message.push_str(first);
        }
        message
    }
}

/// A canary result plus the unit outputs safe to reuse.
#[derive(Debug, Clone)]
pub struct CanaryRun {
    /// The trial outcome.
    pub result: CanaryResult,
    /// Outputs of units that passed, by unit index.
    pub accepted: BTreeMap<usize, String>,
}

/// Runs the sampled units of `stage` and gates each output on the stage's
/// unit-scoped metrics.
///
/// Metrics scoped to the assembled artifact are left to the full gate: a
/// single chapter says nothing about the paragraph count of the whole.
///
/// # Errors
///
/// Returns run-fatal errors (authentication, budget) raised by a unit.
pub async fn run_canary(
    stage: &Arc<dyn Stage>,
    ctx: &Arc<StageContext>,
    units: &[StageUnit],
    settings: &CanarySettings,
    quality: &QualityOrchestrator,
    unit_concurrency: usize,
) -> Result<CanaryRun, InkflowError> {
    let sampled = sample_indices(units.len(), settings.sample_size);
    let sample: Vec<StageUnit> = sampled.iter().map(|&i| units[i].clone()).collect();
    let outputs = run_units(stage, ctx, &sample, unit_concurrency).await;

    let mut accepted = BTreeMap::new();
    let mut failures = Vec::new();
    for (unit, output) in sample.iter().zip(outputs) {
        match output {
            Ok(content) => {
                let artifact = Artifact::new(ctx.stage_name(), content.clone(), Vec::new());
                match quality.gate_unit(&artifact, ctx.spec(), ctx.inputs().artifacts()) {
                    Ok(report) if report.passed => {
                        accepted.insert(unit.index, content);
                    }
                    Ok(report) => {
                        let metrics: Vec<String> = report
                            .blocking_failures()
                            .iter()
                            .map(|m| format!("{}={:.3}", m.name, m.score))
                            .collect();
                        failures.push(format!("unit {} failed gate ({})", unit.index, metrics.join(", ")));
                    }
                    Err(e) => failures.push(format!("unit {}: {e}", unit.index)),
                }
            }
            Err(e) if e.is_run_fatal() => return Err(e),
            Err(e) => failures.push(format!("unit {}: {e}", unit.index)),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let success_rate = if sampled.is_empty() {
        1.0
    } else {
        accepted.len() as f64 / sampled.len() as f64
    };
    let passed = success_rate >= settings.success_threshold;

    tracing::info!(
        stage = %ctx.stage_name(),
        sampled = sampled.len(),
        succeeded = accepted.len(),
        success_rate,
        passed,
        "Canary finished"
    );

    Ok(CanaryRun {
        result: CanaryResult {
            stage: ctx.stage_name().to_string(),
            sampled,
            succeeded: accepted.len(),
            success_rate,
            threshold: settings.success_threshold,
            passed,
            failures,
        },
        accepted,
    })
}
