//! Metric specs, gate evaluation and reports.

use super::metrics::{MetricInput, MetricRegistry};
use crate::core::Artifact;
use crate::errors::{codes, ConfigError, ContractErrorInfo};
use crate::pipeline::StageSpec;
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

fn default_category() -> String {
    "general".to_string()
}

/// How a score is compared to its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Passes when `score >= threshold`.
    AtLeast,
    /// Passes when `score <= threshold`.
    AtMost,
}

impl Default for Comparison {
    fn default() -> Self {
        Self::AtLeast
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtLeast => write!(f, "at_least"),
            Self::AtMost => write!(f, "at_most"),
        }
    }
}

impl Comparison {
    /// Applies the comparison. Non-finite scores never pass.
    #[must_use]
    pub fn passes(self, score: f64, threshold: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        match self {
            Self::AtLeast => score >= threshold,
            Self::AtMost => score <= threshold,
        }
    }
}

/// What output a metric is meaningful on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricScope {
    /// Only the assembled artifact (counts, lengths against a stage target).
    #[default]
    Artifact,
    /// A single unit's output as well as the assembled artifact. Canary
    /// trials gate sampled units on these metrics only.
    Unit,
}

/// One quality metric attached to a stage.
///
/// `blocking` has no default: a config that omits it fails to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric name, unique within the stage.
    pub name: String,
    /// Scoring function id; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Category used by the repair table.
    #[serde(default = "default_category")]
    pub category: String,
    /// Pass threshold.
    pub threshold: f64,
    /// Comparison direction.
    #[serde(default)]
    pub comparison: Comparison,
    /// Whether a failure fails the gate or only warns.
    pub blocking: bool,
    /// Which outputs the metric applies to.
    #[serde(default)]
    pub scope: MetricScope,
    /// Function-specific params.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl MetricSpec {
    fn new(name: impl Into<String>, threshold: f64, blocking: bool) -> Self {
        Self {
            name: name.into(),
            function: None,
            category: default_category(),
            threshold,
            comparison: Comparison::default(),
            blocking,
            scope: MetricScope::default(),
            params: serde_json::Value::Null,
        }
    }

    /// A metric whose failure fails the gate.
    #[must_use]
    pub fn blocking(name: impl Into<String>, threshold: f64) -> Self {
        Self::new(name, threshold, true)
    }

    /// A metric whose failure is only a warning.
    #[must_use]
    pub fn advisory(name: impl Into<String>, threshold: f64) -> Self {
        Self::new(name, threshold, false)
    }

    /// Sets the scoring function id.
    #[must_use]
    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    /// Sets the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the comparison.
    #[must_use]
    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = comparison;
        self
    }

    /// Sets the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: MetricScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the params.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// The scoring function id to look up.
    #[must_use]
    pub fn function_name(&self) -> &str {
        self.function.as_deref().unwrap_or(&self.name)
    }
}

/// The outcome of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    /// Metric name.
    pub name: String,
    /// Metric category.
    pub category: String,
    /// Score observed.
    pub score: f64,
    /// Threshold applied.
    pub threshold: f64,
    /// Comparison applied.
    pub comparison: Comparison,
    /// Whether the metric is blocking.
    pub blocking: bool,
    /// Whether the score passed.
    pub passed: bool,
}

/// All metric results for one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    /// The stage evaluated.
    pub stage: String,
    /// Per-metric results, in declaration order.
    pub results: Vec<MetricResult>,
    /// False if any blocking metric failed.
    pub passed: bool,
    /// When the gate ran.
    pub evaluated_at: String,
}

impl GateReport {
    /// Failing blocking metrics.
    #[must_use]
    pub fn blocking_failures(&self) -> Vec<&MetricResult> {
        self.results
            .iter()
            .filter(|r| r.blocking && !r.passed)
            .collect()
    }

    /// Failing advisory metrics.
    #[must_use]
    pub fn warnings(&self) -> Vec<&MetricResult> {
        self.results
            .iter()
            .filter(|r| !r.blocking && !r.passed)
            .collect()
    }

    /// The first failing blocking metric, if any.
    #[must_use]
    pub fn first_blocking_failure(&self) -> Option<&MetricResult> {
        self.results.iter().find(|r| r.blocking && !r.passed)
    }

    /// Scores keyed by metric name.
    #[must_use]
    pub fn scores(&self) -> BTreeMap<String, f64> {
        self.results
            .iter()
            .map(|r| (r.name.clone(), r.score))
            .collect()
    }
}

/// Evaluates stage metrics against a [`MetricRegistry`].
#[derive(Debug, Clone)]
pub struct QualityOrchestrator {
    registry: Arc<MetricRegistry>,
}

impl Default for QualityOrchestrator {
    fn default() -> Self {
        Self::new(MetricRegistry::with_builtins())
    }
}

impl QualityOrchestrator {
    /// Wraps a registry.
    #[must_use]
    pub fn new(registry: MetricRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Checks that every metric of `stage` names a known function.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the first unknown function.
    pub fn validate(&self, stage: &StageSpec) -> Result<(), ConfigError> {
        for metric in &stage.metrics {
            if !self.registry.contains(metric.function_name()) {
                return Err(ConfigError::new(format!(
                    "Stage '{}' uses unknown metric function '{}'",
                    stage.name,
                    metric.function_name()
                ))
                .with_stages(vec![stage.name.clone()])
                .with_error_info(
                    ContractErrorInfo::new(codes::UNKNOWN_METRIC, "Unknown metric function")
                        .with_context_entry("metric", metric.name.clone())
                        .with_fix_hint(format!(
                            "Known functions: {}",
                            self.registry.names().join(", ")
                        )),
                ));
            }
        }
        Ok(())
    }

    /// Scores every metric of the stage.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a metric names an unknown function.
    pub fn evaluate(
        &self,
        artifact: &Artifact,
        stage: &StageSpec,
        priors: &BTreeMap<String, Artifact>,
    ) -> Result<BTreeMap<String, f64>, ConfigError> {
        Ok(self
            .score_all(artifact, stage, priors, |_| true)?
            .into_iter()
            .map(|(metric, score)| (metric.name.clone(), score))
            .collect())
    }

    /// Scores the stage's metrics and applies their thresholds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a metric names an unknown function.
    pub fn gate(
        &self,
        artifact: &Artifact,
        stage: &StageSpec,
        priors: &BTreeMap<String, Artifact>,
    ) -> Result<GateReport, ConfigError> {
        self.gate_where(artifact, stage, priors, |_| true)
    }

    /// Gates one unit's output on the stage's unit-scoped metrics.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a metric names an unknown function.
    pub fn gate_unit(
        &self,
        output: &Artifact,
        stage: &StageSpec,
        priors: &BTreeMap<String, Artifact>,
    ) -> Result<GateReport, ConfigError> {
        self.gate_where(output, stage, priors, |m| m.scope == MetricScope::Unit)
    }

    fn gate_where(
        &self,
        artifact: &Artifact,
        stage: &StageSpec,
        priors: &BTreeMap<String, Artifact>,
        include: impl Fn(&MetricSpec) -> bool,
    ) -> Result<GateReport, ConfigError> {
        let results: Vec<MetricResult> = self
            .score_all(artifact, stage, priors, include)?
            .into_iter()
            .map(|(metric, score)| MetricResult {
                name: metric.name.clone(),
                category: metric.category.clone(),
                score,
                threshold: metric.threshold,
                comparison: metric.comparison,
                blocking: metric.blocking,
                passed: metric.comparison.passes(score, metric.threshold),
            })
            .collect();
        let passed = results.iter().all(|r| r.passed || !r.blocking);

        for warning in results.iter().filter(|r| !r.blocking && !r.passed) {
            tracing::warn!(
                stage = %stage.name,
                metric = %warning.name,
                score = warning.score,
                threshold = warning.threshold,
                "Advisory metric below threshold"
            );
        }
        tracing::debug!(stage = %stage.name, passed, metrics = results.len(), "Gate evaluated");

        Ok(GateReport {
            stage: stage.name.clone(),
            results,
            passed,
            evaluated_at: iso_timestamp(),
        })
    }

    fn score_all<'s>(
        &self,
        artifact: &Artifact,
        stage: &'s StageSpec,
        priors: &BTreeMap<String, Artifact>,
        include: impl Fn(&MetricSpec) -> bool,
    ) -> Result<Vec<(&'s MetricSpec, f64)>, ConfigError> {
        self.validate(stage)?;
        Ok(stage
            .metrics
            .iter()
            .filter(|metric| include(metric))
            .filter_map(|metric| {
                let function = self.registry.get(metric.function_name())?;
                let score = function.score(&MetricInput {
                    artifact,
                    stage,
                    params: &metric.params,
                    priors,
                });
                Some((metric, score))
            })
            .collect())
    }
}
