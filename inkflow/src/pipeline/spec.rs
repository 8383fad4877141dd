//! Stage specifications.

use super::canary::CanarySettings;
use crate::core::Criticality;
use crate::errors::{codes, ConfigError, ContractErrorInfo};
use crate::quality::MetricSpec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

fn default_kind() -> String {
    "prompt".to_string()
}

fn default_max_repairs() -> u32 {
    2
}

fn default_memory_budget() -> u64 {
    1_024
}

/// Immutable definition of one stage in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name.
    pub name: String,
    /// Registry kind used to instantiate the stage.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Stages whose artifacts this stage consumes. Each must be declared
    /// earlier in the stage list.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Drives backend tier selection.
    #[serde(default)]
    pub criticality: Criticality,
    /// Repair cycles this stage may absorb before failing fatally.
    #[serde(default = "default_max_repairs")]
    pub max_repairs: u32,
    /// Whether accepted artifacts may be reused across runs.
    #[serde(default)]
    pub cacheable: bool,
    /// Keywords used for memory relevance and keyword metrics.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Quality metrics gating the stage's output.
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    /// Canary trial settings for multi-unit stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanarySettings>,
    /// Token budget for memory context pulled into prompts.
    #[serde(default = "default_memory_budget")]
    pub memory_budget_tokens: u64,
    /// Kind-specific parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StageSpec {
    /// Creates a prompt stage with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            depends_on: Vec::new(),
            criticality: Criticality::default(),
            max_repairs: default_max_repairs(),
            cacheable: false,
            keywords: Vec::new(),
            metrics: Vec::new(),
            canary: None,
            memory_budget_tokens: default_memory_budget(),
            params: serde_json::Value::Null,
        }
    }

    /// Sets the kind.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the criticality.
    #[must_use]
    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// Sets the repair bound.
    #[must_use]
    pub fn with_max_repairs(mut self, max_repairs: u32) -> Self {
        self.max_repairs = max_repairs;
        self
    }

    /// Marks the stage as cacheable across runs.
    #[must_use]
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Sets the keywords.
    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a metric.
    #[must_use]
    pub fn with_metric(mut self, metric: MetricSpec) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Sets canary settings.
    #[must_use]
    pub fn with_canary(mut self, canary: CanarySettings) -> Self {
        self.canary = Some(canary);
        self
    }

    /// Sets the memory budget.
    #[must_use]
    pub fn with_memory_budget(mut self, tokens: u64) -> Self {
        self.memory_budget_tokens = tokens;
        self
    }

    /// Sets the params.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Reads a string param.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(serde_json::Value::as_str)
    }

    /// Reads an unsigned param.
    #[must_use]
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(serde_json::Value::as_u64)
    }

    /// SHA-256 over the canonical JSON form of this definition.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Checks the definition in isolation.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an empty name, a self-dependency, a
    /// repeated dependency or a non-finite metric threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::new("Stage name cannot be empty")
                .with_error_info(ContractErrorInfo::new(codes::OUT_OF_RANGE, "Empty stage name")));
        }
        if self.name.contains(['/', '\\', '#']) {
            return Err(ConfigError::new(format!(
                "Stage name '{}' may not contain '/', '\\' or '#'",
                self.name
            ))
            .with_stages(vec![self.name.clone()]));
        }
        if self.depends_on.contains(&self.name) {
            return Err(ConfigError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::CYCLE, "Self-dependency")
                    .with_fix_hint("Remove the stage from its own depends_on list."),
            ));
        }
        let mut seen = HashSet::new();
        for dep in &self.depends_on {
            if !seen.insert(dep) {
                return Err(ConfigError::new(format!(
                    "Stage '{}' lists dependency '{dep}' twice",
                    self.name
                ))
                .with_stages(vec![self.name.clone(), dep.clone()])
                .with_error_info(ContractErrorInfo::new(codes::DUPLICATE, "Repeated dependency")));
            }
        }
        for metric in &self.metrics {
            if !metric.threshold.is_finite() {
                return Err(ConfigError::new(format!(
                    "Metric '{}' of stage '{}' has a non-finite threshold",
                    metric.name, self.name
                ))
                .with_stages(vec![self.name.clone()])
                .with_error_info(ContractErrorInfo::new(codes::OUT_OF_RANGE, "Bad threshold")));
            }
        }
        Ok(())
    }
}
