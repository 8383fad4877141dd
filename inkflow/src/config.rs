//! Run configuration.
//!
//! A run is described by one JSON document: inputs, budget, providers, the
//! backend router, memory tuning, concurrency limits, canary defaults, the
//! repair table and the stage list. Every section but `stages` has
//! defaults.

use crate::backend::{ProviderConfig, RouterConfig};
use crate::errors::{codes, ConfigError, ContractErrorInfo};
use crate::memory::MemoryConfig;
use crate::pipeline::{CanarySettings, PipelineBuilder, StageGraph, StageSpec};
use crate::quality::RepairTable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    4
}

fn default_unit_concurrency() -> usize {
    2
}

fn default_retain() -> usize {
    10
}

/// Spend cap for the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum spend in budget units.
    pub cap: f64,
    /// With `false` spend is recorded but never refused.
    #[serde(default = "default_true")]
    pub enforce: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cap: 100.0,
            enforce: true,
        }
    }
}

/// Worker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Stages executing at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Units of one stage executing at once.
    #[serde(default = "default_unit_concurrency")]
    pub unit_concurrency: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            unit_concurrency: default_unit_concurrency(),
        }
    }
}

/// Checkpoint retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Numbered checkpoints kept per run; 0 keeps all.
    #[serde(default = "default_retain")]
    pub retain: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            retain: default_retain(),
        }
    }
}

/// The full description of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Human-readable pipeline name.
    #[serde(default)]
    pub name: String,
    /// Fixed run id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Run inputs available to every stage.
    #[serde(default)]
    pub inputs: serde_json::Value,
    /// Spend cap.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Providers by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Backend router.
    #[serde(default)]
    pub router: RouterConfig,
    /// Memory store tuning.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Worker limits.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Canary settings applied to every multi-unit stage without its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanarySettings>,
    /// Metric category to owning stage.
    #[serde(default)]
    pub repair_table: RepairTable,
    /// Checkpoint retention.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Stages, each declared after its dependencies.
    pub stages: Vec<StageSpec>,
}

fn parse_error(message: String) -> ConfigError {
    ConfigError::new(message).with_error_info(
        ContractErrorInfo::new(codes::PARSE, "Invalid run config")
            .with_fix_hint("Check the config against the documented schema; metric 'blocking' flags are required."),
    )
}

fn out_of_range(message: String, field: &str) -> ConfigError {
    ConfigError::new(message).with_error_info(
        ContractErrorInfo::new(codes::OUT_OF_RANGE, "Value out of range").with_context_entry("field", field),
    )
}

fn check_fraction(value: f64, field: &str) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(format!("'{field}' must be within [0, 1], got {value}"), field))
    }
}

impl RunConfig {
    /// A config with the given stages and defaults elsewhere.
    #[must_use]
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            run_id: None,
            inputs: serde_json::Value::Object(serde_json::Map::new()),
            budget: BudgetConfig::default(),
            providers: BTreeMap::new(),
            router: RouterConfig::default(),
            memory: MemoryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            canary: None,
            repair_table: RepairTable::default(),
            checkpoint: CheckpointConfig::default(),
            stages,
        }
    }

    /// Parses a config from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the document does not match the schema.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| parse_error(format!("Invalid run config: {e}")))
    }

    /// Parses a config from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the text is not a valid config.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| parse_error(format!("Invalid run config: {e}")))
    }

    /// Reads a config file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| parse_error(format!("Cannot read config '{}': {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the run inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the budget cap.
    #[must_use]
    pub fn with_budget(mut self, cap: f64) -> Self {
        self.budget.cap = cap;
        self
    }

    /// Adds a provider.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: ProviderConfig) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Sets the router section.
    #[must_use]
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Sets the repair table.
    #[must_use]
    pub fn with_repair_table(mut self, table: RepairTable) -> Self {
        self.repair_table = table;
        self
    }

    /// Sets the worker limits.
    #[must_use]
    pub fn with_concurrency(mut self, max_workers: usize, unit_concurrency: usize) -> Self {
        self.concurrency = ConcurrencyConfig {
            max_workers,
            unit_concurrency,
        };
        self
    }

    /// Sets the run-wide canary default.
    #[must_use]
    pub fn with_canary(mut self, canary: CanarySettings) -> Self {
        self.canary = Some(canary);
        self
    }

    /// Checks numeric ranges. Graph, kinds and metrics are checked when a
    /// run starts, against the orchestrator's registries.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.budget.cap.is_finite() && self.budget.cap > 0.0) {
            return Err(out_of_range(
                format!("Budget cap must be positive, got {}", self.budget.cap),
                "budget.cap",
            ));
        }
        check_fraction(self.router.downshift_below_remaining, "router.downshift_below_remaining")?;
        check_fraction(
            self.memory.eviction_importance_threshold,
            "memory.eviction_importance_threshold",
        )?;
        if self.concurrency.max_workers == 0 {
            return Err(out_of_range(
                "'concurrency.max_workers' must be at least 1".into(),
                "concurrency.max_workers",
            ));
        }
        if self.concurrency.unit_concurrency == 0 {
            return Err(out_of_range(
                "'concurrency.unit_concurrency' must be at least 1".into(),
                "concurrency.unit_concurrency",
            ));
        }
        let stage_canaries = self
            .stages
            .iter()
            .filter_map(|s| s.canary.as_ref().map(|c| (format!("stages.{}.canary", s.name), c)));
        let run_canary = self.canary.as_ref().map(|c| ("canary".to_string(), c));
        for (field, canary) in run_canary.into_iter().chain(stage_canaries) {
            check_fraction(canary.success_threshold, &format!("{field}.success_threshold"))?;
        }
        Ok(())
    }

    /// Builds and validates the stage graph.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for cycles, undeclared or duplicate stages.
    pub fn graph(&self) -> Result<StageGraph, ConfigError> {
        PipelineBuilder::new().stages(self.stages.iter().cloned()).build()
    }

    /// The canary settings that apply to `spec`: its own, else the run default.
    #[must_use]
    pub fn canary_for(&self, spec: &StageSpec) -> Option<CanarySettings> {
        spec.canary.or(self.canary)
    }

    /// SHA-256 over everything that affects outputs. The run id, budget and
    /// credentials are left out so resuming with a raised cap or a rotated
    /// key is not treated as a changed config.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&self.inputs).unwrap_or_default());
        for stage in &self.stages {
            hasher.update(stage.fingerprint().as_bytes());
        }
        hasher.update(serde_json::to_vec(&self.repair_table).unwrap_or_default());
        hasher.update(serde_json::to_vec(&self.canary).unwrap_or_default());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::MetricSpec;
    use serde_json::json;

    fn minimal() -> serde_json::Value {
        json!({
            "name": "novel",
            "inputs": {"premise": "a lighthouse keeper"},
            "budget": {"cap": 50.0},
            "stages": [
                {"name": "outline", "params": {"template": "Outline {{input.premise}}"}},
                {
                    "name": "draft",
                    "depends_on": ["outline"],
                    "metrics": [{"name": "non_empty", "threshold": 1.0, "blocking": true}]
                }
            ]
        })
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = RunConfig::from_value(minimal()).unwrap();
        assert!(config.budget.enforce);
        assert_eq!(config.concurrency.max_workers, 4);
        assert_eq!(config.checkpoint.retain, 10);
        assert!(config.validate().is_ok());
        assert_eq!(config.graph().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_blocking_flag_is_rejected() {
        let mut value = minimal();
        value["stages"][1]["metrics"][0]
            .as_object_mut()
            .unwrap()
            .remove("blocking");
        let err = RunConfig::from_value(value).unwrap_err();
        assert_eq!(err.code(), Some(codes::PARSE));
    }

    #[test]
    fn test_range_checks() {
        let config = RunConfig::from_value(minimal()).unwrap();

        let err = config.clone().with_budget(0.0).validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::OUT_OF_RANGE));

        let mut bad = config.clone();
        bad.router.downshift_below_remaining = 1.5;
        assert!(bad.validate().is_err());

        assert!(config.clone().with_concurrency(0, 1).validate().is_err());
        assert!(config.with_canary(CanarySettings::new(2, 2.0)).validate().is_err());
    }

    #[test]
    fn test_fingerprint_ignores_budget_and_run_id() {
        let config = RunConfig::from_value(minimal()).unwrap();
        let fp = config.fingerprint();
        assert_eq!(fp, config.clone().with_budget(500.0).with_run_id("x").fingerprint());
        assert_ne!(fp, config.clone().with_inputs(json!({"premise": "other"})).fingerprint());

        let mut changed = config;
        changed.stages[1] = changed.stages[1].clone().with_metric(MetricSpec::advisory("repetition", 0.5));
        assert_ne!(fp, changed.fingerprint());
    }

    #[test]
    fn test_stage_canary_overrides_default() {
        let config = RunConfig::new(
            "x",
            vec![StageSpec::new("a"), StageSpec::new("b").with_canary(CanarySettings::new(1, 0.5))],
        )
        .with_canary(CanarySettings::default());
        assert_eq!(config.canary_for(&config.stages[0]), Some(CanarySettings::default()));
        assert_eq!(config.canary_for(&config.stages[1]), Some(CanarySettings::new(1, 0.5)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, minimal().to_string()).unwrap();
        assert_eq!(RunConfig::from_file(&path).unwrap().name, "novel");
        assert!(RunConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
