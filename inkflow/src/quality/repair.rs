//! Repair planning for failed quality gates.
//!
//! A static table maps metric categories to the stage that owns fixing them.
//! Repairs never restart the run: only the target and its transitive
//! dependents are invalidated.

use super::gate::MetricResult;
use crate::errors::{codes, ConfigError, ContractErrorInfo};
use crate::pipeline::StageGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Category → owning stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepairTable {
    owners: BTreeMap<String, String>,
}

impl RepairTable {
    /// An empty table; every failure repairs the failing stage itself.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a category to its owning stage.
    #[must_use]
    pub fn with_owner(mut self, category: impl Into<String>, stage: impl Into<String>) -> Self {
        self.owners.insert(category.into(), stage.into());
        self
    }

    /// The stage owning `category`, if configured.
    #[must_use]
    pub fn owner(&self, category: &str) -> Option<&str> {
        self.owners.get(category).map(String::as_str)
    }

    /// Number of mapped categories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// True if no categories are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Checks that every owner is a stage of the graph.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the first unknown owner.
    pub fn validate(&self, graph: &StageGraph) -> Result<(), ConfigError> {
        for (category, stage) in &self.owners {
            if !graph.contains(stage) {
                return Err(ConfigError::new(format!(
                    "Repair table maps category '{category}' to unknown stage '{stage}'"
                ))
                .with_stages(vec![stage.clone()])
                .with_error_info(
                    ContractErrorInfo::new(codes::REPAIR_TARGET, "Unknown repair target")
                        .with_context_entry("category", category.clone()),
                ));
            }
        }
        Ok(())
    }
}

/// A repair decision, consumed once per repair cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPlan {
    /// The stage whose gate failed.
    pub failing_stage: String,
    /// Names of the failing blocking metrics.
    pub failing_metrics: Vec<String>,
    /// The stage to re-execute.
    pub target: String,
    /// The target plus every transitive dependent, in topological order.
    pub invalidated: Vec<String>,
    /// Repair attempts the target has left after this cycle.
    pub attempts_remaining: u32,
}

/// The target has no repair attempts left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairExhausted {
    /// The stage that would have been repaired.
    pub target: String,
}

/// Chooses repair targets using a [`RepairTable`].
#[derive(Debug, Clone, Default)]
pub struct RepairPlanner {
    table: RepairTable,
}

impl RepairPlanner {
    /// Creates a planner.
    #[must_use]
    pub fn new(table: RepairTable) -> Self {
        Self { table }
    }

    /// The underlying table.
    #[must_use]
    pub fn table(&self) -> &RepairTable {
        &self.table
    }

    /// The stage that should be re-executed for these failures.
    ///
    /// A category owner is used only if it is the failing stage or one of
    /// its ancestors. Among candidates, the latest in topological order
    /// wins.
    #[must_use]
    pub fn select_target(&self, failing: &[&MetricResult], stage: &str, graph: &StageGraph) -> String {
        failing
            .iter()
            .filter(|m| m.blocking && !m.passed)
            .map(|m| {
                self.table
                    .owner(&m.category)
                    .filter(|owner| graph.is_self_or_ancestor(owner, stage))
                    .unwrap_or(stage)
            })
            .max_by_key(|candidate| graph.position(candidate))
            .unwrap_or(stage)
            .to_string()
    }

    /// Plans one repair cycle.
    ///
    /// `attempts_remaining` reports the target's remaining repair attempts;
    /// the returned plan carries that value decremented once.
    ///
    /// # Errors
    ///
    /// Returns [`RepairExhausted`] when the target has no attempts left.
    pub fn plan_repair(
        &self,
        failing: &[&MetricResult],
        stage: &str,
        graph: &StageGraph,
        attempts_remaining: impl Fn(&str) -> u32,
    ) -> Result<RepairPlan, RepairExhausted> {
        let target = self.select_target(failing, stage, graph);
        let remaining = attempts_remaining(&target);
        if remaining == 0 {
            return Err(RepairExhausted { target });
        }

        let descendants = graph.descendants(&target);
        let invalidated: Vec<String> = graph
            .topological_order()
            .into_iter()
            .filter(|name| *name == target || descendants.contains(*name))
            .map(str::to_string)
            .collect();

        tracing::debug!(
            stage,
            target = %target,
            invalidated = invalidated.len(),
            attempts_remaining = remaining - 1,
            "Repair planned"
        );

        Ok(RepairPlan {
            failing_stage: stage.to_string(),
            failing_metrics: failing.iter().map(|m| m.name.clone()).collect(),
            target,
            invalidated,
            attempts_remaining: remaining - 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineBuilder, StageSpec};
    use crate::quality::Comparison;
    use pretty_assertions::assert_eq;

    fn graph() -> StageGraph {
        PipelineBuilder::new()
            .stage(StageSpec::new("outline"))
            .stage(StageSpec::new("characters").with_dependencies(["outline"]))
            .stage(StageSpec::new("draft").with_dependencies(["outline", "characters"]))
            .stage(StageSpec::new("validate").with_dependencies(["draft"]))
            .stage(StageSpec::new("blurb").with_dependencies(["outline"]))
            .build()
            .unwrap()
    }

    fn failing(name: &str, category: &str) -> MetricResult {
        MetricResult {
            name: name.to_string(),
            category: category.to_string(),
            score: 0.1,
            threshold: 0.5,
            comparison: Comparison::AtLeast,
            blocking: true,
            passed: false,
        }
    }

    fn table() -> RepairTable {
        RepairTable::new()
            .with_owner("continuity", "characters")
            .with_owner("structure", "outline")
            .with_owner("style", "blurb")
    }

    #[test]
    fn test_continuity_failure_targets_owner() {
        let planner = RepairPlanner::new(table());
        let metric = failing("overlap", "continuity");
        let calls = std::cell::Cell::new(0);

        let plan = planner
            .plan_repair(&[&metric], "validate", &graph(), |stage| {
                calls.set(calls.get() + 1);
                assert_eq!(stage, "characters");
                2
            })
            .unwrap();

        assert_eq!(plan.target, "characters");
        assert_eq!(plan.invalidated, vec!["characters", "draft", "validate"]);
        assert_eq!(plan.attempts_remaining, 1);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_unrelated_owner_falls_back_to_failing_stage() {
        let planner = RepairPlanner::new(table());
        let metric = failing("tone", "style");
        let target = planner.select_target(&[&metric], "draft", &graph());
        assert_eq!(target, "draft");
    }

    #[test]
    fn test_unmapped_category_targets_failing_stage() {
        let planner = RepairPlanner::default();
        let metric = failing("length", "general");
        let plan = planner.plan_repair(&[&metric], "draft", &graph(), |_| 1).unwrap();
        assert_eq!(plan.target, "draft");
        assert_eq!(plan.invalidated, vec!["draft", "validate"]);
        assert_eq!(plan.attempts_remaining, 0);
    }

    #[test]
    fn test_most_specific_candidate_wins() {
        let planner = RepairPlanner::new(table());
        let structure = failing("shape", "structure");
        let continuity = failing("overlap", "continuity");
        let target = planner.select_target(&[&structure, &continuity], "validate", &graph());
        assert_eq!(target, "characters");
    }

    #[test]
    fn test_exhausted_target() {
        let planner = RepairPlanner::new(table());
        let metric = failing("overlap", "continuity");
        let err = planner.plan_repair(&[&metric], "draft", &graph(), |_| 0).unwrap_err();
        assert_eq!(err.target, "characters");
    }

    #[test]
    fn test_table_validation() {
        assert!(table().validate(&graph()).is_ok());
        let err = RepairTable::new()
            .with_owner("continuity", "ghost")
            .validate(&graph())
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::REPAIR_TARGET));
    }

    #[test]
    fn test_table_deserializes_from_map() {
        let table: RepairTable =
            serde_json::from_value(serde_json::json!({"continuity": "characters"})).unwrap();
        assert_eq!(table.owner("continuity"), Some("characters"));
        assert_eq!(table.len(), 1);
    }
}
