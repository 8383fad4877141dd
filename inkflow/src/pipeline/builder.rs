//! Stage graph builder with validation.

use super::{StageGraph, StageSpec};
use crate::errors::{codes, ConfigError, ContractErrorInfo, CycleDetectedError};
use std::collections::{HashMap, HashSet};

/// Collects stage specs and validates them into a [`StageGraph`].
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<StageSpec>,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Appends several stages.
    #[must_use]
    pub fn stages(mut self, specs: impl IntoIterator<Item = StageSpec>) -> Self {
        self.stages.extend(specs);
        self
    }

    /// Number of stages collected.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates and builds the graph.
    ///
    /// Checks, in order: non-empty, each spec on its own, unique names,
    /// known dependencies, no cycles, and every dependency declared before
    /// the stage that uses it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first violation.
    pub fn build(self) -> Result<StageGraph, ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::new("Pipeline has no stages").with_error_info(
                ContractErrorInfo::new(codes::EMPTY, "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage before building."),
            ));
        }

        for spec in &self.stages {
            spec.validate()?;
        }

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (i, spec) in self.stages.iter().enumerate() {
            if positions.insert(spec.name.as_str(), i).is_some() {
                return Err(ConfigError::new(format!("Duplicate stage name '{}'", spec.name))
                    .with_stages(vec![spec.name.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::DUPLICATE, "Duplicate stage")
                            .with_context_entry("stage", spec.name.clone()),
                    ));
            }
        }

        for spec in &self.stages {
            for dep in &spec.depends_on {
                if !positions.contains_key(dep.as_str()) {
                    return Err(ConfigError::new(format!(
                        "Stage '{}' depends on unknown stage '{dep}'",
                        spec.name
                    ))
                    .with_stages(vec![spec.name.clone(), dep.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::MISSING_DEP, format!("Dependency '{dep}' not found"))
                            .with_fix_hint("Declare the dependency as a stage."),
                    ));
                }
            }
        }

        self.detect_cycles()?;

        for (i, spec) in self.stages.iter().enumerate() {
            for dep in &spec.depends_on {
                if positions[dep.as_str()] > i {
                    return Err(ConfigError::new(format!(
                        "Stage '{}' uses '{dep}' before it is declared",
                        spec.name
                    ))
                    .with_stages(vec![spec.name.clone(), dep.clone()])
                    .with_error_info(
                        ContractErrorInfo::new(codes::MISSING_DEP, "Dependency declared after use")
                            .with_fix_hint("Move the dependency above the stage that uses it."),
                    ));
                }
            }
        }

        Ok(StageGraph::from_validated(self.stages))
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let by_name: HashMap<&str, &StageSpec> =
            self.stages.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for spec in &self.stages {
            if !visited.contains(spec.name.as_str()) {
                if let Some(cycle) =
                    dfs_cycle(&by_name, &spec.name, &mut visited, &mut on_stack, &mut path)
                {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }
}

fn dfs_cycle<'a>(
    by_name: &HashMap<&'a str, &'a StageSpec>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    if let Some(spec) = by_name.get(node) {
        for dep in &spec.depends_on {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(by_name, dep, visited, on_stack, path) {
                    return Some(cycle);
                }
            } else if on_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_stack.remove(node);
    None
}
