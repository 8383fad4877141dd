//! The validated stage DAG.
//!
//! Stages are stored in declaration order. Because every dependency must be
//! declared before use, that order is already a topological order.

use super::StageSpec;
use crate::core::StageStatus;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A directed acyclic graph of stage specs.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
}

impl StageGraph {
    /// Wraps already-validated specs. Use [`super::PipelineBuilder`] to
    /// validate.
    pub(crate) fn from_validated(stages: Vec<StageSpec>) -> Self {
        let index: HashMap<String, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        let mut dependents = vec![Vec::new(); stages.len()];
        for (i, spec) in stages.iter().enumerate() {
            for dep in &spec.depends_on {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }
        Self {
            stages,
            index,
            dependents,
        }
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if the graph has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Looks up a stage.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// True if the stage exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All stages in topological (declaration) order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Stage names in topological order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Position of a stage in topological order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Direct dependencies of a stage.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.get(name).map_or(&[], |s| s.depends_on.as_slice())
    }

    /// Every stage `name` transitively depends on.
    #[must_use]
    pub fn ancestors(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.dependencies(name).iter().map(String::as_str).collect();
        while let Some(current) = queue.pop_front() {
            if seen.insert(current.to_string()) {
                queue.extend(self.dependencies(current).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Every stage that transitively depends on `name`.
    #[must_use]
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.index.get(name) else {
            return seen;
        };
        let mut queue: VecDeque<usize> = self.dependents[start].iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            if seen.insert(self.stages[current].name.clone()) {
                queue.extend(self.dependents[current].iter().copied());
            }
        }
        seen
    }

    /// True if `ancestor` is `name` or one of its transitive dependencies.
    #[must_use]
    pub fn is_self_or_ancestor(&self, ancestor: &str, name: &str) -> bool {
        ancestor == name || self.ancestors(name).contains(ancestor)
    }

    /// Schedulable stages whose dependencies have all completed, in
    /// topological order.
    #[must_use]
    pub fn ready(&self, statuses: &BTreeMap<String, StageStatus>) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|spec| {
                statuses
                    .get(&spec.name)
                    .is_some_and(StageStatus::is_schedulable)
            })
            .filter(|spec| {
                spec.depends_on
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&StageStatus::Completed))
            })
            .map(|spec| spec.name.as_str())
            .collect()
    }
}
