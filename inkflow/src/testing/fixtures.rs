//! Test fixtures for pipeline testing.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use crate::backend::{RouterConfig, TierConfig, TierPricing};
use crate::config::RunConfig;
use crate::core::BackendTier;
use crate::events::CollectingEventSink;
use crate::pipeline::{InMemoryIdempotencyStore, Orchestrator, StageSpec};
use crate::quality::{MetricScope, MetricSpec};
use crate::stages::StageRegistry;

use super::mocks::ScriptedProvider;

/// Name under which fixtures register the scripted provider.
pub const SCRIPTED: &str = "scripted";

/// A router config sending every tier to `provider` at a flat price.
#[must_use]
pub fn flat_router(provider: &str, cost_per_call: f64) -> RouterConfig {
    let mut router = RouterConfig::default();
    for tier in [BackendTier::Economy, BackendTier::Standard, BackendTier::Premium] {
        router.tiers.insert(
            tier,
            TierConfig {
                provider: provider.to_string(),
                model: None,
                pricing: TierPricing::per_call(cost_per_call),
            },
        );
    }
    router
}

/// The outline, draft, validate chain.
///
/// Cap 100, ten per call, the scripted provider on every tier. `draft` is
/// gated on `non_empty` and may absorb three repairs.
#[must_use]
pub fn three_stage_config(run_id: &str) -> RunConfig {
    RunConfig::new(
        "novella",
        vec![
            StageSpec::new("outline")
                .with_keywords(["lighthouse"])
                .with_params(json!({"template": "Outline a story about {{input.premise}}"})),
            StageSpec::new("draft")
                .with_dependencies(["outline"])
                .with_max_repairs(3)
                .with_metric(MetricSpec::blocking("non_empty", 1.0))
                .with_params(json!({"template": "Draft from: {{artifact.outline}} {{repair.feedback}}"})),
            StageSpec::new("validate")
                .with_dependencies(["draft"])
                .with_params(json!({"template": "Check: {{artifact.draft}}"})),
        ],
    )
    .with_run_id(run_id)
    .with_inputs(json!({"premise": "a lighthouse keeper"}))
    .with_budget(100.0)
    .with_router(flat_router(SCRIPTED, 10.0))
}

/// A single multi-unit stage writing `units` chapters, each gated on
/// `non_empty`.
#[must_use]
pub fn chapters_config(run_id: &str, units: usize) -> RunConfig {
    RunConfig::new(
        "chapters",
        vec![StageSpec::new("chapters")
            .with_metric(MetricSpec::blocking("non_empty", 1.0).with_scope(MetricScope::Unit))
            .with_params(json!({"template": "Write chapter {{unit}}", "units": units}))],
    )
    .with_run_id(run_id)
    .with_budget(100.0)
    .with_router(flat_router(SCRIPTED, 1.0))
}

/// A temporary run root with a scripted provider and collected events.
#[derive(Debug)]
pub struct TestFixture {
    /// Keeps the root alive.
    pub dir: TempDir,
    /// The provider registered as [`SCRIPTED`].
    pub provider: Arc<ScriptedProvider>,
    /// Every event emitted by orchestrators built from this fixture.
    pub events: Arc<CollectingEventSink>,
    /// Cross-run cache shared by those orchestrators.
    pub cache: Arc<InMemoryIdempotencyStore>,
}

impl TestFixture {
    /// A fixture around `provider`.
    ///
    /// # Panics
    ///
    /// Panics if a temporary directory cannot be created.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(provider: ScriptedProvider) -> Self {
        Self {
            dir: TempDir::new().expect("temporary run root"),
            provider: Arc::new(provider),
            events: Arc::new(CollectingEventSink::new()),
            cache: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }

    /// The run root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// An orchestrator over this fixture's root with the built-in stages.
    #[must_use]
    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(StageRegistry::with_builtins())
    }

    /// An orchestrator with a custom stage registry.
    #[must_use]
    pub fn orchestrator_with(&self, registry: StageRegistry) -> Orchestrator {
        Orchestrator::new(self.root())
            .with_registry(registry)
            .with_provider(SCRIPTED, self.provider.clone())
            .with_event_sink(self.events.clone())
            .with_cache(self.cache.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_stage_config_is_valid() {
        let config = three_stage_config("fixture");
        config.validate().unwrap();
        let graph = config.graph().unwrap();
        assert_eq!(graph.topological_order(), vec!["outline", "draft", "validate"]);
        assert_eq!(config.router.tiers.len(), 3);
    }
}
