//! Stage trait and implementations.
//!
//! A stage turns its inputs into an artifact. Work is split into independent
//! units (one per chapter, say) that the pipeline runs concurrently and the
//! stage then assembles.

mod context;
mod prompt;
mod registry;

pub use context::{StageContext, StageInputs};
pub use prompt::{render_template, PromptStage};
pub use registry::{StageFactory, StageRegistry};

use crate::errors::InkflowError;
use async_trait::async_trait;
use std::fmt::Debug;

/// One independent piece of a stage's work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageUnit {
    /// Position in the stage's unit list.
    pub index: usize,
    /// Label substituted for `{{unit}}`.
    pub label: String,
}

impl StageUnit {
    /// Creates a unit.
    #[must_use]
    pub fn new(index: usize, label: impl Into<String>) -> Self {
        Self {
            index,
            label: label.into(),
        }
    }

    /// The unit of a single-unit stage.
    #[must_use]
    pub fn single() -> Self {
        Self::new(0, "")
    }
}

/// The assembled output of a stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    /// The assembled payload.
    pub content: String,
    /// Per-unit outputs, empty for single-unit stages.
    pub parts: Vec<String>,
}

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// The units this execution will produce. Defaults to one unit.
    fn units(&self, _ctx: &StageContext) -> Vec<StageUnit> {
        vec![StageUnit::single()]
    }

    /// Produces one unit's output.
    async fn execute_unit(&self, ctx: &StageContext, unit: &StageUnit) -> Result<String, InkflowError>;

    /// Combines unit outputs, given in unit order.
    ///
    /// The default joins multiple units with blank lines and keeps them as
    /// parts; a single unit becomes the content as-is.
    fn assemble(&self, _ctx: &StageContext, outputs: Vec<String>) -> Result<StageOutput, InkflowError> {
        if outputs.len() == 1 {
            let content = outputs.into_iter().next().unwrap_or_default();
            return Ok(StageOutput {
                content,
                parts: Vec::new(),
            });
        }
        Ok(StageOutput {
            content: outputs.join("\n\n"),
            parts: outputs,
        })
    }
}

type UnitFn = dyn Fn(&StageContext, &StageUnit) -> Result<String, InkflowError> + Send + Sync;

/// A stage backed by a plain function, for custom or offline stages.
pub struct FnStage {
    name: String,
    units: Vec<String>,
    func: Box<UnitFn>,
}

impl FnStage {
    /// Creates a single-unit function stage.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StageContext, &StageUnit) -> Result<String, InkflowError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            units: Vec::new(),
            func: Box::new(func),
        }
    }

    /// Splits the stage into labelled units.
    #[must_use]
    pub fn with_units<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.units = labels.into_iter().map(Into::into).collect();
        self
    }
}

impl Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("units", &self.units.len())
            .finish()
    }
}

#[async_trait]
impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn units(&self, _ctx: &StageContext) -> Vec<StageUnit> {
        if self.units.is_empty() {
            return vec![StageUnit::single()];
        }
        self.units
            .iter()
            .enumerate()
            .map(|(i, label)| StageUnit::new(i, label.clone()))
            .collect()
    }

    async fn execute_unit(&self, ctx: &StageContext, unit: &StageUnit) -> Result<String, InkflowError> {
        (self.func)(ctx, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetLedger;
    use crate::backend::BackendRouter;
    use crate::pipeline::StageSpec;
    use std::sync::Arc;

    fn context(name: &str) -> StageContext {
        let router = Arc::new(BackendRouter::new(Arc::new(BudgetLedger::new(1.0))));
        StageContext::new("run-1", StageSpec::new(name), StageInputs::default(), router)
    }

    #[tokio::test]
    async fn test_fn_stage_single_unit() {
        let stage = FnStage::new("title", |_, _| Ok("The Lighthouse".to_string()));
        let ctx = context("title");

        let units = stage.units(&ctx);
        assert_eq!(units, vec![StageUnit::single()]);
        let out = stage.execute_unit(&ctx, &units[0]).await.unwrap();
        let assembled = stage.assemble(&ctx, vec![out]).unwrap();
        assert_eq!(assembled.content, "The Lighthouse");
        assert!(assembled.parts.is_empty());
    }

    #[tokio::test]
    async fn test_fn_stage_units_assemble_in_order() {
        let stage = FnStage::new("chapters", |_, unit| Ok(format!("Chapter {}", unit.label)))
            .with_units(["one", "two"]);
        let ctx = context("chapters");

        let mut outputs = Vec::new();
        for unit in stage.units(&ctx) {
            outputs.push(stage.execute_unit(&ctx, &unit).await.unwrap());
        }
        let assembled = stage.assemble(&ctx, outputs).unwrap();
        assert_eq!(assembled.content, "Chapter one\n\nChapter two");
        assert_eq!(assembled.parts.len(), 2);
    }

    #[test]
    fn test_context_buffers_writes() {
        let ctx = context("draft");
        ctx.remember(crate::memory::MemoryWrite::new("Mira is a keeper", 0.8));
        assert_eq!(ctx.take_writes().len(), 1);
        assert!(ctx.take_writes().is_empty());
        assert_eq!(ctx.usage().calls, 0);
    }
}
