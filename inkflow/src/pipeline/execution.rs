//! One stage execution as a spawned task.
//!
//! A job runs the stage's units (after an optional canary), assembles the
//! artifact and gates it. It never touches run state: the orchestrator task
//! owns that and applies the returned [`StageOutcome`].

use super::canary::{run_canary, CanaryResult, CanarySettings};
use crate::core::Artifact;
use crate::errors::InkflowError;
use crate::memory::MemoryWrite;
use crate::quality::{GateReport, QualityOrchestrator};
use crate::stages::{Stage, StageContext, StageUnit};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

/// Runs `units` concurrently, at most `concurrency` at a time, returning
/// results in input order.
pub(crate) async fn run_units(
    stage: &Arc<dyn Stage>,
    ctx: &Arc<StageContext>,
    units: &[StageUnit],
    concurrency: usize,
) -> Vec<Result<String, InkflowError>> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let futures = units.iter().map(|unit| {
        let permits = Arc::clone(&permits);
        async move {
            let _permit = permits
                .acquire()
                .await
                .map_err(|e| InkflowError::Internal(format!("unit semaphore closed: {e}")))?;
            stage.execute_unit(ctx, unit).await
        }
    });
    join_all(futures).await
}

/// What a stage execution produced.
#[derive(Debug)]
pub(crate) enum StageOutcome {
    /// An assembled artifact and its gate report.
    Produced {
        artifact: Artifact,
        report: GateReport,
        writes: Vec<MemoryWrite>,
        canary: Option<CanaryResult>,
    },
    /// The canary success rate was too low; nothing beyond the sample ran.
    CanaryRefused { result: CanaryResult },
    /// The execution failed before a gate could be applied.
    Failed { error: InkflowError },
}

/// Everything a spawned stage execution needs.
pub(crate) struct StageJob {
    pub stage: Arc<dyn Stage>,
    pub ctx: Arc<StageContext>,
    pub quality: Arc<QualityOrchestrator>,
    pub unit_concurrency: usize,
    pub canary: Option<CanarySettings>,
    pub input_key: String,
}

impl StageJob {
    pub async fn run(self) -> StageOutcome {
        let units = self.stage.units(&self.ctx);
        let mut outputs: BTreeMap<usize, String> = BTreeMap::new();
        let mut canary = None;

        if let Some(settings) = self.canary.filter(|s| s.applies_to(units.len())) {
            match run_canary(
                &self.stage,
                &self.ctx,
                &units,
                &settings,
                &self.quality,
                self.unit_concurrency,
            )
            .await
            {
                Ok(run) if run.result.passed => {
                    outputs = run.accepted;
                    canary = Some(run.result);
                }
                Ok(run) => return StageOutcome::CanaryRefused { result: run.result },
                Err(error) => return StageOutcome::Failed { error },
            }
        }

        let remaining: Vec<StageUnit> = units
            .iter()
            .filter(|u| !outputs.contains_key(&u.index))
            .cloned()
            .collect();
        let results = run_units(&self.stage, &self.ctx, &remaining, self.unit_concurrency).await;

        let mut first_error = None;
        for (unit, result) in remaining.iter().zip(results) {
            match result {
                Ok(content) => {
                    outputs.insert(unit.index, content);
                }
                Err(error) if error.is_run_fatal() => return StageOutcome::Failed { error },
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = first_error {
            return StageOutcome::Failed { error };
        }

        let ordered: Vec<String> = units
            .iter()
            .map(|u| outputs.remove(&u.index).unwrap_or_default())
            .collect();
        let output = match self.stage.assemble(&self.ctx, ordered) {
            Ok(output) => output,
            Err(error) => return StageOutcome::Failed { error },
        };

        let artifact = Artifact::new(self.ctx.stage_name(), output.content, output.parts)
            .with_input_key(self.input_key)
            .with_usage(self.ctx.usage());
        match self
            .quality
            .gate(&artifact, self.ctx.spec(), self.ctx.inputs().artifacts())
        {
            Ok(report) => StageOutcome::Produced {
                artifact,
                report,
                writes: self.ctx.take_writes(),
                canary,
            },
            Err(error) => StageOutcome::Failed {
                error: error.into(),
            },
        }
    }
}

/// A spawned stage execution, tagged with its stage and generation.
///
/// Dropping the task aborts the execution.
pub(crate) struct StageTask {
    stage: String,
    generation: u64,
    handle: JoinHandle<StageOutcome>,
}

impl StageTask {
    pub fn new(stage: impl Into<String>, generation: u64, handle: JoinHandle<StageOutcome>) -> Self {
        Self {
            stage: stage.into(),
            generation,
            handle,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Future for StageTask {
    type Output = (String, u64, Result<StageOutcome, JoinError>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Ready(result) => Poll::Ready((this.stage.clone(), this.generation, result)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StageTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRouter;
    use crate::budget::BudgetLedger;
    use crate::pipeline::StageSpec;
    use crate::quality::MetricSpec;
    use crate::stages::{FnStage, StageInputs};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(stage: Arc<dyn Stage>, spec: StageSpec, canary: Option<CanarySettings>) -> StageJob {
        let router = Arc::new(BackendRouter::new(Arc::new(BudgetLedger::new(1.0))));
        StageJob {
            stage,
            ctx: Arc::new(StageContext::new("run", spec, StageInputs::default(), router)),
            quality: Arc::new(QualityOrchestrator::default()),
            unit_concurrency: 2,
            canary,
            input_key: "key".into(),
        }
    }

    #[tokio::test]
    async fn test_units_assembled_in_order() {
        let stage: Arc<dyn Stage> = Arc::new(
            FnStage::new("chapters", |_, unit| Ok(format!("Chapter {}", unit.label)))
                .with_units(["one", "two", "three"]),
        );
        let outcome = job(stage, StageSpec::new("chapters"), None).run().await;
        match outcome {
            StageOutcome::Produced { artifact, report, .. } => {
                assert_eq!(artifact.parts, vec!["Chapter one", "Chapter two", "Chapter three"]);
                assert_eq!(artifact.input_key, "key");
                assert!(report.passed);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_canary_outputs_are_reused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let stage: Arc<dyn Stage> = Arc::new(
            FnStage::new("chapters", move |_, unit| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("Chapter {}", unit.index))
            })
            .with_units(["a", "b", "c", "d", "e"]),
        );
        let spec = StageSpec::new("chapters").with_metric(MetricSpec::blocking("non_empty", 1.0));
        let outcome = job(stage, spec, Some(CanarySettings::new(2, 0.9))).run().await;

        assert!(matches!(outcome, StageOutcome::Produced { canary: Some(_), .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_unit_error_fails_execution() {
        let stage: Arc<dyn Stage> = Arc::new(
            FnStage::new("chapters", |_, unit| {
                if unit.index == 1 {
                    Err(InkflowError::stage("chapters", "model refused"))
                } else {
                    Ok("text".into())
                }
            })
            .with_units(["a", "b"]),
        );
        let outcome = job(stage, StageSpec::new("chapters"), None).run().await;
        match outcome {
            StageOutcome::Failed { error } => assert!(error.to_string().contains("model refused")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
