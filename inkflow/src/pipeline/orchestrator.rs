//! The run state machine.
//!
//! [`Orchestrator`] validates configs, creates and resumes runs and tracks
//! the runs active in this process. A [`RunHandle`] drives one run: a single
//! task owns the [`RunState`], spawns ready stages onto a bounded pool and
//! applies their outcomes as they arrive (accept, repair, fail, block).
//!
//! Stage lifecycle:
//!
//! ```text
//! pending -> running -> completed
//!                    -> gated_failed -> repairing -> running
//!                                    -> fatal_failed (descendants blocked)
//! ```

use super::checkpoint::CheckpointStore;
use super::context::RunContext;
use super::execution::{StageJob, StageOutcome, StageTask};
use super::idempotency::{input_key, CachedResult, FileIdempotencyStore, IdempotencyStore};
use super::state::{RunFailure, RunState, StageState};
use super::{StageGraph, StageSpec};
use crate::backend::{build_provider, BackendRouter, CompletionProvider};
use crate::budget::BudgetLedger;
use crate::cancellation::RunControl;
use crate::config::RunConfig;
use crate::core::{Artifact, RunStatus, StageStatus};
use crate::errors::{
    codes, BudgetExceededError, ConfigError, ContractErrorInfo, FailureKind, InkflowError,
    QualityGateFailure,
};
use crate::events::{names, EventSink, LoggingEventSink, RunEvents};
use crate::memory::{MemoryFilter, MemoryStore, MemoryWrite};
use crate::observability::{run_span, stage_span, SpanTimer};
use crate::quality::{GateReport, MetricRegistry, MetricResult, QualityOrchestrator};
use crate::stages::{Stage, StageContext, StageInputs, StageRegistry};
use crate::utils::{generate_run_id, is_valid_run_id};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn, Instrument};

/// Options for [`Orchestrator::resume_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Reopen a failed run even if its config is unchanged.
    pub retry_failed: bool,
    /// Run multi-unit stages without a canary this session.
    pub skip_canary: bool,
}

impl ResumeOptions {
    /// Reopen a failed run.
    #[must_use]
    pub fn retry_failed(mut self) -> Self {
        self.retry_failed = true;
        self
    }

    /// Skip canaries.
    #[must_use]
    pub fn skip_canary(mut self) -> Self {
        self.skip_canary = true;
        self
    }
}

/// What one drive of a run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    /// Stages spawned.
    pub launched: Vec<String>,
    /// Stages completed from the cross-run cache without execution.
    pub reused: Vec<String>,
    /// Stages whose output was accepted.
    pub completed: Vec<String>,
    /// Repair targets scheduled.
    pub repaired: Vec<String>,
    /// Stages that failed fatally.
    pub failed: Vec<String>,
    /// Run status afterwards.
    pub status: RunStatus,
}

fn resume_status(stage: &StageState) -> StageStatus {
    if stage.repair_feedback.is_some() {
        StageStatus::Repairing
    } else {
        StageStatus::Pending
    }
}

fn upstream_artifacts(spec: &StageSpec, accepted: &BTreeMap<String, Artifact>) -> BTreeMap<String, Artifact> {
    spec.depends_on
        .iter()
        .filter_map(|dep| accepted.get(dep).map(|a| (dep.clone(), a.clone())))
        .collect()
}

fn gate_feedback(failing: &[&MetricResult]) -> String {
    failing
        .iter()
        .map(|m| format!("{} scored {:.3} (threshold {:.3})", m.name, m.score, m.threshold))
        .collect::<Vec<_>>()
        .join("; ")
}

fn already_active(run_id: &str) -> ConfigError {
    ConfigError::new(format!("Run '{run_id}' is already active in this process")).with_error_info(
        ContractErrorInfo::new(codes::DUPLICATE, "Run already active")
            .with_fix_hint("Pause or cancel the active handle before resuming."),
    )
}

/// Creates, resumes and tracks runs.
pub struct Orchestrator {
    store: CheckpointStore,
    registry: StageRegistry,
    quality: Arc<QualityOrchestrator>,
    providers: HashMap<String, Arc<dyn CompletionProvider>>,
    sink: Arc<dyn EventSink>,
    cache: Arc<dyn IdempotencyStore>,
    active: Arc<DashMap<String, RunControl>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.store.root())
            .field("registry", &self.registry)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("active", &self.active_runs())
            .finish()
    }
}

impl Orchestrator {
    /// An orchestrator persisting runs under `root`, with the built-in
    /// stage kinds and metrics and a file cache at `<root>/cache`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let store = CheckpointStore::new(root);
        let cache: Arc<dyn IdempotencyStore> = Arc::new(FileIdempotencyStore::new(store.cache_dir()));
        Self {
            store,
            registry: StageRegistry::with_builtins(),
            quality: Arc::new(QualityOrchestrator::default()),
            providers: HashMap::new(),
            sink: Arc::new(LoggingEventSink::debug()),
            cache,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Replaces the stage registry.
    #[must_use]
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the metric registry.
    #[must_use]
    pub fn with_metrics(mut self, registry: MetricRegistry) -> Self {
        self.quality = Arc::new(QualityOrchestrator::new(registry));
        self
    }

    /// Supplies a provider instance, taking precedence over a config entry
    /// of the same name.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn CompletionProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the cross-run artifact cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn IdempotencyStore>) -> Self {
        self.cache = cache;
        self
    }

    /// The checkpoint store.
    #[must_use]
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Validates `config`, persists it with an initial checkpoint and
    /// returns a handle to drive the new run.
    ///
    /// # Errors
    ///
    /// Returns `Config` errors for invalid ranges, graphs, stage kinds,
    /// metric functions, repair targets, providers or a run id already in
    /// use, and `Io` errors from the initial checkpoint.
    pub fn start(&self, mut config: RunConfig) -> Result<RunHandle, InkflowError> {
        config.validate()?;
        let run_id = config.run_id.clone().unwrap_or_else(generate_run_id);
        if !is_valid_run_id(&run_id) {
            return Err(ConfigError::new(format!("Invalid run id '{run_id}'"))
                .with_error_info(
                    ContractErrorInfo::new(codes::OUT_OF_RANGE, "Invalid run id")
                        .with_fix_hint("Use letters, digits, '-' and '_' only."),
                )
                .into());
        }
        if self.active.contains_key(&run_id) || self.store.exists(&run_id) {
            return Err(ConfigError::new(format!("Run '{run_id}' already exists"))
                .with_error_info(
                    ContractErrorInfo::new(codes::DUPLICATE, "Duplicate run id")
                        .with_fix_hint("Resume the existing run or choose another id."),
                )
                .into());
        }
        config.run_id = Some(run_id.clone());

        let graph = config.graph()?;
        let ledger = Arc::new(BudgetLedger::new(config.budget.cap).with_enforcement(config.budget.enforce));
        let memory = Arc::new(MemoryStore::new(config.memory.clone()));
        let (ctx, stages) = self.prepare(&run_id, config, graph, ledger, memory)?;
        let store = self.store.clone().with_retention(ctx.config().checkpoint.retain);

        store.save_config(&run_id, ctx.config())?;
        let mut state = RunState::new(
            &run_id,
            &ctx.config().name,
            ctx.config().budget.cap,
            ctx.config().fingerprint(),
            ctx.graph(),
        );
        store.save_state(&mut state)?;
        info!(run_id = %run_id, stages = state.stages.len(), cap = state.budget_cap, "Run created");

        Ok(self.handle(ctx, stages, store, state, BTreeMap::new(), ResumeOptions::default()))
    }

    /// Resumes a run with its stored config.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::resume_with`].
    pub fn resume(&self, run_id: &str) -> Result<RunHandle, InkflowError> {
        self.resume_with(run_id, None, ResumeOptions::default())
    }

    /// Resumes a run from its latest checkpoint.
    ///
    /// Completed stages whose input key and artifact still verify are kept;
    /// everything else is rescheduled. A failed run is reopened only if the
    /// config changed or `options.retry_failed` is set; otherwise the
    /// returned handle reports the failure without executing anything.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for unknown runs, `Config` errors for an
    /// invalid replacement config or a run already active here, and `Io`
    /// errors from reading the checkpoint.
    pub fn resume_with(
        &self,
        run_id: &str,
        config: Option<RunConfig>,
        options: ResumeOptions,
    ) -> Result<RunHandle, InkflowError> {
        if self.active.contains_key(run_id) {
            return Err(already_active(run_id).into());
        }
        let mut state = self.store.load_state(run_id)?;
        let mut config = match config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => self.store.load_config(run_id)?,
        };
        config.run_id = Some(run_id.to_string());
        let fingerprint = config.fingerprint();
        let changed = fingerprint != state.config_fingerprint;
        let graph = config.graph()?;

        let ledger = Arc::new(BudgetLedger::restore(
            config.budget.cap,
            config.budget.enforce,
            state.ledger.clone(),
        ));
        let memory = Arc::new(MemoryStore::from_snapshot(config.memory.clone(), state.memory.clone()));
        let (ctx, stages) = self.prepare(run_id, config, graph, ledger, memory)?;
        let store = self.store.clone().with_retention(ctx.config().checkpoint.retain);
        if changed {
            store.save_config(run_id, ctx.config())?;
        }

        if state.status == RunStatus::Failed && !changed && !options.retry_failed {
            info!(run_id, "Run stays failed; retry it explicitly or change its config");
            return Ok(self.handle(ctx, stages, store, state, BTreeMap::new(), options));
        }

        state.stages = ctx
            .graph()
            .stages()
            .iter()
            .map(|spec| {
                state
                    .stage(&spec.name)
                    .cloned()
                    .unwrap_or_else(|| StageState::new(&spec.name, spec.max_repairs))
            })
            .collect();
        let reset_failed = changed || options.retry_failed;
        let artifacts = reconcile(&store, &ctx, &mut state, reset_failed)?;
        if reset_failed {
            state.failure = None;
        }
        state.status = RunStatus::Running;
        state.pause_reason = None;
        state.budget_cap = ctx.config().budget.cap;
        state.config_fingerprint = fingerprint;
        store.save_state(&mut state)?;

        info!(
            run_id,
            reused = artifacts.len(),
            config_changed = changed,
            ledger_total = ctx.ledger().total(),
            "Run resumed"
        );
        ctx.events().run(
            names::RUN_RESUMED,
            json!({"reused": artifacts.len(), "config_changed": changed}),
        );
        Ok(self.handle(ctx, stages, store, state, artifacts, options))
    }

    /// Asks an active run to pause once its in-flight stages finish.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run is not active in this process.
    pub fn pause(&self, run_id: &str, reason: impl Into<String>) -> Result<(), InkflowError> {
        let control = self
            .active
            .get(run_id)
            .ok_or_else(|| InkflowError::RunNotFound(run_id.to_string()))?;
        control.pause(reason);
        Ok(())
    }

    /// Cancels an active run, aborting its in-flight stages.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run is not active in this process.
    pub fn cancel(&self, run_id: &str, reason: impl Into<String>) -> Result<(), InkflowError> {
        let control = self
            .active
            .get(run_id)
            .ok_or_else(|| InkflowError::RunNotFound(run_id.to_string()))?;
        control.cancel(reason);
        Ok(())
    }

    /// The persisted state of a run.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` for unknown runs.
    pub fn status(&self, run_id: &str) -> Result<RunState, InkflowError> {
        self.store.load_state(run_id)
    }

    /// Persisted run ids.
    ///
    /// # Errors
    ///
    /// Returns `Io` errors from listing the root.
    pub fn list_runs(&self) -> Result<Vec<String>, InkflowError> {
        self.store.list_runs()
    }

    /// Archives a run that is not active.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the run is active and `RunNotFound` if unknown.
    pub fn delete_run(&self, run_id: &str) -> Result<PathBuf, InkflowError> {
        if self.active.contains_key(run_id) {
            return Err(already_active(run_id).into());
        }
        let archived = self.store.archive_run(run_id)?;
        info!(run_id, path = %archived.display(), "Run archived");
        Ok(archived)
    }

    /// Ids of runs with a live handle in this process, sorted.
    #[must_use]
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    fn prepare(
        &self,
        run_id: &str,
        config: RunConfig,
        graph: StageGraph,
        ledger: Arc<BudgetLedger>,
        memory: Arc<MemoryStore>,
    ) -> Result<(RunContext, HashMap<String, Arc<dyn Stage>>), InkflowError> {
        let mut stages = HashMap::new();
        for spec in graph.stages() {
            self.quality.validate(spec)?;
            stages.insert(spec.name.clone(), self.registry.resolve(spec)?);
        }
        config.repair_table.validate(&graph)?;

        let mut providers = self.providers.clone();
        for (name, provider_config) in &config.providers {
            if !providers.contains_key(name) {
                providers.insert(name.clone(), build_provider(name, provider_config)?);
            }
        }
        let events = RunEvents::new(run_id, Arc::clone(&self.sink));
        let router = BackendRouter::from_config(Arc::clone(&ledger), &config.router, &providers)?
            .with_events(events.clone());

        let ctx = RunContext::new(run_id, config, graph, ledger, memory, Arc::new(router), events);
        Ok((ctx, stages))
    }

    fn handle(
        &self,
        ctx: RunContext,
        stages: HashMap<String, Arc<dyn Stage>>,
        store: CheckpointStore,
        state: RunState,
        artifacts: BTreeMap<String, Artifact>,
        options: ResumeOptions,
    ) -> RunHandle {
        self.active
            .insert(ctx.run_id().to_string(), ctx.control().clone());
        RunHandle {
            ctx,
            state,
            stages,
            artifacts,
            store,
            cache: Arc::clone(&self.cache),
            quality: Arc::clone(&self.quality),
            active: Arc::clone(&self.active),
            skip_canary: options.skip_canary,
            halt: None,
            canary_pause: None,
            fatal: BTreeMap::new(),
            timers: HashMap::new(),
        }
    }
}

/// Re-verifies checkpointed stages in topological order and returns the
/// artifacts that may be reused.
fn reconcile(
    store: &CheckpointStore,
    ctx: &RunContext,
    state: &mut RunState,
    reset_failed: bool,
) -> Result<BTreeMap<String, Artifact>, InkflowError> {
    let mut artifacts = BTreeMap::new();
    let mut forgotten = BTreeSet::new();

    for spec in ctx.graph().stages() {
        let Some(stage) = state.stage_mut(&spec.name) else {
            continue;
        };
        match stage.status {
            StageStatus::Completed => {
                let upstream = upstream_artifacts(spec, &artifacts);
                let key = input_key(spec, &ctx.config().inputs, &upstream);
                let verified = if upstream.len() == spec.depends_on.len()
                    && stage.input_key.as_deref() == Some(key.as_str())
                {
                    match stage.artifact_hash.as_deref() {
                        Some(hash) => store.load_artifact(ctx.run_id(), hash)?,
                        None => None,
                    }
                } else {
                    None
                };
                if let Some(artifact) = verified {
                    artifacts.insert(spec.name.clone(), artifact);
                } else {
                    info!(stage = %spec.name, "Checkpointed artifact no longer matches; stage will re-run");
                    stage.invalidate(StageStatus::Pending);
                    forgotten.insert(spec.name.clone());
                }
            }
            StageStatus::Running | StageStatus::GatedFailed | StageStatus::Repairing => {
                stage.status = resume_status(stage);
            }
            StageStatus::FatalFailed | StageStatus::Blocked if reset_failed => {
                stage.invalidate(StageStatus::Pending);
                stage.attempts_remaining = spec.max_repairs;
                stage.error = None;
                stage.repair_feedback = None;
            }
            _ => {}
        }
    }
    if !forgotten.is_empty() {
        ctx.memory().forget_stages(&forgotten);
    }
    Ok(artifacts)
}

/// Drives one run.
///
/// Dropping the handle releases the run id; in-flight work of an
/// interrupted drive is aborted and redone on resume.
pub struct RunHandle {
    ctx: RunContext,
    state: RunState,
    stages: HashMap<String, Arc<dyn Stage>>,
    artifacts: BTreeMap<String, Artifact>,
    store: CheckpointStore,
    cache: Arc<dyn IdempotencyStore>,
    quality: Arc<QualityOrchestrator>,
    active: Arc<DashMap<String, RunControl>>,
    skip_canary: bool,
    halt: Option<RunFailure>,
    canary_pause: Option<String>,
    fatal: BTreeMap<String, RunFailure>,
    timers: HashMap<String, SpanTimer>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.ctx.run_id())
            .field("status", &self.state.status)
            .field("accepted", &self.artifacts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.active.remove(self.ctx.run_id());
    }
}

impl RunHandle {
    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        self.ctx.run_id()
    }

    /// The in-memory state, equal to the last checkpoint between drives.
    #[must_use]
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// The run context.
    #[must_use]
    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// An accepted artifact.
    #[must_use]
    pub fn artifact(&self, stage: &str) -> Option<&Artifact> {
        self.artifacts.get(stage)
    }

    /// Every accepted artifact, by stage.
    #[must_use]
    pub fn artifacts(&self) -> &BTreeMap<String, Artifact> {
        &self.artifacts
    }

    /// A clone of the run's control tokens, for pausing from another task.
    #[must_use]
    pub fn control(&self) -> RunControl {
        self.ctx.control().clone()
    }

    /// Requests a pause.
    pub fn pause(&self, reason: impl Into<String>) {
        self.ctx.control().pause(reason);
    }

    /// Requests cancellation.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.ctx.control().cancel(reason);
    }

    /// Launches every ready stage, waits for that wave and applies the
    /// outcomes.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Serialization` errors from checkpoint writes. Stage
    /// and run failures are recorded in the state, not returned.
    pub async fn step(&mut self) -> Result<StepReport, InkflowError> {
        self.drive(true).await
    }

    /// Schedules continuously until the run completes, fails or pauses.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Serialization` errors from checkpoint writes. Stage
    /// and run failures are recorded in the returned state.
    pub async fn run_to_completion(&mut self) -> Result<RunState, InkflowError> {
        self.drive(false).await?;
        Ok(self.state.clone())
    }

    async fn drive(&mut self, single_wave: bool) -> Result<StepReport, InkflowError> {
        let span = run_span(self.ctx.run_id(), &self.ctx.config().name);
        self.drive_inner(single_wave).instrument(span).await
    }

    async fn drive_inner(&mut self, single_wave: bool) -> Result<StepReport, InkflowError> {
        let mut report = StepReport::default();
        if matches!(
            self.state.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Paused
        ) {
            report.status = self.state.status;
            return Ok(report);
        }
        if self.state.status == RunStatus::Pending {
            self.state.status = RunStatus::Running;
            info!(stages = self.state.stages.len(), "Run started");
            self.ctx.events().run(
                names::RUN_STARTED,
                json!({"stages": self.state.stages.len(), "budget_cap": self.state.budget_cap}),
            );
            self.checkpoint()?;
        }

        let cancel = Arc::clone(self.ctx.control().cancel_token());
        let mut in_flight: FuturesUnordered<StageTask> = FuturesUnordered::new();
        let mut waves = 0usize;
        loop {
            if self.may_schedule() && (!single_wave || waves == 0) {
                self.schedule(&mut in_flight, &mut report).await?;
                waves += 1;
            }
            if in_flight.is_empty() {
                break;
            }
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = in_flight.next() => next,
            };
            if let Some((stage, generation, result)) = next {
                self.process(&stage, generation, result, &mut report).await?;
                self.prune(&mut in_flight);
            } else {
                self.discard(&mut in_flight);
                break;
            }
        }

        self.finalize(&mut report)?;
        Ok(report)
    }

    fn may_schedule(&self) -> bool {
        self.state.status == RunStatus::Running
            && self.halt.is_none()
            && self.canary_pause.is_none()
            && !self.ctx.control().is_paused()
    }

    async fn schedule(
        &mut self,
        in_flight: &mut FuturesUnordered<StageTask>,
        report: &mut StepReport,
    ) -> Result<(), InkflowError> {
        let max_workers = self.ctx.config().concurrency.max_workers;
        loop {
            let ready: Vec<String> = self
                .ctx
                .graph()
                .ready(&self.state.statuses())
                .into_iter()
                .map(str::to_string)
                .collect();
            let mut reused_any = false;
            for name in ready {
                if in_flight.len() >= max_workers || !self.may_schedule() {
                    return Ok(());
                }
                if let Some(task) = self.launch(&name).await? {
                    report.launched.push(name);
                    in_flight.push(task);
                } else {
                    report.reused.push(name);
                    reused_any = true;
                }
            }
            // A reused artifact may have made dependents ready.
            if !reused_any {
                return Ok(());
            }
        }
    }

    /// Spawns `name`, or completes it from the cache and returns `None`.
    async fn launch(&mut self, name: &str) -> Result<Option<StageTask>, InkflowError> {
        let spec = self
            .ctx
            .graph()
            .get(name)
            .cloned()
            .ok_or_else(|| InkflowError::Internal(format!("unknown stage '{name}'")))?;
        let stage = self
            .stages
            .get(name)
            .cloned()
            .ok_or_else(|| InkflowError::Internal(format!("stage '{name}' was not resolved")))?;
        let upstream = upstream_artifacts(&spec, &self.artifacts);
        let key = input_key(&spec, &self.ctx.config().inputs, &upstream);
        let repairing = self
            .state
            .stage(name)
            .is_some_and(|s| s.status == StageStatus::Repairing);

        if spec.cacheable && !repairing {
            if let Some(hit) = self.cache.get(&key).await {
                let gate = self.quality.gate(&hit.artifact, &spec, &upstream)?;
                if gate.passed {
                    debug!(stage = name, key = %key, "Reusing cached artifact");
                    self.ctx.events().stage(
                        names::STAGE_SKIPPED,
                        name,
                        json!({"reason": "cached", "artifact_hash": hit.artifact.content_hash}),
                    );
                    self.accept(name, hit.artifact, gate, Vec::new(), 0.0)?;
                    return Ok(None);
                }
                debug!(stage = name, "Cached artifact no longer passes its gate");
            }
        }

        let memory = self.ctx.memory().query(
            &MemoryFilter::for_keywords(spec.keywords.clone()).excluding_stage(name),
            spec.memory_budget_tokens,
        );
        let (generation, execution, feedback) = {
            let state = self
                .state
                .stage_mut(name)
                .ok_or_else(|| InkflowError::Internal(format!("no state for stage '{name}'")))?;
            state.status = StageStatus::Running;
            state.executions += 1;
            state.generation += 1;
            state.error = None;
            (state.generation, state.executions, state.repair_feedback.clone())
        };

        let mut ctx = StageContext::new(
            self.ctx.run_id(),
            spec.clone(),
            StageInputs::new(self.ctx.config().inputs.clone(), upstream),
            Arc::clone(self.ctx.router()),
        )
        .with_memory(memory);
        if let Some(feedback) = &feedback {
            ctx = ctx.with_repair_feedback(feedback.clone());
        }
        let canary = if self.skip_canary {
            None
        } else {
            self.ctx.config().canary_for(&spec)
        };
        let job = StageJob {
            stage,
            ctx: Arc::new(ctx),
            quality: Arc::clone(&self.quality),
            unit_concurrency: self.ctx.config().concurrency.unit_concurrency,
            canary,
            input_key: key,
        };

        info!(stage = name, generation, execution, repair = feedback.is_some(), "Stage started");
        self.ctx.events().stage(
            names::STAGE_STARTED,
            name,
            json!({"generation": generation, "execution": execution, "repair": feedback.is_some()}),
        );
        self.timers.insert(name.to_string(), SpanTimer::start(name));
        let handle = tokio::spawn(
            job.run()
                .instrument(stage_span(self.ctx.run_id(), name, generation)),
        );
        Ok(Some(StageTask::new(name, generation, handle)))
    }

    /// Cancel: in-flight executions are dropped (aborting them) and their
    /// stages rescheduled for the next resume.
    fn discard(&mut self, in_flight: &mut FuturesUnordered<StageTask>) {
        for task in in_flight.iter() {
            if let Some(stage) = self.state.stage_mut(task.stage()) {
                stage.status = resume_status(stage);
                stage.generation += 1;
            }
            self.timers.remove(task.stage());
            warn!(stage = task.stage(), "Aborted in-flight stage");
            self.ctx.events().stage(
                names::STAGE_ABORTED,
                task.stage(),
                json!({"generation": task.generation(), "reason": "cancelled"}),
            );
        }
        *in_flight = FuturesUnordered::new();
    }

    fn is_live(&self, name: &str, generation: u64) -> bool {
        self.state
            .stage(name)
            .is_some_and(|s| s.generation == generation && s.status == StageStatus::Running)
    }

    /// Drops (aborting) executions whose stage a repair invalidated, so they
    /// stop spending and free their worker slot.
    fn prune(&mut self, in_flight: &mut FuturesUnordered<StageTask>) {
        if in_flight.iter().all(|t| self.is_live(t.stage(), t.generation())) {
            return;
        }
        for task in std::mem::take(in_flight) {
            if self.is_live(task.stage(), task.generation()) {
                in_flight.push(task);
            } else {
                self.timers.remove(task.stage());
                warn!(stage = task.stage(), generation = task.generation(), "Aborted invalidated execution");
                self.ctx.events().stage(
                    names::STAGE_ABORTED,
                    task.stage(),
                    json!({"generation": task.generation(), "reason": "invalidated"}),
                );
            }
        }
    }

    async fn process(
        &mut self,
        name: &str,
        generation: u64,
        result: Result<StageOutcome, JoinError>,
        report: &mut StepReport,
    ) -> Result<(), InkflowError> {
        if !self.is_live(name, generation) {
            debug!(stage = name, generation, "Discarding result of an invalidated execution");
            return Ok(());
        }
        let duration_ms = self.timers.remove(name).map_or(0.0, |t| t.elapsed_ms());

        match result {
            Err(join_error) => {
                let error = InkflowError::stage(name, format!("stage task failed: {join_error}"));
                self.fail_stage(name, &error, report)?;
            }
            Ok(StageOutcome::Failed { error }) => self.fail_stage(name, &error, report)?,
            Ok(StageOutcome::CanaryRefused { result }) => {
                let diagnostic = result.diagnostic();
                warn!(stage = name, %diagnostic, "Canary refused full execution");
                self.ctx.events().stage(
                    names::CANARY_COMPLETED,
                    name,
                    serde_json::to_value(&result).unwrap_or_default(),
                );
                if let Some(stage) = self.state.stage_mut(name) {
                    stage.status = resume_status(stage);
                    stage.error = Some(diagnostic.clone());
                }
                self.canary_pause = Some(diagnostic);
            }
            Ok(StageOutcome::Produced {
                artifact,
                report: gate,
                writes,
                canary,
            }) => {
                if let Some(result) = canary {
                    self.ctx.events().stage(
                        names::CANARY_COMPLETED,
                        name,
                        serde_json::to_value(&result).unwrap_or_default(),
                    );
                }
                self.ctx.events().stage(
                    names::GATE_EVALUATED,
                    name,
                    json!({"passed": gate.passed, "scores": gate.scores()}),
                );
                if gate.passed {
                    let cacheable = self.ctx.graph().get(name).is_some_and(|s| s.cacheable);
                    if cacheable {
                        if let Err(e) = self
                            .cache
                            .set(&artifact.input_key, CachedResult::new(artifact.clone()), None)
                            .await
                        {
                            warn!(stage = name, error = %e, "Could not cache artifact");
                        }
                    }
                    self.accept(name, artifact, gate, writes, duration_ms)?;
                    report.completed.push(name.to_string());
                } else {
                    self.handle_gate_failure(name, &gate, report)?;
                }
            }
        }

        if self.halt.is_none() && self.ctx.ledger().is_exceeded() {
            let error = InkflowError::BudgetExceeded(BudgetExceededError {
                cap: self.ctx.ledger().cap(),
                total: self.ctx.ledger().total(),
            });
            warn!(stage = name, error = %error, "Halting run");
            self.halt = Some(RunFailure::from_error(&error, Some(name), None));
        }
        Ok(())
    }

    fn accept(
        &mut self,
        name: &str,
        artifact: Artifact,
        gate: GateReport,
        writes: Vec<MemoryWrite>,
        duration_ms: f64,
    ) -> Result<(), InkflowError> {
        self.store.save_artifact(self.ctx.run_id(), &artifact)?;
        if let Some(stage) = self.state.stage_mut(name) {
            stage.status = StageStatus::Completed;
            stage.artifact_hash = Some(artifact.content_hash.clone());
            stage.input_key = Some(artifact.input_key.clone());
            stage.last_gate = Some(gate);
            stage.error = None;
            stage.repair_feedback = None;
        }
        if !writes.is_empty() {
            self.ctx.memory().commit(name, writes);
        }
        self.ctx.memory().advance_step();

        info!(
            stage = name,
            hash = %artifact.content_hash,
            cost = artifact.usage.cost,
            calls = artifact.usage.calls,
            duration_ms,
            "Stage completed"
        );
        self.ctx.events().stage(
            names::STAGE_COMPLETED,
            name,
            json!({
                "artifact_hash": artifact.content_hash,
                "words": artifact.word_count(),
                "cost": artifact.usage.cost,
                "calls": artifact.usage.calls,
                "duration_ms": duration_ms,
            }),
        );
        self.artifacts.insert(name.to_string(), artifact);
        self.checkpoint()
    }

    fn handle_gate_failure(
        &mut self,
        name: &str,
        gate: &GateReport,
        report: &mut StepReport,
    ) -> Result<(), InkflowError> {
        let graph = Arc::clone(self.ctx.graph());
        let failing = gate.blocking_failures();
        let state = &self.state;
        let planned = self.ctx.planner().plan_repair(&failing, name, &graph, |target| {
            state.stage(target).map_or(0, |s| s.attempts_remaining)
        });
        let feedback = gate_feedback(&failing);
        let executions = self.state.stage(name).map_or(0, |s| s.executions);
        if let Some(stage) = self.state.stage_mut(name) {
            stage.status = StageStatus::GatedFailed;
            stage.last_gate = Some(gate.clone());
        }

        match planned {
            Ok(plan) => {
                for invalidated in &plan.invalidated {
                    if let Some(stage) = self.state.stage_mut(invalidated) {
                        if *invalidated == plan.target {
                            stage.invalidate(StageStatus::Repairing);
                            stage.attempts_remaining = plan.attempts_remaining;
                            stage.repair_feedback = Some(feedback.clone());
                        } else {
                            stage.invalidate(StageStatus::Pending);
                            stage.repair_feedback = None;
                        }
                    }
                    self.artifacts.remove(invalidated);
                    self.fatal.remove(invalidated);
                }
                self.ctx
                    .memory()
                    .forget_stages(&plan.invalidated.iter().cloned().collect());

                warn!(
                    stage = name,
                    target = %plan.target,
                    metrics = ?plan.failing_metrics,
                    attempts_remaining = plan.attempts_remaining,
                    "Quality gate failed; repairing"
                );
                self.ctx.events().stage(
                    names::REPAIR_PLANNED,
                    name,
                    serde_json::to_value(&plan).unwrap_or_default(),
                );
                report.repaired.push(plan.target.clone());
                self.checkpoint()
            }
            Err(exhausted) => {
                let (metric, score, threshold) = gate
                    .first_blocking_failure()
                    .map_or((String::new(), 0.0, 0.0), |m| (m.name.clone(), m.score, m.threshold));
                let error = InkflowError::QualityGate(QualityGateFailure {
                    stage: name.to_string(),
                    metric,
                    score,
                    threshold,
                    attempts: executions,
                });
                warn!(stage = name, target = %exhausted.target, "Repair attempts exhausted");
                self.mark_fatal(name, &error, executions, report)
            }
        }
    }

    fn fail_stage(&mut self, name: &str, error: &InkflowError, report: &mut StepReport) -> Result<(), InkflowError> {
        let executions = self.state.stage(name).map_or(0, |s| s.executions);
        if !error.is_run_fatal() {
            return self.mark_fatal(name, error, executions, report);
        }

        error!(stage = name, error = %error, "Run-fatal error; halting");
        if let Some(stage) = self.state.stage_mut(name) {
            stage.status = resume_status(stage);
            stage.error = Some(error.to_string());
        }
        self.ctx.events().stage(
            names::STAGE_FAILED,
            name,
            json!({"error": error.to_string(), "kind": error.kind(), "halts_run": true}),
        );
        if self.halt.is_none() {
            self.halt = Some(RunFailure::from_error(error, Some(name), Some(executions)));
        }
        Ok(())
    }

    fn mark_fatal(
        &mut self,
        name: &str,
        error: &InkflowError,
        executions: u32,
        report: &mut StepReport,
    ) -> Result<(), InkflowError> {
        error!(stage = name, error = %error, attempts = executions, "Stage failed");
        if let Some(stage) = self.state.stage_mut(name) {
            stage.status = StageStatus::FatalFailed;
            stage.error = Some(error.to_string());
            stage.repair_feedback = None;
        }
        self.ctx.events().stage(
            names::STAGE_FAILED,
            name,
            json!({"error": error.to_string(), "kind": error.kind(), "attempts": executions}),
        );

        let descendants = self.ctx.graph().descendants(name);
        for blocked in &descendants {
            if let Some(stage) = self.state.stage_mut(blocked) {
                stage.invalidate(StageStatus::Blocked);
            }
            self.artifacts.remove(blocked);
            self.ctx
                .events()
                .stage(names::STAGE_BLOCKED, blocked, json!({"cause": name}));
        }

        self.fatal.insert(
            name.to_string(),
            RunFailure::from_error(error, Some(name), Some(executions)),
        );
        report.failed.push(name.to_string());
        self.checkpoint()
    }

    fn pause_reason(&self) -> Option<String> {
        let control = self.ctx.control();
        if control.is_cancelled() {
            Some(match control.reason() {
                Some(reason) => format!("cancelled: {reason}"),
                None => "cancelled".to_string(),
            })
        } else if let Some(diagnostic) = &self.canary_pause {
            Some(diagnostic.clone())
        } else if control.is_paused() {
            Some(control.reason().unwrap_or_else(|| "paused".to_string()))
        } else {
            None
        }
    }

    fn first_fatal(&self) -> Option<RunFailure> {
        self.state
            .stages
            .iter()
            .find(|s| s.status == StageStatus::FatalFailed)
            .map(|s| {
                // Failures recorded before a restart are rebuilt from state.
                self.fatal.get(&s.name).cloned().unwrap_or_else(|| RunFailure {
                    kind: FailureKind::FatalStage,
                    stage: Some(s.name.clone()),
                    metric: s
                        .last_gate
                        .as_ref()
                        .and_then(GateReport::first_blocking_failure)
                        .map(|m| m.name.clone()),
                    attempts: Some(s.executions),
                    message: s.error.clone().unwrap_or_default(),
                })
            })
    }

    fn finalize(&mut self, report: &mut StepReport) -> Result<(), InkflowError> {
        if let Some(failure) = self.halt.clone() {
            error!(kind = %failure.kind, message = %failure.message, "Run failed");
            self.ctx.events().run(
                names::RUN_FAILED,
                serde_json::to_value(&failure).unwrap_or_default(),
            );
            self.state.status = RunStatus::Failed;
            self.state.failure = Some(failure);
        } else if self.state.all_completed() {
            info!(
                ledger_total = self.ctx.ledger().total(),
                calls = self.ctx.router().call_count(),
                "Run completed"
            );
            self.ctx.events().run(
                names::RUN_COMPLETED,
                json!({"ledger_total": self.ctx.ledger().total(), "calls": self.ctx.router().call_count()}),
            );
            self.state.status = RunStatus::Completed;
            self.state.failure = None;
            self.state.pause_reason = None;
        } else if let Some(reason) = self.pause_reason() {
            info!(reason = %reason, "Run paused");
            self.ctx
                .events()
                .run(names::RUN_PAUSED, json!({"reason": reason}));
            self.state.status = RunStatus::Paused;
            self.state.pause_reason = Some(reason);
        } else if self.ctx.graph().ready(&self.state.statuses()).is_empty() {
            let failure = self.first_fatal().unwrap_or_else(|| RunFailure {
                kind: FailureKind::Internal,
                stage: None,
                metric: None,
                attempts: None,
                message: "no runnable stages remain".to_string(),
            });
            error!(stage = ?failure.stage, message = %failure.message, "Run failed");
            self.ctx.events().run(
                names::RUN_FAILED,
                serde_json::to_value(&failure).unwrap_or_default(),
            );
            self.state.status = RunStatus::Failed;
            self.state.failure = Some(failure);
        }

        self.checkpoint()?;
        report.status = self.state.status;
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), InkflowError> {
        self.state.ledger = self.ctx.ledger().snapshot();
        self.state.ledger_total = self.ctx.ledger().total();
        self.state.memory = self.ctx.memory().snapshot();
        self.store.save_state(&mut self.state)?;
        self.ctx.events().run(
            names::CHECKPOINT_WRITTEN,
            json!({"version": self.state.checkpoint_version, "status": self.state.status}),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_status_keeps_repairs() {
        let mut stage = StageState::new("draft", 2);
        assert_eq!(resume_status(&stage), StageStatus::Pending);
        stage.repair_feedback = Some("too short".into());
        assert_eq!(resume_status(&stage), StageStatus::Repairing);
    }

    #[test]
    fn test_resume_options_builders() {
        let options = ResumeOptions::default().retry_failed().skip_canary();
        assert!(options.retry_failed && options.skip_canary);
    }

    #[test]
    fn test_gate_feedback_lists_metrics() {
        let metric = MetricResult {
            name: "length_ratio".into(),
            category: "length".into(),
            score: 0.25,
            threshold: 0.8,
            comparison: crate::quality::Comparison::AtLeast,
            blocking: true,
            passed: false,
        };
        assert_eq!(
            gate_feedback(&[&metric]),
            "length_ratio scored 0.250 (threshold 0.800)"
        );
    }
}
