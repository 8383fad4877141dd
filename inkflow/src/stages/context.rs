//! Per-execution stage context.

use crate::backend::{BackendRouter, CompletionRequest, CompletionResponse};
use crate::core::{Artifact, ArtifactUsage};
use crate::errors::InkflowError;
use crate::memory::{MemoryBlock, MemoryStore, MemoryWrite};
use crate::pipeline::StageSpec;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable view of what a stage may read: the run inputs and the
/// artifacts of its declared dependencies.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    run: serde_json::Value,
    artifacts: BTreeMap<String, Artifact>,
}

impl StageInputs {
    /// Creates stage inputs.
    #[must_use]
    pub fn new(run: serde_json::Value, artifacts: BTreeMap<String, Artifact>) -> Self {
        Self { run, artifacts }
    }

    /// A run input by key.
    #[must_use]
    pub fn input(&self, key: &str) -> Option<&serde_json::Value> {
        self.run.get(key)
    }

    /// A run input rendered as text: strings verbatim, anything else as JSON.
    #[must_use]
    pub fn input_text(&self, key: &str) -> Option<String> {
        self.input(key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// All run inputs.
    #[must_use]
    pub fn run_inputs(&self) -> &serde_json::Value {
        &self.run
    }

    /// A dependency's artifact.
    #[must_use]
    pub fn artifact(&self, stage: &str) -> Option<&Artifact> {
        self.artifacts.get(stage)
    }

    /// A dependency's content.
    #[must_use]
    pub fn content(&self, stage: &str) -> Option<&str> {
        self.artifacts.get(stage).map(|a| a.content.as_str())
    }

    /// All dependency artifacts, keyed by stage.
    #[must_use]
    pub fn artifacts(&self) -> &BTreeMap<String, Artifact> {
        &self.artifacts
    }
}

/// Everything one stage execution needs, threaded explicitly.
///
/// Completions go through the run's router so they are charged to the
/// run's ledger. Memory writes are buffered here and committed by the
/// orchestrator only if the output is accepted.
pub struct StageContext {
    run_id: String,
    spec: StageSpec,
    inputs: StageInputs,
    memory: Vec<MemoryBlock>,
    repair_feedback: Option<String>,
    router: Arc<BackendRouter>,
    usage: Mutex<ArtifactUsage>,
    writes: Mutex<Vec<MemoryWrite>>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("stage", &self.spec.name)
            .field("dependencies", &self.inputs.artifacts.keys().collect::<Vec<_>>())
            .field("memory_blocks", &self.memory.len())
            .finish()
    }
}

impl StageContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        spec: StageSpec,
        inputs: StageInputs,
        router: Arc<BackendRouter>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            spec,
            inputs,
            memory: Vec::new(),
            repair_feedback: None,
            router,
            usage: Mutex::new(ArtifactUsage::default()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Attaches the memory blocks selected for this execution.
    #[must_use]
    pub fn with_memory(mut self, blocks: Vec<MemoryBlock>) -> Self {
        self.memory = blocks;
        self
    }

    /// Attaches feedback from a failed gate.
    #[must_use]
    pub fn with_repair_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.repair_feedback = Some(feedback.into());
        self
    }

    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The stage definition.
    #[must_use]
    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    /// The stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.spec.name
    }

    /// Run inputs and dependency artifacts.
    #[must_use]
    pub fn inputs(&self) -> &StageInputs {
        &self.inputs
    }

    /// Memory blocks selected for this execution.
    #[must_use]
    pub fn memory(&self) -> &[MemoryBlock] {
        &self.memory
    }

    /// Memory blocks rendered as prompt text.
    #[must_use]
    pub fn memory_text(&self) -> String {
        MemoryStore::render(&self.memory)
    }

    /// Feedback from the gate failure that triggered this repair, if any.
    #[must_use]
    pub fn repair_feedback(&self) -> Option<&str> {
        self.repair_feedback.as_deref()
    }

    /// Requests a completion at this stage's criticality.
    ///
    /// # Errors
    ///
    /// Propagates router errors.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, InkflowError> {
        let routed = self
            .router
            .invoke(&self.spec.name, request, self.spec.criticality)
            .await?;
        self.usage.lock().absorb(&ArtifactUsage {
            input_tokens: routed.response.input_tokens,
            output_tokens: routed.response.output_tokens,
            cost: routed.cost,
            calls: routed.attempts,
        });
        Ok(routed.response)
    }

    /// Buffers a memory write.
    pub fn remember(&self, write: MemoryWrite) {
        self.writes.lock().push(write);
    }

    /// Usage accumulated so far.
    #[must_use]
    pub fn usage(&self) -> ArtifactUsage {
        *self.usage.lock()
    }

    /// Drains the buffered memory writes.
    pub fn take_writes(&self) -> Vec<MemoryWrite> {
        std::mem::take(&mut *self.writes.lock())
    }
}
