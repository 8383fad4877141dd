//! Persisted run and stage state.
//!
//! Every field added after the first release carries `#[serde(default)]` so
//! older `state.json` files keep loading; unknown fields are ignored.

use super::StageGraph;
use crate::budget::LedgerEntry;
use crate::core::{RunStatus, StageStatus};
use crate::errors::{FailureKind, InkflowError};
use crate::memory::MemorySnapshot;
use crate::quality::GateReport;
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-stage checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    /// Stage name.
    pub name: String,
    /// Current status.
    #[serde(default)]
    pub status: StageStatus,
    /// Hash of the accepted artifact.
    #[serde(default)]
    pub artifact_hash: Option<String>,
    /// Input key the accepted artifact was produced from.
    #[serde(default)]
    pub input_key: Option<String>,
    /// Repair cycles this stage may still absorb.
    #[serde(default)]
    pub attempts_remaining: u32,
    /// Executions started so far.
    #[serde(default)]
    pub executions: u32,
    /// Bumped on every launch and invalidation; stale results are dropped.
    #[serde(default)]
    pub generation: u64,
    /// The most recent gate report.
    #[serde(default)]
    pub last_gate: Option<GateReport>,
    /// The most recent error, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// Gate feedback handed to the next repair execution.
    #[serde(default)]
    pub repair_feedback: Option<String>,
}

impl StageState {
    /// A fresh pending stage.
    #[must_use]
    pub fn new(name: impl Into<String>, attempts_remaining: u32) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            artifact_hash: None,
            input_key: None,
            attempts_remaining,
            executions: 0,
            generation: 0,
            last_gate: None,
            error: None,
            repair_feedback: None,
        }
    }

    /// Forgets the accepted artifact and bumps the generation.
    pub fn invalidate(&mut self, status: StageStatus) {
        self.status = status;
        self.artifact_hash = None;
        self.input_key = None;
        self.generation += 1;
    }
}

/// Why a run failed, with enough detail to diagnose without re-running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stable failure kind.
    pub kind: FailureKind,
    /// The stage involved, if any.
    #[serde(default)]
    pub stage: Option<String>,
    /// The failing metric, for gate failures.
    #[serde(default)]
    pub metric: Option<String>,
    /// Executions of the stage, for stage failures.
    #[serde(default)]
    pub attempts: Option<u32>,
    /// Human-readable message.
    pub message: String,
}

impl RunFailure {
    /// Builds a failure record from an error.
    #[must_use]
    pub fn from_error(error: &InkflowError, stage: Option<&str>, attempts: Option<u32>) -> Self {
        let metric = match error {
            InkflowError::QualityGate(failure) => Some(failure.metric.clone()),
            _ => None,
        };
        Self {
            kind: error.kind(),
            stage: stage.map(str::to_string),
            metric,
            attempts,
            message: error.to_string(),
        }
    }
}

/// The persisted state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Run identifier.
    pub run_id: String,
    /// Run name from the config.
    #[serde(default)]
    pub name: String,
    /// Run status.
    pub status: RunStatus,
    /// Budget cap.
    pub budget_cap: f64,
    /// Ledger total at the last checkpoint.
    pub ledger_total: f64,
    /// Stage records in topological order.
    pub stages: Vec<StageState>,
    /// Bumped on every checkpoint write.
    pub checkpoint_version: u64,
    /// Creation time (RFC 3339).
    #[serde(default)]
    pub created_at: String,
    /// Last update time (RFC 3339).
    #[serde(default)]
    pub updated_at: String,
    /// Fingerprint of the config the run was last started or resumed with.
    #[serde(default)]
    pub config_fingerprint: String,
    /// Set when the run failed.
    #[serde(default)]
    pub failure: Option<RunFailure>,
    /// Set when the run paused.
    #[serde(default)]
    pub pause_reason: Option<String>,
    /// Every ledger entry so far.
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
    /// Memory store image.
    #[serde(default)]
    pub memory: MemorySnapshot,
}

impl RunState {
    /// Initial state for a new run.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        name: impl Into<String>,
        budget_cap: f64,
        config_fingerprint: impl Into<String>,
        graph: &StageGraph,
    ) -> Self {
        let now = iso_timestamp();
        Self {
            run_id: run_id.into(),
            name: name.into(),
            status: RunStatus::Pending,
            budget_cap,
            ledger_total: 0.0,
            stages: graph
                .stages()
                .iter()
                .map(|spec| StageState::new(&spec.name, spec.max_repairs))
                .collect(),
            checkpoint_version: 0,
            created_at: now.clone(),
            updated_at: now,
            config_fingerprint: config_fingerprint.into(),
            failure: None,
            pause_reason: None,
            ledger: Vec::new(),
            memory: MemorySnapshot::default(),
        }
    }

    /// Looks up a stage record.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Looks up a stage record mutably.
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageState> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// Status by stage name.
    #[must_use]
    pub fn statuses(&self) -> BTreeMap<String, StageStatus> {
        self.stages
            .iter()
            .map(|s| (s.name.clone(), s.status))
            .collect()
    }

    /// True if every stage completed.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.stages.iter().all(|s| s.status == StageStatus::Completed)
    }

    /// Number of stages with the given status.
    #[must_use]
    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// Accepted artifact hashes by stage.
    #[must_use]
    pub fn artifact_hashes(&self) -> BTreeMap<String, String> {
        self.stages
            .iter()
            .filter_map(|s| s.artifact_hash.clone().map(|h| (s.name.clone(), h)))
            .collect()
    }

    /// Updates `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = iso_timestamp();
    }
}
