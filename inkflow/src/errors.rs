//! Error types for the inkflow orchestrator.
//!
//! Every failure a run can hit maps onto one [`InkflowError`] variant, and every
//! variant maps onto a stable process exit code (see [`ExitCode`]).

use crate::backend::{ProviderError, ProviderErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for inkflow operations.
#[derive(Debug, Error)]
pub enum InkflowError {
    /// Invalid configuration or stage graph.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The provider rejected our credentials. Never retried.
    #[error("Provider authentication failed: {0}")]
    ProviderAuth(ProviderError),

    /// A non-retryable provider failure (malformed request).
    #[error("Provider rejected request: {0}")]
    Provider(ProviderError),

    /// Retries were exhausted against the backend.
    #[error("Backend unavailable after {attempts} attempt(s): {last_error}")]
    BackendUnavailable {
        /// Number of attempts made.
        attempts: u32,
        /// The last error observed.
        last_error: ProviderError,
    },

    /// The run's budget cap was exceeded.
    #[error("{0}")]
    BudgetExceeded(#[from] BudgetExceededError),

    /// A blocking quality gate failed with no repair attempts left.
    #[error("{0}")]
    QualityGate(#[from] QualityGateFailure),

    /// A stage failed for a reason other than its quality gate.
    #[error("Stage '{stage}' failed: {message}")]
    StageExecution {
        /// The stage name.
        stage: String,
        /// What went wrong.
        message: String,
    },

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// No persisted run with this id.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InkflowError {
    /// Creates a stage execution error.
    #[must_use]
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageExecution {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Maps a provider error that the router will not retry.
    #[must_use]
    pub fn from_terminal_provider_error(error: ProviderError) -> Self {
        match error.kind {
            ProviderErrorKind::Auth => Self::ProviderAuth(error),
            _ => Self::Provider(error),
        }
    }

    /// Returns the stable failure kind for this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::Config,
            Self::ProviderAuth(_) => FailureKind::ProviderAuth,
            Self::BudgetExceeded(_) => FailureKind::BudgetExceeded,
            Self::Provider(_)
            | Self::BackendUnavailable { .. }
            | Self::QualityGate(_)
            | Self::StageExecution { .. } => FailureKind::FatalStage,
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::RunNotFound(_) => FailureKind::RunNotFound,
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// Whether this error halts the whole run rather than a single stage.
    #[must_use]
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::ProviderAuth | FailureKind::BudgetExceeded | FailureKind::Internal
        )
    }

    /// Maps the error to its process exit code.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        self.kind().exit_code()
    }
}

/// Stable classification of run failures, persisted with the run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad configuration or DAG.
    Config,
    /// Provider credentials rejected.
    ProviderAuth,
    /// Budget cap exceeded.
    BudgetExceeded,
    /// A stage failed fatally.
    FatalStage,
    /// The run was cancelled.
    Cancelled,
    /// The run does not exist.
    RunNotFound,
    /// Anything else.
    Internal,
}

impl FailureKind {
    /// Returns the exit code for this failure kind.
    #[must_use]
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Config => ExitCode::CONFIG,
            Self::ProviderAuth => ExitCode::PROVIDER_AUTH,
            Self::BudgetExceeded => ExitCode::BUDGET_EXCEEDED,
            Self::FatalStage => ExitCode::FATAL_STAGE,
            Self::Cancelled => ExitCode::RUN_PAUSED,
            Self::RunNotFound => ExitCode::RUN_NOT_FOUND,
            Self::Internal => ExitCode::INTERNAL,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::ProviderAuth => "provider_auth",
            Self::BudgetExceeded => "budget_exceeded",
            Self::FatalStage => "fatal_stage",
            Self::Cancelled => "cancelled",
            Self::RunNotFound => "run_not_found",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Process exit codes. The numeric values are stable.
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | success |
/// | 1 | internal failure |
/// | 2 | configuration error |
/// | 3 | budget exceeded |
/// | 4 | fatal stage failure |
/// | 5 | provider authentication |
/// | 6 | run paused |
/// | 7 | run not found |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Operation completed successfully.
    pub const SUCCESS: Self = Self(0);
    /// General/internal failure.
    pub const INTERNAL: Self = Self(1);
    /// Invalid configuration or DAG.
    pub const CONFIG: Self = Self(2);
    /// Budget cap exceeded.
    pub const BUDGET_EXCEEDED: Self = Self(3);
    /// A stage failed fatally.
    pub const FATAL_STAGE: Self = Self(4);
    /// Provider rejected credentials.
    pub const PROVIDER_AUTH: Self = Self(5);
    /// The run is paused (canary refusal or explicit request).
    pub const RUN_PAUSED: Self = Self(6);
    /// The requested run does not exist.
    pub const RUN_NOT_FOUND: Self = Self(7);

    /// Returns the numeric value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONFIG-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a run configuration or its stage graph is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            codes::CYCLE,
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for ConfigError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Stable configuration error codes.
pub mod codes {
    /// Dependency cycle.
    pub const CYCLE: &str = "CONFIG-001-CYCLE";
    /// Dependency not declared before use.
    pub const MISSING_DEP: &str = "CONFIG-002-MISSING_DEP";
    /// Duplicate stage name.
    pub const DUPLICATE: &str = "CONFIG-003-DUPLICATE";
    /// Pipeline without stages.
    pub const EMPTY: &str = "CONFIG-004-EMPTY";
    /// Unknown stage kind.
    pub const UNKNOWN_KIND: &str = "CONFIG-005-UNKNOWN_KIND";
    /// Unknown scoring function.
    pub const UNKNOWN_METRIC: &str = "CONFIG-006-UNKNOWN_METRIC";
    /// Value outside its allowed range.
    pub const OUT_OF_RANGE: &str = "CONFIG-007-RANGE";
    /// Repair table points at an unknown stage.
    pub const REPAIR_TARGET: &str = "CONFIG-008-REPAIR_TARGET";
    /// Config file unreadable or malformed.
    pub const PARSE: &str = "CONFIG-009-PARSE";
    /// A tier names a provider that is not registered.
    pub const UNKNOWN_PROVIDER: &str = "CONFIG-010-UNKNOWN_PROVIDER";
}

/// Provides default suggestions for configuration error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            codes::CYCLE => Some(
                "Check your stage dependencies for circular references. \
                 Use a linear chain or fan-out pattern instead.",
            ),
            codes::MISSING_DEP => Some(
                "List every stage after the stages it depends on. \
                 Check for typos in stage names.",
            ),
            codes::DUPLICATE => Some("Stage names must be unique within a run."),
            codes::EMPTY => Some("Add at least one stage to the run configuration."),
            codes::UNKNOWN_KIND => Some(
                "Register the stage kind in the StageRegistry or use a built-in kind such as 'prompt'.",
            ),
            codes::UNKNOWN_METRIC => Some(
                "Register the scoring function in the MetricRegistry or use a built-in one.",
            ),
            codes::REPAIR_TARGET => Some("Repair table entries must name a declared stage."),
            codes::UNKNOWN_PROVIDER => Some(
                "Declare the provider under 'providers' or register it on the Orchestrator.",
            ),
            _ => None,
        }
    }
}

/// Error returned by the budget ledger once the cap is crossed.
///
/// The charge that triggered it has already been recorded.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Budget exceeded: spent {total:.2} of cap {cap:.2}")]
pub struct BudgetExceededError {
    /// The configured cap.
    pub cap: f64,
    /// The ledger total after the charge.
    pub total: f64,
}

/// A blocking quality gate failed and no repair attempts remain.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Quality gate failed for stage '{stage}' on metric '{metric}' (score {score:.3}, threshold {threshold:.3}) after {attempts} attempt(s)")]
pub struct QualityGateFailure {
    /// The stage whose gate failed.
    pub stage: String,
    /// The first failing blocking metric.
    pub metric: String,
    /// The score observed.
    pub score: f64,
    /// The configured threshold.
    pub threshold: f64,
    /// Executions of the stage so far.
    pub attempts: u32,
}
