//! # Inkflow
//!
//! A resumable, budget-aware orchestrator for multi-stage content
//! generation pipelines.
//!
//! A run is a DAG of stages. Each stage turns its upstream artifacts into a
//! new artifact through one or more model calls, and every artifact passes a
//! quality gate before it is accepted. Inkflow provides:
//!
//! - **Bounded parallel execution**: ready stages run as soon as their
//!   dependencies are accepted, and multi-unit stages fan out
//! - **Budget enforcement**: every call is charged to a per-run ledger, and
//!   the router downshifts to cheaper backends as the cap approaches
//! - **Targeted repair**: a failed gate re-runs only the owning stage and
//!   its dependents
//! - **Checkpoint and resume**: state is written atomically after every
//!   transition; a resumed run re-executes nothing it already accepted
//! - **Tiered memory**: stages read relevant prior facts within a token
//!   budget
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use inkflow::prelude::*;
//!
//! let config = RunConfig::from_file("novella.json".as_ref())?;
//! let orchestrator = Orchestrator::new("runs");
//! let mut run = orchestrator.start(config)?;
//! let state = run.run_to_completion().await?;
//! println!("{} finished as {}", state.run_id, state.status);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod budget;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod quality;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{
        BackendRouter, CompletionProvider, CompletionRequest, CompletionResponse, EchoProvider,
        ProviderConfig, ProviderError, RouterConfig,
    };
    pub use crate::budget::BudgetLedger;
    pub use crate::cancellation::RunControl;
    pub use crate::config::RunConfig;
    pub use crate::core::{Artifact, BackendTier, Criticality, RunStatus, StageStatus};
    pub use crate::errors::{ConfigError, ContractErrorInfo, ExitCode, FailureKind, InkflowError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::memory::{MemoryFilter, MemoryStore, MemoryWrite};
    pub use crate::pipeline::{
        CheckpointStore, Orchestrator, PipelineBuilder, ResumeOptions, RunHandle, RunState,
        StageGraph, StageSpec,
    };
    pub use crate::quality::{MetricRegistry, MetricSpec, RepairTable};
    pub use crate::stages::{FnStage, PromptStage, Stage, StageContext, StageRegistry};
    pub use crate::utils::{generate_run_id, iso_timestamp};
}
