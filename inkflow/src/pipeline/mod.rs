//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specs and the validated stage graph
//! - The run orchestrator and its handles
//! - Checkpoint persistence and resume reconciliation
//! - Canary trials and the cross-run artifact cache

mod builder;
mod canary;
mod checkpoint;
mod context;
mod dag;
mod execution;
mod idempotency;
mod orchestrator;
mod spec;
mod state;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use canary::{run_canary, sample_indices, CanaryResult, CanaryRun, CanarySettings};
pub use checkpoint::CheckpointStore;
pub use context::RunContext;
pub use dag::StageGraph;
pub use idempotency::{
    input_key, CachedResult, FileIdempotencyStore, IdempotencyStore, InMemoryIdempotencyStore,
};
pub use orchestrator::{Orchestrator, ResumeOptions, RunHandle, StepReport};
pub use spec::StageSpec;
pub use state::{RunFailure, RunState, StageState};
