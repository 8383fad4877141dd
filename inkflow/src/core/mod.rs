//! Core domain model types for inkflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage status, run status and criticality enums
//! - Artifacts and their usage accounting

mod artifact;
mod status;

pub use artifact::{content_hash, Artifact, ArtifactUsage};
pub use status::{BackendTier, Criticality, RunStatus, StageStatus};
