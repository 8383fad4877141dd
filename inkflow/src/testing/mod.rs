//! Testing utilities for inkflow pipelines.
//!
//! This module provides:
//! - A scripted completion provider and a stage that never finishes
//! - Run config fixtures and a temporary-root harness

mod fixtures;
mod mocks;

pub use fixtures::{chapters_config, flat_router, three_stage_config, TestFixture, SCRIPTED};
pub use mocks::{HangingStage, ScriptedProvider};
