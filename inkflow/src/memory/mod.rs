//! Tiered context memory.
//!
//! Stages read bounded, relevance-ranked context from the [`MemoryStore`] and
//! stage [`MemoryWrite`]s that the orchestrator commits only once the stage's
//! output is accepted.

mod block;
mod store;

pub use block::{MemoryBlock, MemoryFilter, MemoryTier, MemoryWrite, Relation};
pub use store::{MemoryConfig, MemorySnapshot, MemoryStore, PruneReport};
