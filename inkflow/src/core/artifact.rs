//! Artifacts produced by stage executions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Token and cost usage accumulated while producing an artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactUsage {
    /// Prompt tokens across all calls.
    pub input_tokens: u64,
    /// Completion tokens across all calls.
    pub output_tokens: u64,
    /// Cost charged to the ledger.
    pub cost: f64,
    /// Router calls made (including failed attempts).
    pub calls: u32,
}

impl ArtifactUsage {
    /// Adds another usage record into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
        self.calls += other.calls;
    }
}

/// The output of one stage execution.
///
/// The content hash covers `content` and `parts` only, so re-executing a
/// deterministic stage with unchanged inputs reproduces the same hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// The producing stage.
    pub stage: String,
    /// The assembled payload.
    pub content: String,
    /// Per-unit outputs, in unit order (empty for single-unit stages).
    #[serde(default)]
    pub parts: Vec<String>,
    /// SHA-256 of the payload.
    pub content_hash: String,
    /// Idempotency key of the inputs that produced this artifact.
    #[serde(default)]
    pub input_key: String,
    /// Usage spent producing it.
    #[serde(default)]
    pub usage: ArtifactUsage,
    /// When the artifact was created (ISO 8601).
    pub created_at: String,
}

impl Artifact {
    /// Creates a new artifact, computing its content hash.
    #[must_use]
    pub fn new(stage: impl Into<String>, content: impl Into<String>, parts: Vec<String>) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content, &parts);
        Self {
            stage: stage.into(),
            content,
            parts,
            content_hash,
            input_key: String::new(),
            usage: ArtifactUsage::default(),
            created_at: crate::utils::iso_timestamp(),
        }
    }

    /// Sets the input key.
    #[must_use]
    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = key.into();
        self
    }

    /// Sets the usage.
    #[must_use]
    pub fn with_usage(mut self, usage: ArtifactUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Re-hashes the payload and compares against the recorded hash.
    #[must_use]
    pub fn verify(&self) -> bool {
        content_hash(&self.content, &self.parts) == self.content_hash
    }

    /// Number of whitespace-separated words in the content.
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

/// Computes the content hash of an artifact payload.
#[must_use]
pub fn content_hash(content: &str, parts: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    for part in parts {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
