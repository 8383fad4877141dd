//! Idempotency keys and the cross-run artifact cache.
//!
//! A stage's input key is a SHA-256 over its definition fingerprint, the run
//! inputs and the sorted hashes of its dependency artifacts. Equal keys mean
//! the stage would see exactly the same inputs, so an accepted artifact for
//! that key can be reused instead of spending on a new execution.

use crate::core::Artifact;
use crate::errors::InkflowError;
use crate::pipeline::checkpoint::{read_json, write_json};
use crate::pipeline::StageSpec;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Computes the input key of a stage execution.
#[must_use]
pub fn input_key(
    spec: &StageSpec,
    run_inputs: &serde_json::Value,
    upstream: &BTreeMap<String, Artifact>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.fingerprint().as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_string(run_inputs).unwrap_or_default().as_bytes());
    for (stage, artifact) in upstream {
        hasher.update([0u8]);
        hasher.update(stage.as_bytes());
        hasher.update(b":");
        hasher.update(artifact.content_hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Cached artifact with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    /// The cached artifact.
    pub artifact: Artifact,
    /// Unix timestamp when the cache entry expires.
    #[serde(default)]
    pub expires_at: Option<f64>,
    /// Unix timestamp when the entry was created.
    pub created_at: f64,
}

impl CachedResult {
    /// Creates a new cached result.
    #[must_use]
    pub fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            expires_at: None,
            created_at: now_secs(),
        }
    }

    /// Sets the expiration time.
    #[must_use]
    pub fn with_ttl_seconds(mut self, ttl: f64) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    /// Returns true if the entry has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires_at| now_secs() >= expires_at)
    }
}

/// Storage backend for cached artifacts keyed by input key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Gets a live, verified cached artifact.
    async fn get(&self, key: &str) -> Option<CachedResult>;

    /// Stores an artifact.
    async fn set(&self, key: &str, entry: CachedResult, ttl_seconds: Option<f64>) -> Result<(), InkflowError>;

    /// Deletes a cached artifact.
    async fn delete(&self, key: &str);

    /// Clears all entries.
    async fn clear(&self);
}

/// In-memory idempotency store.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Arc<Mutex<HashMap<String, CachedResult>>>,
}

impl InMemoryIdempotencyStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Option<CachedResult> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired() || !entry.artifact.verify() {
                entries.remove(key);
                return None;
            }
            return Some(entry.clone());
        }
        None
    }

    async fn set(&self, key: &str, mut entry: CachedResult, ttl_seconds: Option<f64>) -> Result<(), InkflowError> {
        if let Some(ttl) = ttl_seconds {
            entry = entry.with_ttl_seconds(ttl);
        }
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    async fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// File-backed store: one JSON file per input key.
#[derive(Debug, Clone)]
pub struct FileIdempotencyStore {
    dir: PathBuf,
}

impl FileIdempotencyStore {
    /// Stores entries under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        key.chars()
            .all(|c| c.is_ascii_hexdigit())
            .then(|| self.dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl IdempotencyStore for FileIdempotencyStore {
    async fn get(&self, key: &str) -> Option<CachedResult> {
        let path = self.path(key)?;
        match read_json::<CachedResult>(&path) {
            Ok(Some(entry)) if !entry.is_expired() && entry.artifact.verify() => Some(entry),
            Ok(Some(_)) => {
                let _ = std::fs::remove_file(&path);
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    async fn set(&self, key: &str, mut entry: CachedResult, ttl_seconds: Option<f64>) -> Result<(), InkflowError> {
        let path = self
            .path(key)
            .ok_or_else(|| InkflowError::Internal(format!("invalid cache key '{key}'")))?;
        if let Some(ttl) = ttl_seconds {
            entry = entry.with_ttl_seconds(ttl);
        }
        write_json(&path, &entry)
    }

    async fn delete(&self, key: &str) {
        if let Some(path) = self.path(key) {
            let _ = std::fs::remove_file(path);
        }
    }

    async fn clear(&self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
