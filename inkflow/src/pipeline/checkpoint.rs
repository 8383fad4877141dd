//! File-based checkpoint store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<run_id>/state.json              latest run state
//! <root>/<run_id>/config.json             config the run uses
//! <root>/<run_id>/artifacts/<hash>.json   content-addressed artifacts
//! <root>/<run_id>/checkpoints/<n>.json    numbered state copies (audit)
//! <root>/cache/<input_key>.json           cross-run artifact cache
//! <root>/archive/<run_id>/                deleted runs
//! ```
//!
//! Every write goes to a temp file in the target directory, is fsynced and
//! then renamed over the target, so readers never see a partial file.

use super::RunState;
use crate::config::RunConfig;
use crate::core::Artifact;
use crate::errors::InkflowError;
use crate::utils::is_valid_run_id;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";
const ARTIFACTS_DIR: &str = "artifacts";
const CHECKPOINTS_DIR: &str = "checkpoints";
/// Directory name of the cross-run cache.
pub const CACHE_DIR: &str = "cache";
const ARCHIVE_DIR: &str = "archive";

fn default_retain() -> usize {
    10
}

/// Writes `bytes` to `path` atomically.
///
/// # Errors
///
/// Returns any IO error from creating, syncing or renaming the temp file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
///
/// # Errors
///
/// Returns `Serialization` or `Io` errors.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), InkflowError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes)?;
    Ok(())
}

/// Reads JSON from `path`, returning `None` if the file does not exist.
///
/// # Errors
///
/// Returns `Serialization` or `Io` errors.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, InkflowError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persists run state, configs and artifacts under one root directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    retain: usize,
}

impl CheckpointStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retain: default_retain(),
        }
    }

    /// Sets how many numbered checkpoints to keep per run. Zero keeps all.
    #[must_use]
    pub fn with_retention(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The cross-run cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// The directory of one run.
    #[must_use]
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// True if a state file exists for the run.
    #[must_use]
    pub fn exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id).join(STATE_FILE).is_file()
    }

    fn check_id(run_id: &str) -> Result<(), InkflowError> {
        if is_valid_run_id(run_id) && ![CACHE_DIR, ARCHIVE_DIR].contains(&run_id) {
            Ok(())
        } else {
            Err(InkflowError::RunNotFound(run_id.to_string()))
        }
    }

    /// Writes the run's config copy.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` or `Io` errors.
    pub fn save_config(&self, run_id: &str, config: &RunConfig) -> Result<(), InkflowError> {
        Self::check_id(run_id)?;
        write_json(&self.run_dir(run_id).join(CONFIG_FILE), config)
    }

    /// Reads the run's config copy.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run has no config.
    pub fn load_config(&self, run_id: &str) -> Result<RunConfig, InkflowError> {
        Self::check_id(run_id)?;
        read_json(&self.run_dir(run_id).join(CONFIG_FILE))?
            .ok_or_else(|| InkflowError::RunNotFound(run_id.to_string()))
    }

    /// Writes a checkpoint: bumps the version, replaces `state.json` and
    /// stores a numbered copy, pruning old copies beyond the retention.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` or `Io` errors.
    pub fn save_state(&self, state: &mut RunState) -> Result<(), InkflowError> {
        Self::check_id(&state.run_id)?;
        state.checkpoint_version += 1;
        state.touch();

        let dir = self.run_dir(&state.run_id);
        let bytes = serde_json::to_vec_pretty(state)?;
        atomic_write(
            &dir.join(CHECKPOINTS_DIR)
                .join(format!("{:08}.json", state.checkpoint_version)),
            &bytes,
        )?;
        atomic_write(&dir.join(STATE_FILE), &bytes)?;
        debug!(
            run_id = %state.run_id,
            version = state.checkpoint_version,
            status = %state.status,
            "Checkpoint written"
        );

        self.prune_checkpoints(&state.run_id)?;
        Ok(())
    }

    /// Reads the latest checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run has no state file.
    pub fn load_state(&self, run_id: &str) -> Result<RunState, InkflowError> {
        Self::check_id(run_id)?;
        read_json(&self.run_dir(run_id).join(STATE_FILE))?
            .ok_or_else(|| InkflowError::RunNotFound(run_id.to_string()))
    }

    /// Numbered checkpoint versions on disk, ascending.
    ///
    /// # Errors
    ///
    /// Returns `Io` errors other than a missing directory.
    pub fn checkpoint_versions(&self, run_id: &str) -> Result<Vec<u64>, InkflowError> {
        let dir = self.run_dir(run_id).join(CHECKPOINTS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions: Vec<u64> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse().ok())
            })
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Reads one numbered checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if that version is not on disk.
    pub fn load_checkpoint(&self, run_id: &str, version: u64) -> Result<RunState, InkflowError> {
        Self::check_id(run_id)?;
        let path = self
            .run_dir(run_id)
            .join(CHECKPOINTS_DIR)
            .join(format!("{version:08}.json"));
        read_json(&path)?.ok_or_else(|| InkflowError::RunNotFound(format!("{run_id}@{version}")))
    }

    fn prune_checkpoints(&self, run_id: &str) -> Result<(), InkflowError> {
        if self.retain == 0 {
            return Ok(());
        }
        let versions = self.checkpoint_versions(run_id)?;
        if versions.len() <= self.retain {
            return Ok(());
        }
        let dir = self.run_dir(run_id).join(CHECKPOINTS_DIR);
        for version in &versions[..versions.len() - self.retain] {
            let path = dir.join(format!("{version:08}.json"));
            if let Err(e) = fs::remove_file(&path) {
                warn!(run_id, version, error = %e, "Failed to prune checkpoint");
            }
        }
        Ok(())
    }

    /// Stores an artifact under its content hash. Existing files are kept.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` or `Io` errors.
    pub fn save_artifact(&self, run_id: &str, artifact: &Artifact) -> Result<PathBuf, InkflowError> {
        Self::check_id(run_id)?;
        let path = self.artifact_path(run_id, &artifact.content_hash);
        if !path.is_file() {
            write_json(&path, artifact)?;
        }
        Ok(path)
    }

    /// Loads an artifact by hash. Returns `None` if the file is missing or
    /// its payload no longer matches the hash.
    ///
    /// # Errors
    ///
    /// Returns `Io` errors other than a missing file.
    pub fn load_artifact(&self, run_id: &str, hash: &str) -> Result<Option<Artifact>, InkflowError> {
        Self::check_id(run_id)?;
        let artifact: Option<Artifact> = match read_json(&self.artifact_path(run_id, hash)) {
            Ok(artifact) => artifact,
            Err(InkflowError::Serialization(e)) => {
                warn!(run_id, hash, error = %e, "Unreadable artifact file");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(artifact.filter(|a| a.content_hash == hash && a.verify()))
    }

    fn artifact_path(&self, run_id: &str, hash: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(ARTIFACTS_DIR)
            .join(format!("{hash}.json"))
    }

    /// Run ids with a state file, sorted.
    ///
    /// # Errors
    ///
    /// Returns `Io` errors other than a missing root.
    pub fn list_runs(&self) -> Result<Vec<String>, InkflowError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut runs: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| ![CACHE_DIR, ARCHIVE_DIR].contains(&name.as_str()))
            .filter(|name| self.exists(name))
            .collect();
        runs.sort();
        Ok(runs)
    }

    /// Moves a run's directory into the archive.
    ///
    /// # Errors
    ///
    /// Returns `RunNotFound` if the run does not exist.
    pub fn archive_run(&self, run_id: &str) -> Result<PathBuf, InkflowError> {
        Self::check_id(run_id)?;
        if !self.exists(run_id) {
            return Err(InkflowError::RunNotFound(run_id.to_string()));
        }
        let archive = self.root.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive)?;
        let target = archive.join(run_id);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(self.run_dir(run_id), &target)?;
        debug!(run_id, "Run archived");
        Ok(target)
    }
}
