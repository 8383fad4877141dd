//! Resolves stage specs to stage implementations.

use super::{PromptStage, Stage};
use crate::errors::{codes, ConfigError, ContractErrorInfo};
use crate::pipeline::StageSpec;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a stage from its spec.
pub type StageFactory = Arc<dyn Fn(&StageSpec) -> Result<Arc<dyn Stage>, ConfigError> + Send + Sync>;

/// Stage kinds and named stage instances.
///
/// A registered instance overrides the kind factory for that stage name.
#[derive(Clone, Default)]
pub struct StageRegistry {
    kinds: HashMap<String, StageFactory>,
    instances: HashMap<String, Arc<dyn Stage>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("kinds", &self.kinds())
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `prompt` kind.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new().with_kind("prompt", |spec| {
            Ok(Arc::new(PromptStage::from_spec(spec)?) as Arc<dyn Stage>)
        })
    }

    /// Registers a kind factory.
    #[must_use]
    pub fn with_kind<F>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&StageSpec) -> Result<Arc<dyn Stage>, ConfigError> + Send + Sync + 'static,
    {
        self.kinds.insert(kind.into(), Arc::new(factory));
        self
    }

    /// Registers a concrete stage for one stage name.
    #[must_use]
    pub fn with_stage(mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        self.instances.insert(name.into(), stage);
        self
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Instantiates the stage for `spec`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the kind is unknown or its factory rejects
    /// the spec.
    pub fn resolve(&self, spec: &StageSpec) -> Result<Arc<dyn Stage>, ConfigError> {
        if let Some(stage) = self.instances.get(&spec.name) {
            return Ok(Arc::clone(stage));
        }
        let factory = self.kinds.get(&spec.kind).ok_or_else(|| {
            ConfigError::new(format!(
                "Stage '{}' has unknown kind '{}'",
                spec.name, spec.kind
            ))
            .with_stages(vec![spec.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(codes::UNKNOWN_KIND, "Unknown stage kind")
                    .with_fix_hint(format!("Known kinds: {}", self.kinds().join(", "))),
            )
        })?;
        factory(spec)
    }
}
