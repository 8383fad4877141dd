//! Scripted providers and stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{CompletionProvider, CompletionRequest, CompletionResponse, ProviderError};
use crate::errors::InkflowError;
use crate::stages::{Stage, StageContext, StageUnit};

type Responder = dyn Fn(&CompletionRequest, usize) -> Result<CompletionResponse, ProviderError> + Send + Sync;

/// A provider that plays back a script.
///
/// Call `n` (zero-based) gets entry `n`; once the script runs out the last
/// entry repeats. Latencies follow the same rule and are applied with
/// `tokio::time::sleep`, so paused-clock tests stay deterministic.
pub struct ScriptedProvider {
    script: Vec<Result<CompletionResponse, ProviderError>>,
    responder: Option<Arc<Responder>>,
    latency: Vec<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("script", &self.script.len())
            .field("responder", &self.responder.is_some())
            .field("calls", &self.calls())
            .finish()
    }
}

impl ScriptedProvider {
    /// Plays back `script`.
    #[must_use]
    pub fn new(script: Vec<Result<CompletionResponse, ProviderError>>) -> Self {
        Self {
            script,
            responder: None,
            latency: Vec::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always answers `content` with ten input and ten output tokens.
    #[must_use]
    pub fn always_ok(content: &str) -> Self {
        Self::new(vec![Ok(CompletionResponse::new(content, 10, 10))])
    }

    /// Answers by calling `responder` with the request and the call index.
    #[must_use]
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<CompletionResponse, ProviderError> + Send + Sync + 'static,
    {
        let mut provider = Self::new(Vec::new());
        provider.responder = Some(Arc::new(responder));
        provider
    }

    /// Delays each call before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Vec<Duration>) -> Self {
        self.latency = latency;
        self
    }

    /// Calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls ever in progress at the same time.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every prompt received, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn pick<T: Clone>(items: &[T], index: usize) -> Option<T> {
        items.get(index).or_else(|| items.last()).cloned()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = Self::pick(&self.latency, index) {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(responder) = &self.responder {
            return responder(request, index);
        }
        Self::pick(&self.script, index)
            .unwrap_or_else(|| Err(ProviderError::malformed("script is empty")))
    }
}

/// A single-unit stage that never finishes.
///
/// Used to hold a run mid-flight while a test aborts or cancels it.
#[derive(Debug)]
pub struct HangingStage {
    name: String,
    started: AtomicUsize,
    release: Option<(usize, String)>,
}

impl HangingStage {
    /// Creates a stage that hangs on every execution.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: AtomicUsize::new(0),
            release: None,
        }
    }

    /// Hangs only on the first `executions`; later ones answer `output`.
    #[must_use]
    pub fn hanging_first(mut self, executions: usize, output: impl Into<String>) -> Self {
        self.release = Some((executions, output.into()));
        self
    }

    /// Executions started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for HangingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_unit(&self, _ctx: &StageContext, _unit: &StageUnit) -> Result<String, InkflowError> {
        let started = self.started.fetch_add(1, Ordering::SeqCst);
        if let Some((hanging, output)) = &self.release {
            if started >= *hanging {
                return Ok(output.clone());
            }
        }
        std::future::pending::<()>().await;
        Ok(String::new())
    }
}
