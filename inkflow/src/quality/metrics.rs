//! Scoring functions and their registry.
//!
//! A scoring function is a pure function of an artifact, the stage that
//! produced it and the artifacts of that stage's dependencies.

use crate::core::Artifact;
use crate::pipeline::StageSpec;
use crate::utils::text;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Everything a scoring function may look at.
#[derive(Debug, Clone, Copy)]
pub struct MetricInput<'a> {
    /// The artifact under evaluation.
    pub artifact: &'a Artifact,
    /// The producing stage.
    pub stage: &'a StageSpec,
    /// The metric's own params.
    pub params: &'a serde_json::Value,
    /// Artifacts of the stage's direct dependencies.
    pub priors: &'a BTreeMap<String, Artifact>,
}

impl MetricInput<'_> {
    /// Reads a numeric param from the metric, falling back to the stage.
    #[must_use]
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params
            .get(key)
            .and_then(serde_json::Value::as_f64)
            .or_else(|| self.stage.params.get(key).and_then(serde_json::Value::as_f64))
    }

    /// Keywords from the metric params, falling back to the stage's.
    #[must_use]
    pub fn keywords(&self) -> Vec<String> {
        match self.params.get("keywords").and_then(serde_json::Value::as_array) {
            Some(list) => list
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect(),
            None => self.stage.keywords.clone(),
        }
    }
}

/// A pure scoring function.
pub trait ScoringFunction: Send + Sync {
    /// Scores the artifact.
    fn score(&self, input: &MetricInput<'_>) -> f64;
}

impl<F> ScoringFunction for F
where
    F: Fn(&MetricInput<'_>) -> f64 + Send + Sync,
{
    fn score(&self, input: &MetricInput<'_>) -> f64 {
        self(input)
    }
}

/// 1.0 if the artifact has any non-whitespace content.
pub fn non_empty(input: &MetricInput<'_>) -> f64 {
    if input.artifact.content.trim().is_empty() {
        0.0
    } else {
        1.0
    }
}

/// Word count relative to `target_words`. Without a target, behaves like
/// `non_empty`.
pub fn length_ratio(input: &MetricInput<'_>) -> f64 {
    let words = text::word_count(&input.artifact.content) as f64;
    match input.param_f64("target_words") {
        Some(target) if target > 0.0 => words / target,
        _ => non_empty(input),
    }
}

/// Fraction of the keywords that appear in the artifact.
pub fn keyword_coverage(input: &MetricInput<'_>) -> f64 {
    let keywords = input.keywords();
    if keywords.is_empty() {
        return 1.0;
    }
    let vocab: BTreeSet<String> = text::words(&input.artifact.content).into_iter().collect();
    let hits = keywords
        .iter()
        .filter(|k| vocab.contains(&k.to_lowercase()))
        .count();
    hits as f64 / keywords.len() as f64
}

/// Vocabulary overlap with the dependency artifacts, relative to the
/// smaller vocabulary. 1.0 when there is nothing to be continuous with.
pub fn continuity_overlap(input: &MetricInput<'_>) -> f64 {
    let min_len = input
        .param_f64("min_word_len")
        .map_or(4, |v| v.max(1.0) as usize);
    let prior_vocab: BTreeSet<String> = input
        .priors
        .values()
        .flat_map(|a| text::vocabulary(&a.content, min_len))
        .collect();
    if prior_vocab.is_empty() {
        return 1.0;
    }
    let own = text::vocabulary(&input.artifact.content, min_len);
    if own.is_empty() {
        return 0.0;
    }
    let shared = own.intersection(&prior_vocab).count();
    shared as f64 / own.len().min(prior_vocab.len()) as f64
}

/// Ratio of distinct sentences to all sentences; 1.0 means no repeats.
pub fn repetition(input: &MetricInput<'_>) -> f64 {
    let sentences = text::sentences(&input.artifact.content);
    if sentences.is_empty() {
        return 1.0;
    }
    let distinct: BTreeSet<String> = sentences.iter().map(|s| s.to_lowercase()).collect();
    distinct.len() as f64 / sentences.len() as f64
}

/// Number of blank-line separated paragraphs.
pub fn paragraph_count(input: &MetricInput<'_>) -> f64 {
    text::paragraphs(&input.artifact.content).len() as f64
}

/// Named scoring functions.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    functions: HashMap<String, Arc<dyn ScoringFunction>>,
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl MetricRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in functions.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new()
            .with("non_empty", non_empty)
            .with("length_ratio", length_ratio)
            .with("keyword_coverage", keyword_coverage)
            .with("continuity_overlap", continuity_overlap)
            .with("repetition", repetition)
            .with("paragraph_count", paragraph_count)
    }

    /// Registers a function, replacing any previous one with that name.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, function: impl ScoringFunction + 'static) -> Self {
        self.register(name, function);
        self
    }

    /// Registers a function in place.
    pub fn register(&mut self, name: impl Into<String>, function: impl ScoringFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Looks up a function.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ScoringFunction>> {
        self.functions.get(name).cloned()
    }

    /// True if a function with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn score(
        function: impl ScoringFunction,
        content: &str,
        stage: &StageSpec,
        params: serde_json::Value,
        priors: &BTreeMap<String, Artifact>,
    ) -> f64 {
        let artifact = Artifact::new(&stage.name, content, vec![]);
        function.score(&MetricInput {
            artifact: &artifact,
            stage,
            params: &params,
            priors,
        })
    }

    #[test]
    fn test_non_empty() {
        let stage = StageSpec::new("s");
        let none = BTreeMap::new();
        assert_eq!(score(non_empty, "  \n", &stage, json!(null), &none), 0.0);
        assert_eq!(score(non_empty, "x", &stage, json!(null), &none), 1.0);
    }

    #[test]
    fn test_length_ratio_prefers_metric_params() {
        let stage = StageSpec::new("s").with_params(json!({"target_words": 10}));
        let none = BTreeMap::new();
        let text = "one two three four five";
        assert!((score(length_ratio, text, &stage, json!(null), &none) - 0.5).abs() < 1e-9);
        assert!((score(length_ratio, text, &stage, json!({"target_words": 5}), &none) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_coverage() {
        let stage = StageSpec::new("s").with_keywords(["Dragon", "castle"]);
        let none = BTreeMap::new();
        assert!((score(keyword_coverage, "The dragon slept.", &stage, json!(null), &none) - 0.5).abs() < 1e-9);
        assert!(
            (score(keyword_coverage, "nothing", &stage, json!({"keywords": []}), &none) - 1.0).abs() < 1e-9
        );
    }

    #[test]
    fn test_continuity_overlap() {
        let stage = StageSpec::new("draft").with_dependencies(["outline"]);
        let mut priors = BTreeMap::new();
        priors.insert(
            "outline".to_string(),
            Artifact::new("outline", "Mira travels north to find the lighthouse", vec![]),
        );

        let related = score(continuity_overlap, "Mira reaches the lighthouse at dusk", &stage, json!(null), &priors);
        let unrelated = score(continuity_overlap, "Quantum chromodynamics lectures", &stage, json!(null), &priors);
        assert!(related > unrelated);
        assert_eq!(unrelated, 0.0);
        assert_eq!(score(continuity_overlap, "anything", &stage, json!(null), &BTreeMap::new()), 1.0);
    }

    #[test]
    fn test_repetition_and_paragraphs() {
        let stage = StageSpec::new("s");
        let none = BTreeMap::new();
        let repeated = "It rained. It rained. The sun rose.\n\nEnd.";
        assert!((score(repetition, repeated, &stage, json!(null), &none) - 0.75).abs() < 1e-9);
        assert_eq!(score(paragraph_count, repeated, &stage, json!(null), &none), 2.0);
    }

    #[test]
    fn test_registry_builtins_and_custom() {
        let registry = MetricRegistry::with_builtins().with("always_half", |_: &MetricInput<'_>| 0.5);
        assert!(registry.contains("continuity_overlap"));
        assert!(registry.contains("always_half"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.names().len(), 7);
    }
}
