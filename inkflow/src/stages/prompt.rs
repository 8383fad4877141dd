//! The built-in `prompt` stage kind.
//!
//! Renders a template per unit and asks the router for a completion.
//!
//! Recognised params: `template` (required), `system_prompt`, `max_tokens`,
//! `temperature`, `units` (a list of labels or a count) and
//! `memory_importance`.

use super::{Stage, StageContext, StageUnit};
use crate::backend::CompletionRequest;
use crate::errors::{codes, ConfigError, ContractErrorInfo, InkflowError};
use crate::memory::MemoryWrite;
use crate::pipeline::StageSpec;
use async_trait::async_trait;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([a-z_]+)(?:\.([A-Za-z0-9_\-]+))?\s*\}\}").expect("placeholder pattern is valid")
});

/// Substitutes `{{...}}` placeholders.
///
/// Supported: `{{input.KEY}}`, `{{artifact.STAGE}}`, `{{unit}}`,
/// `{{unit.index}}`, `{{memory}}` and `{{repair.feedback}}`. Unknown
/// placeholders are left untouched; known ones without a value render empty.
#[must_use]
pub fn render_template(template: &str, ctx: &StageContext, unit: &StageUnit) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = caps.get(2).map(|m| m.as_str());
            match (&caps[1], key) {
                ("input", Some(key)) => ctx.inputs().input_text(key).unwrap_or_default(),
                ("artifact", Some(stage)) => ctx.inputs().content(stage).unwrap_or_default().to_string(),
                ("unit", None) => unit.label.clone(),
                ("unit", Some("index")) => (unit.index + 1).to_string(),
                ("memory", None) => ctx.memory_text(),
                ("repair", Some("feedback")) => ctx.repair_feedback().unwrap_or_default().to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// A templated completion stage.
#[derive(Debug, Clone)]
pub struct PromptStage {
    name: String,
    template: String,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    units: Vec<String>,
    memory_importance: f64,
}

impl PromptStage {
    /// Builds a prompt stage from its spec params.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when `template` is missing or `units` is neither
    /// a list nor a count.
    pub fn from_spec(spec: &StageSpec) -> Result<Self, ConfigError> {
        let template = spec.param_str("template").ok_or_else(|| {
            ConfigError::new(format!("Prompt stage '{}' needs params.template", spec.name))
                .with_stages(vec![spec.name.clone()])
                .with_error_info(
                    ContractErrorInfo::new(codes::OUT_OF_RANGE, "Missing template")
                        .with_fix_hint("Set params.template, e.g. \"Outline: {{input.premise}}\"."),
                )
        })?;

        let units = match spec.params.get("units") {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(labels)) => labels
                .iter()
                .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                .collect(),
            Some(serde_json::Value::Number(n)) if n.as_u64().is_some_and(|n| n > 0) => {
                (1..=n.as_u64().unwrap_or(1)).map(|i| i.to_string()).collect()
            }
            Some(other) => {
                return Err(ConfigError::new(format!(
                    "Stage '{}' has invalid params.units: {other}",
                    spec.name
                ))
                .with_stages(vec![spec.name.clone()])
                .with_error_info(ContractErrorInfo::new(codes::OUT_OF_RANGE, "Invalid units")));
            }
        };

        Ok(Self {
            name: spec.name.clone(),
            template: template.to_string(),
            system_prompt: spec.param_str("system_prompt").map(str::to_string),
            max_tokens: spec
                .param_u64("max_tokens")
                .and_then(|v| u32::try_from(v).ok()),
            temperature: spec
                .params
                .get("temperature")
                .and_then(serde_json::Value::as_f64)
                .map(|t| t as f32),
            units,
            memory_importance: spec
                .params
                .get("memory_importance")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.5),
        })
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        let mut request = CompletionRequest::new(prompt);
        if let Some(system) = &self.system_prompt {
            request = request.with_system_prompt(system.clone());
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }
}

#[async_trait]
impl Stage for PromptStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn units(&self, _ctx: &StageContext) -> Vec<StageUnit> {
        if self.units.is_empty() {
            return vec![StageUnit::single()];
        }
        self.units
            .iter()
            .enumerate()
            .map(|(i, label)| StageUnit::new(i, label.clone()))
            .collect()
    }

    async fn execute_unit(&self, ctx: &StageContext, unit: &StageUnit) -> Result<String, InkflowError> {
        let mut prompt = render_template(&self.template, ctx, unit);
        if let Some(feedback) = ctx.repair_feedback() {
            if !self.template.contains("repair.feedback") {
                prompt.push_str("\n\nRevise to address: ");
                prompt.push_str(feedback);
            }
        }

        let response = ctx.complete(self.request(prompt)).await?;
        tracing::debug!(
            stage = %self.name,
            unit = unit.index,
            output_tokens = response.output_tokens,
            "Unit completed"
        );

        ctx.remember(
            MemoryWrite::new(response.content.clone(), self.memory_importance)
                .with_keywords(ctx.spec().keywords.iter().cloned()),
        );
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendRouter, EchoProvider, TierPricing};
    use crate::budget::BudgetLedger;
    use crate::core::{Artifact, BackendTier};
    use crate::stages::StageInputs;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn context(spec: StageSpec) -> (StageContext, Arc<BudgetLedger>) {
        let ledger = Arc::new(BudgetLedger::new(100.0));
        let router = Arc::new(BackendRouter::new(Arc::clone(&ledger)).with_tier(
            BackendTier::Standard,
            Arc::new(EchoProvider::new()),
            TierPricing::per_call(1.0),
        ));
        let mut artifacts = BTreeMap::new();
        artifacts.insert("outline".to_string(), Artifact::new("outline", "Act one. Act two.", vec![]));
        let inputs = StageInputs::new(json!({"premise": "a lighthouse keeper", "year": 1911}), artifacts);
        (StageContext::new("run-1", spec, inputs, router), ledger)
    }

    #[test]
    fn test_render_template_placeholders() {
        let (ctx, _) = context(StageSpec::new("draft"));
        let unit = StageUnit::new(1, "storm");
        let rendered = render_template(
            "{{input.premise}} in {{input.year}} | {{artifact.outline}} | {{unit}} #{{unit.index}} | {{other}}",
            &ctx,
            &unit,
        );
        assert_eq!(
            rendered,
            "a lighthouse keeper in 1911 | Act one. Act two. | storm #2 | {{other}}"
        );
    }

    #[test]
    fn test_from_spec_requires_template() {
        let err = PromptStage::from_spec(&StageSpec::new("draft")).unwrap_err();
        assert_eq!(err.code(), Some(codes::OUT_OF_RANGE));
    }

    #[test]
    fn test_units_from_count_and_list() {
        let spec = StageSpec::new("draft").with_params(json!({"template": "x", "units": 3}));
        let (ctx, _) = context(spec.clone());
        let stage = PromptStage::from_spec(&spec).unwrap();
        let labels: Vec<String> = stage.units(&ctx).into_iter().map(|u| u.label).collect();
        assert_eq!(labels, vec!["1", "2", "3"]);

        let spec = StageSpec::new("draft").with_params(json!({"template": "x", "units": ["a", "b"]}));
        let stage = PromptStage::from_spec(&spec).unwrap();
        assert_eq!(stage.units(&ctx).len(), 2);

        let bad = StageSpec::new("draft").with_params(json!({"template": "x", "units": "many"}));
        assert!(PromptStage::from_spec(&bad).is_err());
    }

    #[tokio::test]
    async fn test_execute_unit_charges_and_buffers_memory() {
        let spec = StageSpec::new("draft")
            .with_keywords(["keeper"])
            .with_params(json!({"template": "Write about {{input.premise}}."}));
        let (ctx, ledger) = context(spec.clone());
        let stage = PromptStage::from_spec(&spec).unwrap();

        let out = stage.execute_unit(&ctx, &StageUnit::single()).await.unwrap();
        assert_eq!(out, "Write about a lighthouse keeper.");
        assert_eq!(ctx.usage().calls, 1);
        assert!((ledger.total() - 1.0).abs() < 1e-9);

        let writes = ctx.take_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].keywords, vec!["keeper"]);
    }

    #[tokio::test]
    async fn test_repair_feedback_appended() {
        let spec = StageSpec::new("draft").with_params(json!({"template": "Write."}));
        let (ctx, _) = context(spec.clone());
        let ctx = ctx.with_repair_feedback("too short");
        let stage = PromptStage::from_spec(&spec).unwrap();

        let out = stage.execute_unit(&ctx, &StageUnit::single()).await.unwrap();
        assert_eq!(out, "Write.\n\nRevise to address: too short");
    }
}
