//! End-to-end tests driving whole runs through the orchestrator.

#[cfg(test)]
mod tests {
    use crate::backend::{CompletionResponse, ProviderError, TierPricing};
    use crate::config::RunConfig;
    use crate::core::{RunStatus, StageStatus};
    use crate::errors::{FailureKind, InkflowError};
    use crate::events::names;
    use crate::pipeline::{CanarySettings, ResumeOptions, RunState, StageSpec};
    use crate::quality::{MetricSpec, RepairTable};
    use crate::stages::{FnStage, StageRegistry};
    use crate::testing::{
        chapters_config, flat_router, three_stage_config, HangingStage, ScriptedProvider, TestFixture,
        SCRIPTED,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn ok(content: &str) -> Result<CompletionResponse, ProviderError> {
        Ok(CompletionResponse::new(content, 10, 10))
    }

    fn status_of(state: &RunState, stage: &str) -> StageStatus {
        state.stage(stage).map(|s| s.status).unwrap_or_default()
    }

    async fn wait_until_started(stage: &HangingStage) {
        for _ in 0..10_000 {
            if stage.started() > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("stage never started");
    }

    #[tokio::test]
    async fn test_outline_draft_validate_with_two_repairs() {
        let fixture = TestFixture::new(ScriptedProvider::new(vec![
            ok("A keeper, a storm, a letter."),
            ok(""),
            ok("   "),
            ok("The lamp burned all night while the storm broke."),
            ok("Consistent."),
        ]));
        let orchestrator = fixture.orchestrator();
        let mut run = orchestrator.start(three_stage_config("novella-1")).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert!((state.ledger_total - 50.0).abs() < 1e-9);
        assert_eq!(fixture.provider.calls(), 5);
        let draft = state.stage("draft").unwrap();
        assert_eq!(draft.executions, 3);
        assert_eq!(draft.attempts_remaining, 1);
        assert_eq!(fixture.events.count(names::REPAIR_PLANNED), 2);
        assert_eq!(fixture.events.count(names::RUN_COMPLETED), 1);
        assert!(state.failure.is_none());

        // The persisted state matches what the handle reports.
        let persisted = orchestrator.status("novella-1").unwrap();
        assert_eq!(persisted.status, RunStatus::Completed);
        assert_eq!(persisted.artifact_hashes(), state.artifact_hashes());
    }

    #[tokio::test]
    async fn test_resume_of_completed_run_makes_no_calls() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let orchestrator = fixture.orchestrator();
        let first = {
            let mut run = orchestrator.start(three_stage_config("idem")).unwrap();
            run.run_to_completion().await.unwrap()
        };
        assert_eq!(fixture.provider.calls(), 3);

        let mut resumed = orchestrator.resume("idem").unwrap();
        let second = resumed.run_to_completion().await.unwrap();

        assert_eq!(fixture.provider.calls(), 3);
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.artifact_hashes(), first.artifact_hashes());
        assert!((second.ledger_total - first.ledger_total).abs() < 1e-9);
        assert!(resumed.artifact("validate").is_some());
    }

    #[tokio::test]
    async fn test_abort_mid_stage_then_resume_matches_uninterrupted_run() {
        let reference = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let expected = reference
            .orchestrator()
            .start(three_stage_config("crash"))
            .unwrap()
            .run_to_completion()
            .await
            .unwrap();

        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let hanging = Arc::new(HangingStage::new("draft"));
        let crashing = fixture.orchestrator_with(
            StageRegistry::with_builtins().with_stage("draft", hanging.clone()),
        );
        let mut run = crashing.start(three_stage_config("crash")).unwrap();
        let task = tokio::spawn(async move { run.run_to_completion().await });
        wait_until_started(&hanging).await;
        task.abort();
        assert_err!(task.await);
        assert!(crashing.active_runs().is_empty());

        let on_disk = crashing.status("crash").unwrap();
        assert_eq!(status_of(&on_disk, "outline"), StageStatus::Completed);
        assert_ne!(status_of(&on_disk, "draft"), StageStatus::Completed);

        let mut resumed = fixture.orchestrator().resume("crash").unwrap();
        let state = resumed.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.statuses(), expected.statuses());
        assert_eq!(state.artifact_hashes(), expected.artifact_hashes());
        assert!((state.ledger_total - expected.ledger_total).abs() < 1e-9);
        assert_eq!(state.stage("outline").unwrap().executions, 1);
        assert_eq!(fixture.provider.calls(), 3);
    }

    fn chapter_four_fails() -> ScriptedProvider {
        ScriptedProvider::from_fn(|request, _| {
            if request.prompt.contains("chapter 4") {
                ok("")
            } else {
                ok("The tide came in.")
            }
        })
    }

    #[tokio::test]
    async fn test_canary_below_threshold_pauses_before_full_run() {
        let fixture = TestFixture::new(chapter_four_fails());
        let orchestrator = fixture.orchestrator();
        let config = chapters_config("canary", 6).with_canary(CanarySettings::new(2, 0.9));
        let mut run = orchestrator.start(config).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(fixture.provider.calls(), 2);
        assert_eq!(state.status, RunStatus::Paused);
        assert_eq!(status_of(&state, "chapters"), StageStatus::Pending);
        let reason = state.pause_reason.clone().unwrap();
        assert!(reason.contains("1/2"), "{reason}");
        assert_eq!(fixture.events.count(names::CANARY_COMPLETED), 1);
        drop(run);

        // Skipping the canary runs every unit; the assembled chapters pass.
        let mut resumed = orchestrator
            .resume_with("canary", None, ResumeOptions::default().skip_canary())
            .unwrap();
        let state = resumed.run_to_completion().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(fixture.provider.calls(), 8);
        assert_eq!(resumed.artifact("chapters").unwrap().parts.len(), 6);
    }

    #[tokio::test]
    async fn test_passing_canary_reuses_sampled_units() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("The tide came in."));
        let config = chapters_config("canary-ok", 6).with_canary(CanarySettings::new(2, 0.9));
        let mut run = fixture.orchestrator().start(config).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(fixture.provider.calls(), 6);
        assert!((state.ledger_total - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_canary_ignores_artifact_scoped_count_metrics() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("The tide came in."));
        let mut config = chapters_config("canary-count", 6).with_canary(CanarySettings::new(2, 0.9));
        config.stages[0] = config.stages[0]
            .clone()
            .with_metric(MetricSpec::blocking("paragraph_count", 6.0));
        let mut run = fixture.orchestrator().start(config).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed, "{:?}", state.pause_reason);
        assert_eq!(fixture.provider.calls(), 6);
        let gate = state.stage("chapters").unwrap().last_gate.clone().unwrap();
        assert_eq!(gate.scores().get("paragraph_count"), Some(&6.0));
    }

    #[tokio::test]
    async fn test_repair_targets_category_owner() {
        let fixture = TestFixture::new(ScriptedProvider::new(vec![
            ok("Outline one."),
            ok(""),
            ok("Outline two."),
            ok("A draft."),
        ]));
        let config = RunConfig::new(
            "continuity",
            vec![
                StageSpec::new("outline").with_params(json!({"template": "Outline {{input.premise}}"})),
                StageSpec::new("draft")
                    .with_dependencies(["outline"])
                    .with_metric(MetricSpec::blocking("non_empty", 1.0).with_category("continuity"))
                    .with_params(json!({"template": "Draft {{artifact.outline}}"})),
            ],
        )
        .with_run_id("repair")
        .with_inputs(json!({"premise": "a storm"}))
        .with_router(flat_router(SCRIPTED, 1.0))
        .with_repair_table(RepairTable::new().with_owner("continuity", "outline"));

        let mut run = fixture.orchestrator().start(config).unwrap();
        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        let outline = state.stage("outline").unwrap();
        let draft = state.stage("draft").unwrap();
        assert_eq!((outline.executions, outline.attempts_remaining), (2, 1));
        assert_eq!((draft.executions, draft.attempts_remaining), (2, 2));

        let plans = fixture.events.events_of_type(names::REPAIR_PLANNED);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].data["target"], "outline");
        assert_eq!(plans[0].data["invalidated"], json!(["outline", "draft"]));
        assert!(fixture.provider.prompts()[2].contains("Revise to address"));
        assert_eq!(run.artifact("outline").unwrap().content, "Outline two.");
    }

    fn diamond_config(run_id: &str) -> RunConfig {
        RunConfig::new(
            "diamond",
            vec![
                StageSpec::new("outline").with_params(json!({"template": "Outline {{input.premise}}"})),
                StageSpec::new("left")
                    .with_dependencies(["outline"])
                    .with_metric(MetricSpec::blocking("non_empty", 1.0).with_category("continuity"))
                    .with_params(json!({"template": "Left from: {{artifact.outline}}"})),
                StageSpec::new("right").with_dependencies(["outline"]),
                StageSpec::new("join")
                    .with_dependencies(["left", "right"])
                    .with_params(json!({"template": "Join {{artifact.left}} {{artifact.right}}"})),
            ],
        )
        .with_run_id(run_id)
        .with_inputs(json!({"premise": "a storm"}))
        .with_router(flat_router(SCRIPTED, 1.0))
        .with_repair_table(RepairTable::new().with_owner("continuity", "outline"))
        .with_concurrency(4, 1)
    }

    #[tokio::test]
    async fn test_repair_aborts_running_sibling_in_diamond() {
        let provider = ScriptedProvider::from_fn(|request, index| {
            if request.prompt.contains("Left from: Outline one.") {
                ok("")
            } else if request.prompt.contains("Outline a storm") {
                ok(if index == 0 { "Outline one." } else { "Outline two." })
            } else {
                ok("Prose.")
            }
        })
        .with_latency(vec![Duration::ZERO, Duration::from_millis(20)]);
        let fixture = TestFixture::new(provider);
        let hanging = Arc::new(HangingStage::new("right").hanging_first(1, "Right side."));
        let orchestrator =
            fixture.orchestrator_with(StageRegistry::with_builtins().with_stage("right", hanging.clone()));
        let mut run = orchestrator.start(diamond_config("diamond")).unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), run.run_to_completion())
            .await
            .expect("invalidated sibling kept the run alive")
            .unwrap();

        assert_eq!(state.status, RunStatus::Completed, "{:?}", state.pause_reason);
        assert_eq!(hanging.started(), 2);
        assert_eq!(state.stage("right").unwrap().executions, 2);
        assert_eq!(state.stage("outline").unwrap().executions, 2);
        assert_eq!(state.stage("join").unwrap().executions, 1);
        assert_eq!(run.artifact("right").unwrap().content, "Right side.");

        let aborted = fixture.events.events_of_type(names::STAGE_ABORTED);
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].stage.as_deref(), Some("right"));
        assert_eq!(aborted[0].data["reason"], "invalidated");

        let right_done: Vec<_> = fixture
            .events
            .events_of_type(names::STAGE_COMPLETED)
            .into_iter()
            .filter(|e| e.stage.as_deref() == Some("right"))
            .collect();
        assert_eq!(right_done.len(), 1);
        assert!(right_done[0].data["duration_ms"].as_f64().unwrap() > 0.0);
    }

    fn independent_stages(run_id: &str, max_workers: usize) -> RunConfig {
        let stages = ["north", "south", "east", "west"]
            .into_iter()
            .map(|name| StageSpec::new(name).with_params(json!({"template": format!("Describe the {name}")})))
            .collect();
        RunConfig::new("compass", stages)
            .with_run_id(run_id)
            .with_router(flat_router(SCRIPTED, 1.0))
            .with_concurrency(max_workers, 1)
    }

    #[tokio::test]
    async fn test_max_workers_bounds_sibling_stages() {
        let fixture = TestFixture::new(
            ScriptedProvider::always_ok("Prose.").with_latency(vec![Duration::from_millis(20)]),
        );
        let mut run = fixture.orchestrator().start(independent_stages("bounded", 2)).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(fixture.provider.calls(), 4);
        assert_eq!(fixture.provider.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_independent_siblings_run_concurrently() {
        let fixture = TestFixture::new(
            ScriptedProvider::always_ok("Prose.").with_latency(vec![Duration::from_millis(20)]),
        );
        let mut run = fixture.orchestrator().start(independent_stages("wide", 4)).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(fixture.provider.peak_concurrency(), 4);
    }

    fn branching_registry() -> StageRegistry {
        StageRegistry::with_builtins()
            .with_stage("broken", Arc::new(FnStage::new("broken", |_, _| Ok(String::new()))))
            .with_stage("after", Arc::new(FnStage::new("after", |_, _| Ok("never".into()))))
            .with_stage("side", Arc::new(FnStage::new("side", |_, _| Ok("Side story.".into()))))
    }

    fn branching_config(run_id: &str) -> RunConfig {
        RunConfig::new(
            "branches",
            vec![
                StageSpec::new("broken")
                    .with_max_repairs(0)
                    .with_metric(MetricSpec::blocking("non_empty", 1.0)),
                StageSpec::new("after").with_dependencies(["broken"]),
                StageSpec::new("side"),
            ],
        )
        .with_run_id(run_id)
        .with_router(flat_router(SCRIPTED, 1.0))
    }

    #[tokio::test]
    async fn test_fatal_stage_blocks_dependents_and_fails_run() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("unused"));
        let orchestrator = fixture.orchestrator_with(branching_registry());
        let mut run = orchestrator.start(branching_config("fatal")).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(status_of(&state, "broken"), StageStatus::FatalFailed);
        assert_eq!(status_of(&state, "after"), StageStatus::Blocked);
        assert_eq!(status_of(&state, "side"), StageStatus::Completed);
        let failure = state.failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::FatalStage);
        assert_eq!(failure.stage.as_deref(), Some("broken"));
        assert_eq!(failure.metric.as_deref(), Some("non_empty"));
        assert_eq!(failure.attempts, Some(1));
        assert_eq!(fixture.events.count(names::STAGE_BLOCKED), 1);
        drop(run);

        // A failed run stays failed unless explicitly retried.
        let mut again = orchestrator.resume("fatal").unwrap();
        let state = again.run_to_completion().await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stage("broken").unwrap().executions, 1);
        drop(again);

        let mut retried = orchestrator
            .resume_with("fatal", None, ResumeOptions::default().retry_failed())
            .unwrap();
        let state = retried.run_to_completion().await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stage("broken").unwrap().executions, 2);
        assert_eq!(state.stage("side").unwrap().executions, 1);
    }

    #[tokio::test]
    async fn test_call_that_cannot_fit_is_refused_before_the_provider() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let config = three_stage_config("budget").with_budget(15.0);
        let mut run = fixture.orchestrator().start(config).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failure.as_ref().map(|f| f.kind), Some(FailureKind::BudgetExceeded));
        assert_eq!(fixture.provider.calls(), 1);
        assert_eq!(status_of(&state, "outline"), StageStatus::Completed);
        assert_eq!(status_of(&state, "draft"), StageStatus::Pending);
        assert!((state.ledger_total - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_token_priced_overrun_checkpoints_then_fails() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let mut router = flat_router(SCRIPTED, 0.0);
        for tier in router.tiers.values_mut() {
            tier.pricing = TierPricing {
                cost_per_output_token: 1.0,
                ..TierPricing::default()
            };
        }
        let config = three_stage_config("overrun").with_budget(15.0).with_router(router);
        let mut run = fixture.orchestrator().start(config).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failure.as_ref().map(|f| f.kind), Some(FailureKind::BudgetExceeded));
        assert_eq!(fixture.provider.calls(), 2);
        assert_eq!(status_of(&state, "draft"), StageStatus::Completed);
        assert_eq!(status_of(&state, "validate"), StageStatus::Pending);
        assert!((state.ledger_total - 20.0).abs() < 1e-9);
        assert_eq!(state.ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_units_stay_within_cap() {
        let fixture = TestFixture::new(
            ScriptedProvider::always_ok("A chapter.").with_latency(vec![Duration::from_millis(20)]),
        );
        let config = chapters_config("tight", 6).with_budget(3.0).with_concurrency(4, 4);
        let mut run = fixture.orchestrator().start(config).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failure.as_ref().map(|f| f.kind), Some(FailureKind::BudgetExceeded));
        assert_eq!(fixture.provider.calls(), 3);
        assert!(state.ledger_total <= state.budget_cap);
        assert_eq!(state.ledger.len(), 3);
        assert!(run.context().ledger().reserved().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_auth_error_halts_run() {
        let fixture = TestFixture::new(ScriptedProvider::new(vec![Err(ProviderError::auth("bad key"))]));
        let mut run = fixture.orchestrator().start(three_stage_config("auth")).unwrap();

        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failure.as_ref().map(|f| f.kind), Some(FailureKind::ProviderAuth));
        assert_eq!(fixture.provider.calls(), 1);
        assert_eq!(status_of(&state, "outline"), StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_pause_then_resume_finishes_remaining_stages() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let orchestrator = fixture.orchestrator();
        let mut run = orchestrator.start(three_stage_config("pause")).unwrap();

        let report = run.step().await.unwrap();
        assert_eq!(report.completed, vec!["outline".to_string()]);
        assert_eq!(report.status, RunStatus::Running);

        orchestrator.pause("pause", "operator").unwrap();
        let state = run.run_to_completion().await.unwrap();
        assert_eq!(state.status, RunStatus::Paused);
        assert_eq!(state.pause_reason.as_deref(), Some("operator"));
        assert_eq!(fixture.provider.calls(), 1);

        let busy = orchestrator.resume("pause").unwrap_err();
        assert!(matches!(busy, InkflowError::Config(_)));
        drop(run);

        let mut resumed = orchestrator.resume("pause").unwrap();
        let state = resumed.run_to_completion().await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(fixture.provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_stage() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let hanging = Arc::new(HangingStage::new("outline"));
        let orchestrator =
            fixture.orchestrator_with(StageRegistry::with_builtins().with_stage("outline", hanging.clone()));
        let mut run = orchestrator.start(three_stage_config("cancel")).unwrap();

        let control = run.control();
        let watched = hanging.clone();
        tokio::spawn(async move {
            wait_until_started(&watched).await;
            control.cancel("operator");
        });
        let state = run.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Paused);
        assert_eq!(state.pause_reason.as_deref(), Some("cancelled: operator"));
        assert_eq!(status_of(&state, "outline"), StageStatus::Pending);
        let aborted = fixture.events.events_of_type(names::STAGE_ABORTED);
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].data["reason"], "cancelled");
        assert_eq!(orchestrator.status("cancel").unwrap().status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn test_cacheable_stage_reused_across_runs() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let orchestrator = fixture.orchestrator();
        let cacheable = |run_id: &str| {
            let mut config = three_stage_config(run_id);
            config.stages[0] = config.stages[0].clone().cacheable();
            config
        };

        assert_ok!(orchestrator.start(cacheable("first")).unwrap().run_to_completion().await);
        assert_eq!(fixture.provider.calls(), 3);

        let mut second = orchestrator.start(cacheable("second")).unwrap();
        let report = second.step().await.unwrap();
        assert_eq!(report.reused, vec!["outline".to_string()]);
        let state = second.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(fixture.provider.calls(), 5);
        assert_eq!(fixture.events.count(names::STAGE_SKIPPED), 1);
        assert!((state.ledger_total - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_changed_stage_reruns_with_dependents_only() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("Prose."));
        let orchestrator = fixture.orchestrator();
        assert_ok!(orchestrator.start(three_stage_config("edit")).unwrap().run_to_completion().await);

        let mut edited = three_stage_config("edit");
        edited.stages[1].params = json!({"template": "Rewrite darker: {{artifact.outline}}"});
        let mut resumed = orchestrator
            .resume_with("edit", Some(edited), ResumeOptions::default())
            .unwrap();
        let state = resumed.run_to_completion().await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(fixture.provider.calls(), 5);
        assert_eq!(state.stage("outline").unwrap().executions, 1);
        assert_eq!(state.stage("draft").unwrap().executions, 2);
        assert_eq!(state.stage("validate").unwrap().executions, 2);
    }

    #[test]
    fn test_start_rejects_bad_configs() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("x"));
        let orchestrator = fixture.orchestrator();

        let unknown_kind = RunConfig::new("bad", vec![StageSpec::new("a").with_kind("poem")]);
        let err = orchestrator.start(unknown_kind).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Config);

        let unknown_metric = RunConfig::new(
            "bad",
            vec![StageSpec::new("a")
                .with_params(json!({"template": "x"}))
                .with_metric(MetricSpec::blocking("sparkle", 0.5))],
        );
        assert_eq!(orchestrator.start(unknown_metric).unwrap_err().kind(), FailureKind::Config);

        let cyclic = RunConfig::new(
            "bad",
            vec![
                StageSpec::new("a").with_dependencies(["b"]),
                StageSpec::new("b").with_dependencies(["a"]),
            ],
        );
        assert_eq!(orchestrator.start(cyclic).unwrap_err().kind(), FailureKind::Config);

        let _first = orchestrator.start(three_stage_config("dup")).unwrap();
        let duplicate = orchestrator.start(three_stage_config("dup")).unwrap_err();
        assert_eq!(duplicate.kind(), FailureKind::Config);
        assert!(orchestrator.list_runs().unwrap().contains(&"dup".to_string()));
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let fixture = TestFixture::new(ScriptedProvider::always_ok("x"));
        let orchestrator = fixture.orchestrator();
        assert!(matches!(orchestrator.resume("ghost"), Err(InkflowError::RunNotFound(_))));
        assert!(matches!(orchestrator.status("ghost"), Err(InkflowError::RunNotFound(_))));
        assert!(matches!(orchestrator.pause("ghost", "x"), Err(InkflowError::RunNotFound(_))));
    }
}
