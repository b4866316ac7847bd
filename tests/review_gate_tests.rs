use content_flow_engine::events::FlowEvent;
use content_flow_engine::review_gate::{ReviewDecision, ReviewGate, ReviewGateConfig};
use content_flow_engine::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Human-in-the-loop review gate tests: timeout defaults, decision routing
/// and the decision log.

fn engine_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        state_dir: dir.path().join("states"),
        metrics_storage_path: dir.path().join("metrics"),
        enable_review_gates: true,
        ..EngineConfig::default()
    }
}

fn success_handler(name: &'static str, data: serde_json::Value) -> Arc<dyn StageHandler> {
    Arc::new(FnHandler::new(name, move |_ctx, _input| {
        let data = data.clone();
        async move { Ok(StageOutput::new(name, data)) }
    }))
}

fn gated_builder(dir: &TempDir, gate: Arc<ReviewGate>) -> FlowEngineBuilder {
    FlowEngine::builder(engine_config(dir))
        .handler(
            FlowStage::Research,
            success_handler("researcher", serde_json::json!({"sources": [], "summary": "ok"})),
        )
        .handler(
            FlowStage::AudienceAlign,
            success_handler("audience_mapper", serde_json::json!({"insights": "ok"})),
        )
        .handler(
            FlowStage::DraftGeneration,
            success_handler(
                "draft_writer",
                serde_json::json!({"draft": "A reviewed draft body."}),
            ),
        )
        .handler(
            FlowStage::StyleValidation,
            success_handler("style_checker", serde_json::json!({"compliant": true, "score": 91.0})),
        )
        .handler(
            FlowStage::QualityCheck,
            success_handler("quality_assessor", serde_json::json!({"score": 87.0, "issues": []})),
        )
        .review_gate(gate)
}

fn inputs() -> WritingFlowInputs {
    WritingFlowInputs {
        topic_title: "Review gates in practice".to_string(),
        platform: "LinkedIn".to_string(),
        file_path: None,
        content_type: "STANDALONE".to_string(),
        content_ownership: "ORIGINAL".to_string(),
        viral_score: 6.5,
        editorial_recommendations: String::new(),
        skip_research: false,
    }
}

#[tokio::test]
async fn test_draft_review_timeout_applies_default_approve() -> Result<()> {
    let dir = TempDir::new().unwrap();

    let mut gate = ReviewGate::new(ReviewGateConfig::default());
    gate.set_point_timeout("draft_completion", 1)?;
    gate.set_point_timeout("quality_gate", 1)?;
    let gate = Arc::new(gate);

    // Any feedback immediately exceeds the cap, so timed-out gates resolve
    // to their canonical routes
    let mut config = engine_config(&dir);
    config.max_feedback_iterations = 0;
    let engine = gated_builder_with_config(&dir, gate.clone(), config).build()?;

    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    assert!(result.success);

    // The draft gate timed out and applied its default: approve
    let log = gate.decision_log();
    let draft_decision = log
        .iter()
        .find(|r| r.review_point == "draft_completion")
        .expect("draft gate must have been consulted");
    assert_eq!(draft_decision.decision, ReviewDecision::Approve);
    assert!(draft_decision.timed_out);
    assert!(draft_decision.elapsed_seconds >= 1.0);

    // Approve takes the canonical route to style validation
    let history = engine.state().transition_history();
    assert!(history.iter().any(|t| {
        t.from_stage == FlowStage::DraftGeneration
            && t.to_stage == FlowStage::StyleValidation
            && t.reason.contains("approve")
    }));

    let stats = gate.stats();
    assert!(stats["timeout_count"].as_u64().unwrap() >= 1);
    Ok(())
}

fn gated_builder_with_config(
    dir: &TempDir,
    gate: Arc<ReviewGate>,
    config: EngineConfig,
) -> FlowEngineBuilder {
    FlowEngine::builder(config)
        .handler(
            FlowStage::Research,
            success_handler("researcher", serde_json::json!({"sources": [], "summary": "ok"})),
        )
        .handler(
            FlowStage::AudienceAlign,
            success_handler("audience_mapper", serde_json::json!({"insights": "ok"})),
        )
        .handler(
            FlowStage::DraftGeneration,
            success_handler(
                "draft_writer",
                serde_json::json!({"draft": "A reviewed draft body."}),
            ),
        )
        .handler(
            FlowStage::StyleValidation,
            success_handler("style_checker", serde_json::json!({"compliant": true, "score": 91.0})),
        )
        .handler(
            FlowStage::QualityCheck,
            success_handler("quality_assessor", serde_json::json!({"score": 87.0, "issues": []})),
        )
        .review_gate(gate)
}

/// Answer pending reviews in the background with a per-point strategy
fn spawn_reviewer(
    gate: Arc<ReviewGate>,
    decide: impl Fn(&str, usize) -> ReviewDecision + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut answered = 0usize;
        for _ in 0..2000 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let pending = gate.pending_reviews();
            for review in pending {
                let decision = decide(&review.review_point, answered);
                if gate
                    .submit_decision(&review.request_id, decision, None)
                    .is_ok()
                {
                    answered += 1;
                }
            }
        }
    })
}

#[tokio::test]
async fn test_revise_feedback_routes_back_for_revision() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(ReviewGate::new(ReviewGateConfig::default()));

    let engine = gated_builder(&dir, gate.clone()).build()?;

    // First draft review asks for a revision, everything after approves
    let reviewer = spawn_reviewer(gate.clone(), |point, answered| {
        if point == "draft_completion" && answered == 0 {
            ReviewDecision::Revise
        } else {
            ReviewDecision::Approve
        }
    });

    let events: Arc<Mutex<Vec<FlowEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    engine.events().subscribe_fn(move |envelope| {
        events_clone.lock().push(envelope.event.clone());
    });

    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;
    reviewer.abort();

    assert!(result.success);

    // Major feedback sent the run back to audience alignment and through
    // drafting a second time
    let writing = engine.writing_state();
    assert_eq!(writing.revision_count, 1);
    assert_eq!(writing.human_feedback_type.as_deref(), Some("major"));
    assert_eq!(writing.draft_versions.len(), 2);

    let captured = events.lock();
    let draft_completions = captured
        .iter()
        .filter(|e| {
            matches!(e, FlowEvent::StageCompleted { stage, .. } if *stage == FlowStage::DraftGeneration)
        })
        .count();
    assert_eq!(draft_completions, 2);

    assert!(captured.iter().any(|e| matches!(
        e,
        FlowEvent::ReviewDecided { decision, .. } if decision == "revise"
    )));
    Ok(())
}

#[tokio::test]
async fn test_low_viability_topic_skip_aborts_run() -> Result<()> {
    let dir = TempDir::new().unwrap();

    // Nobody answers; the viability gate's default decision is skip
    let mut fast_gate = ReviewGate::new(ReviewGateConfig::default());
    fast_gate.set_point_timeout("topic_viability", 1)?;
    let fast_gate = Arc::new(fast_gate);
    let engine = gated_builder(&dir, fast_gate.clone()).build()?;

    let mut low_inputs = inputs();
    low_inputs.viral_score = 1.0;
    engine.initialize_flow(low_inputs)?;
    let result = engine.execute().await?;

    assert!(!result.success);
    assert_eq!(result.final_stage, FlowStage::Failed);
    assert!(result.error.unwrap().contains("viability"));

    let log = fast_gate.decision_log();
    assert_eq!(log[0].review_point, "topic_viability");
    assert_eq!(log[0].decision, ReviewDecision::Skip);
    Ok(())
}

#[tokio::test]
async fn test_auto_approve_runs_unattended() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(ReviewGate::new(ReviewGateConfig {
        auto_approve: true,
        ..ReviewGateConfig::default()
    }));

    let engine = gated_builder(&dir, gate.clone()).build()?;
    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    assert!(result.success);
    assert_eq!(result.final_stage, FlowStage::Finalized);

    // Both gates consulted, neither timed out
    let log = gate.decision_log();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|r| !r.timed_out));
    Ok(())
}
