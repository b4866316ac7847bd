use content_flow_engine::loop_prevention::{
    LoopPatternKind, LoopPreventionConfig, LoopPreventionSystem, LoopRiskLevel,
};
use content_flow_engine::retry::RetryConfig;
use content_flow_engine::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Loop prevention tests: runaway stage re-execution is cut off by the
/// guards and force-fails the run.

fn engine_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        state_dir: dir.path().join("states"),
        metrics_storage_path: dir.path().join("metrics"),
        ..EngineConfig::default()
    }
}

fn success_handler(name: &'static str, data: serde_json::Value) -> Arc<dyn StageHandler> {
    Arc::new(FnHandler::new(name, move |_ctx, _input| {
        let data = data.clone();
        async move { Ok(StageOutput::new(name, data)) }
    }))
}

fn inputs() -> WritingFlowInputs {
    WritingFlowInputs {
        topic_title: "Draft generation oscillation".to_string(),
        platform: "LinkedIn".to_string(),
        file_path: None,
        content_type: "STANDALONE".to_string(),
        content_ownership: "ORIGINAL".to_string(),
        viral_score: 6.0,
        editorial_recommendations: String::new(),
        skip_research: false,
    }
}

#[tokio::test]
async fn test_runaway_draft_stage_is_cut_off() -> Result<()> {
    let dir = TempDir::new().unwrap();

    // Synthetic handler that never produces an acceptable draft; a padded
    // retry budget would grind through dozens of attempts without the guard
    let always_failing: Arc<dyn StageHandler> =
        Arc::new(FnHandler::new("draft_writer", |_ctx, _input| async move {
            Err(StageError::new(
                StageErrorKind::ContentQuality,
                "draft keeps failing the quality floor",
            ))
        }));

    let loop_guard = Arc::new(LoopPreventionSystem::with_config(LoopPreventionConfig {
        max_executions_per_stage: 11,
        ..LoopPreventionConfig::default()
    }));

    let engine = FlowEngine::builder(engine_config(&dir))
        .handler(
            FlowStage::AudienceAlign,
            success_handler("audience_mapper", serde_json::json!({"insights": "ok"})),
        )
        .handler(FlowStage::DraftGeneration, always_failing)
        .handler(
            FlowStage::StyleValidation,
            success_handler("style_checker", serde_json::json!({"compliant": true})),
        )
        .handler(
            FlowStage::QualityCheck,
            success_handler("quality_assessor", serde_json::json!({"score": 85.0})),
        )
        .retry_config(RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        })
        // Keep the breaker out of the way so the loop guard is what trips
        .breaker_threshold(100)
        .loop_prevention(loop_guard.clone())
        .build()?;
    engine
        .state()
        .set_max_retries(FlowStage::DraftGeneration, 30);

    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    assert!(!result.success);
    assert_eq!(result.final_stage, FlowStage::Failed);
    assert!(result.error.unwrap().contains("execution limit"));
    assert_eq!(engine.guard_counters().loop_violation, 1);

    // The window now holds 11 draft executions: oscillation at high risk
    let patterns = loop_guard.detect_patterns();
    let oscillation = patterns
        .iter()
        .find(|p| {
            p.kind == LoopPatternKind::StageOscillation
                && p.stage == Some(FlowStage::DraftGeneration)
        })
        .expect("stage oscillation pattern expected");
    assert!(oscillation.execution_count >= 11);
    assert!(oscillation.risk_level >= LoopRiskLevel::High);

    println!(
        "✅ Loop guard stopped the run after {} draft executions",
        oscillation.execution_count
    );
    Ok(())
}

#[tokio::test]
async fn test_emergency_stop_is_sticky_across_executions() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let loop_guard = Arc::new(LoopPreventionSystem::new());

    let engine = FlowEngine::builder(engine_config(&dir))
        .handler(
            FlowStage::AudienceAlign,
            success_handler("audience_mapper", serde_json::json!({"insights": "ok"})),
        )
        .handler(
            FlowStage::DraftGeneration,
            success_handler("draft_writer", serde_json::json!({"draft": "fine"})),
        )
        .handler(
            FlowStage::StyleValidation,
            success_handler("style_checker", serde_json::json!({"compliant": true})),
        )
        .handler(
            FlowStage::QualityCheck,
            success_handler("quality_assessor", serde_json::json!({"score": 85.0})),
        )
        .loop_prevention(loop_guard.clone())
        .build()?;

    loop_guard.force_stop();
    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    assert!(!result.success);
    assert_eq!(result.final_stage, FlowStage::Failed);
    assert_eq!(engine.guard_counters().loop_violation, 1);

    // Still stopped until an explicit reset
    assert!(loop_guard.emergency_stop_active());
    loop_guard.reset();
    assert!(!loop_guard.emergency_stop_active());
    Ok(())
}

#[tokio::test]
async fn test_guard_status_surfaces_counters() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let engine = FlowEngine::builder(engine_config(&dir))
        .handler(
            FlowStage::AudienceAlign,
            success_handler("audience_mapper", serde_json::json!({"insights": "ok"})),
        )
        .handler(
            FlowStage::DraftGeneration,
            success_handler("draft_writer", serde_json::json!({"draft": "fine"})),
        )
        .handler(
            FlowStage::StyleValidation,
            success_handler("style_checker", serde_json::json!({"compliant": true})),
        )
        .handler(
            FlowStage::QualityCheck,
            success_handler("quality_assessor", serde_json::json!({"score": 85.0})),
        )
        .build()?;

    engine.initialize_flow(inputs())?;
    engine.execute().await?;

    let status = engine.execution_guards_status();
    assert_eq!(status["loop_violation"], 0);
    assert_eq!(status["fallback_used"], 0);
    assert!(status["loop_prevention"]["total_executions"].as_u64().unwrap() > 0);
    Ok(())
}
