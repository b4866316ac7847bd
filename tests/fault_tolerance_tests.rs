use content_flow_engine::events::FlowEvent;
use content_flow_engine::flow_state::CircuitState;
use content_flow_engine::retry::RetryConfig;
use content_flow_engine::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fault tolerance tests: circuit breakers, fallbacks, timeouts and strict
/// mode behavior under persistent stage failures.

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

fn failing_handler(name: &'static str, kind: StageErrorKind, message: &'static str) -> Arc<dyn StageHandler> {
    Arc::new(FnHandler::new(name, move |_ctx, _input| async move {
        Err(StageError::new(kind, message))
    }))
}

fn builder_with_defaults(dir: &TempDir) -> FlowEngineBuilder {
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
            success_handler("draft_writer", serde_json::json!({"draft": "A solid draft."})),
        )
        .handler(
            FlowStage::StyleValidation,
            success_handler(
                "style_checker",
                serde_json::json!({"compliant": true, "violations": [], "score": 90.0}),
            ),
        )
        .handler(
            FlowStage::QualityCheck,
            success_handler("quality_assessor", serde_json::json!({"score": 85.0, "issues": []})),
        )
        // Keep retry backoff fast for tests
        .retry_config(RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        })
}

fn inputs() -> WritingFlowInputs {
    WritingFlowInputs {
        topic_title: "Breaker behavior under load".to_string(),
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
async fn test_style_breaker_opens_and_fallback_continues() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let engine = builder_with_defaults(&dir)
        .handler(
            FlowStage::StyleValidation,
            failing_handler(
                "style_checker",
                StageErrorKind::ValidationError,
                "style service degraded",
            ),
        )
        .build()?;

    let events: Arc<Mutex<Vec<FlowEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    engine.events().subscribe_fn(move |envelope| {
        events_clone.lock().push(envelope.event.clone());
    });

    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    // Three consecutive classified failures open the stage breaker; the
    // style fallback lets the run proceed
    assert!(result.success);
    assert_eq!(result.final_stage, FlowStage::Finalized);
    assert!(engine.breaker(FlowStage::StyleValidation).unwrap().is_open());
    assert_eq!(
        engine.state().circuit_breaker_state(FlowStage::StyleValidation),
        CircuitState::Open
    );

    let style_result = engine
        .state()
        .get_stage_result(FlowStage::StyleValidation)
        .unwrap();
    assert_eq!(style_result.status, StageStatus::Success);
    assert_eq!(
        style_result.agent_executed.as_deref(),
        Some("fallback:style_validation")
    );

    // Fallback output allows progression: compliant with zero violations
    let writing = engine.writing_state();
    assert!(writing.style_compliant);
    assert!(writing.style_violations.is_empty());

    let captured = events.lock();
    let opened = captured
        .iter()
        .filter(|e| {
            matches!(e, FlowEvent::CircuitOpened { stage, .. } if *stage == FlowStage::StyleValidation)
        })
        .count();
    assert_eq!(opened, 1, "CircuitOpened must be emitted exactly once");

    assert!(result.completed_stages.contains(&FlowStage::QualityCheck));
    assert_eq!(engine.guard_counters().fallback_used, 1);
    Ok(())
}

#[tokio::test]
async fn test_strict_mode_fails_instead_of_fallback() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = engine_config(&dir);
    config.strict_mode = true;

    let engine = FlowEngine::builder(config)
        .handler(
            FlowStage::AudienceAlign,
            success_handler("audience_mapper", serde_json::json!({"insights": "ok"})),
        )
        .handler(
            FlowStage::DraftGeneration,
            success_handler("draft_writer", serde_json::json!({"draft": "A solid draft."})),
        )
        .handler(
            FlowStage::StyleValidation,
            failing_handler(
                "style_checker",
                StageErrorKind::ValidationError,
                "style service degraded",
            ),
        )
        .handler(
            FlowStage::QualityCheck,
            success_handler("quality_assessor", serde_json::json!({"score": 85.0})),
        )
        .retry_config(RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        })
        .build()?;

    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    assert!(!result.success);
    assert_eq!(result.final_stage, FlowStage::Failed);
    assert!(engine.breaker(FlowStage::StyleValidation).unwrap().is_open());
    Ok(())
}

#[tokio::test]
async fn test_stage_timeout_counts_as_failure() -> Result<()> {
    let dir = TempDir::new().unwrap();

    let slow_audience: Arc<dyn StageHandler> =
        Arc::new(FnHandler::new("audience_mapper", |ctx, _input| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    Ok(StageOutput::new("audience_mapper", serde_json::json!({"insights": "late"})))
                }
                _ = ctx.cancelled() => {
                    Err(StageError::new(StageErrorKind::ConnectionError, "cancelled"))
                }
            }
        }));

    let engine = builder_with_defaults(&dir)
        .handler(FlowStage::AudienceAlign, slow_audience)
        .build()?;
    engine
        .state()
        .set_stage_timeout(FlowStage::AudienceAlign, 1);

    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    // Timeouts are failures; audience alignment has neither retry budget
    // nor a fallback, so the run fails
    assert!(!result.success);
    assert_eq!(result.final_stage, FlowStage::Failed);
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(engine.guard_counters().timeout, 1);
    assert_eq!(
        engine.breaker(FlowStage::AudienceAlign).unwrap().status().total_failures,
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_research_timeout_is_retryable() -> Result<()> {
    let dir = TempDir::new().unwrap();

    // First call hangs past the timeout, second answers promptly
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let calls_clone = calls.clone();
    let flaky_research: Arc<dyn StageHandler> =
        Arc::new(FnHandler::new("researcher", move |_ctx, _input| {
            let call = calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if call == 0 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(StageOutput::new(
                    "researcher",
                    serde_json::json!({"sources": [], "summary": "quick pass"}),
                ))
            }
        }));

    let engine = builder_with_defaults(&dir)
        .handler(FlowStage::Research, flaky_research)
        .build()?;
    engine.state().set_stage_timeout(FlowStage::Research, 1);

    let mut flow_inputs = inputs();
    flow_inputs.content_ownership = "EXTERNAL".to_string();
    engine.initialize_flow(flow_inputs)?;
    let result = engine.execute().await?;

    assert!(result.success);
    assert_eq!(engine.state().get_stage_retry_count(FlowStage::Research), 1);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_unclassified_error_is_not_retried() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let engine = builder_with_defaults(&dir)
        .handler(
            FlowStage::DraftGeneration,
            failing_handler("draft_writer", StageErrorKind::Other, "model crashed"),
        )
        .build()?;

    engine.initialize_flow(inputs())?;
    let result = engine.execute().await?;

    assert!(!result.success);
    assert_eq!(result.final_stage, FlowStage::Failed);
    assert_eq!(
        engine.state().get_stage_retry_count(FlowStage::DraftGeneration),
        0
    );
    Ok(())
}

#[tokio::test]
async fn test_emergency_stop_refuses_new_transitions() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let engine = builder_with_defaults(&dir).build()?;

    engine.initialize_flow(inputs())?;
    engine.emergency_stop("operator pulled the cord");
    let result = engine.execute().await?;

    assert!(!result.success);
    assert_eq!(result.final_stage, FlowStage::Failed);
    // The forced failure is the only recorded transition
    let history = engine.state().transition_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to_stage, FlowStage::Failed);
    Ok(())
}
