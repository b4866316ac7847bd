//! # Linear Execution Chain - The Flow Engine
//!
//! Drives a run through the fixed stage sequence. The chain is declarative:
//! an ordered table of stage handlers with pure routing predicates, no
//! dynamic dispatch graph. Every handler invocation goes through the
//! stage's circuit breaker under a timeout watcher; failures are classified
//! and either retried with backoff inside the same transition, resolved
//! with a per-stage fallback, or force-fail the run.
//!
//! Human review gates sit after draft generation and the quality check.
//! Their decisions map onto feedback routing: `edit` is minor feedback,
//! `revise` is major, `redirect` is a pivot.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::StageCircuitBreaker;
use crate::config::EngineConfig;
use crate::events::{EventBus, FlowEvent};
use crate::flow_stage::FlowStage;
use crate::flow_state::{CircuitState, FlowControlState, StageResult, StageStatus};
use crate::knowledge::{AdapterStats, KnowledgeAdapter, NullKnowledgeAdapter};
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::loop_prevention::LoopPreventionSystem;
use crate::metrics::FlowMetrics;
use crate::persistence::FlowStateManager;
use crate::retry::{RetryConfig, RetryManager, StageError};
use crate::review_gate::{ReviewDecision, ReviewGate, ReviewGateConfig};
use crate::stage_manager::StageManager;
use crate::{FlowError, Result};

/// Validated inputs for one flow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritingFlowInputs {
    pub topic_title: String,
    pub platform: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default = "default_ownership")]
    pub content_ownership: String,
    #[serde(default)]
    pub viral_score: f64,
    #[serde(default)]
    pub editorial_recommendations: String,
    #[serde(default)]
    pub skip_research: bool,
}

fn default_content_type() -> String {
    "STANDALONE".to_string()
}

fn default_ownership() -> String {
    "EXTERNAL".to_string()
}

impl WritingFlowInputs {
    pub fn validate(&self) -> Result<()> {
        if self.topic_title.trim().is_empty() {
            return Err(FlowError::Validation("topic_title must not be empty".to_string()));
        }
        if self.platform.trim().is_empty() {
            return Err(FlowError::Validation("platform must not be empty".to_string()));
        }
        if !(0.0..=10.0).contains(&self.viral_score) {
            return Err(FlowError::Validation(format!(
                "viral_score {} outside 0.0..=10.0",
                self.viral_score
            )));
        }
        Ok(())
    }
}

/// Mutable run context shared with stage handlers as a snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WritingState {
    pub topic_title: String,
    pub platform: String,
    pub content_type: String,
    pub content_ownership: String,
    pub viral_score: f64,
    pub editorial_recommendations: String,
    pub skip_research: bool,

    pub research_sources: Vec<serde_json::Value>,
    pub research_summary: String,
    pub audience_scores: HashMap<String, f64>,
    pub audience_insights: String,
    pub draft_versions: Vec<String>,
    pub current_draft: String,
    pub style_violations: Vec<serde_json::Value>,
    pub style_compliant: bool,
    pub style_score: f64,
    pub quality_score: f64,
    pub quality_issues: Vec<String>,
    pub human_feedback_type: Option<String>,
    pub revision_count: u32,
    pub final_draft: String,
    pub agents_executed: Vec<String>,
}

impl WritingState {
    fn from_inputs(inputs: &WritingFlowInputs) -> Self {
        Self {
            topic_title: inputs.topic_title.clone(),
            platform: inputs.platform.clone(),
            content_type: inputs.content_type.clone(),
            content_ownership: inputs.content_ownership.clone(),
            viral_score: inputs.viral_score,
            editorial_recommendations: inputs.editorial_recommendations.clone(),
            skip_research: inputs.skip_research,
            style_compliant: true,
            ..Default::default()
        }
    }
}

/// Input handed to a stage handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub writing_state: WritingState,
    pub config: serde_json::Value,
}

/// Output returned by a stage handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    pub data: serde_json::Value,
    pub agent: String,
}

impl StageOutput {
    pub fn new(agent: &str, data: serde_json::Value) -> Self {
        Self {
            data,
            agent: agent.to_string(),
        }
    }
}

/// Stage handler contract. Handlers must honor the cancellation token and
/// raise classified errors for retryable conditions.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: CancellationToken,
        input: StageInput,
    ) -> std::result::Result<StageOutput, StageError>;

    fn name(&self) -> &str {
        "handler"
    }
}

/// Adapter turning an async closure into a [`StageHandler`]
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(CancellationToken, StageInput) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<StageOutput, StageError>> + Send,
{
    pub fn new(name: &str, func: F) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> StageHandler for FnHandler<F>
where
    F: Fn(CancellationToken, StageInput) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<StageOutput, StageError>> + Send,
{
    async fn handle(
        &self,
        ctx: CancellationToken,
        input: StageInput,
    ) -> std::result::Result<StageOutput, StageError> {
        (self.func)(ctx, input).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Pure routing predicates extracted from the legacy router
pub struct FlowDecisions;

impl FlowDecisions {
    /// Research runs unless the content is original or explicitly skipped
    pub fn should_conduct_research(state: &WritingState) -> bool {
        !(state.content_ownership == "ORIGINAL" || state.skip_research)
    }

    /// Next stage after human feedback
    pub fn next_after_feedback(feedback_type: Option<&str>, ownership: &str) -> FlowStage {
        match feedback_type {
            Some("minor") => FlowStage::StyleValidation,
            Some("major") => FlowStage::AudienceAlign,
            Some("pivot") => {
                if ownership != "ORIGINAL" {
                    FlowStage::Research
                } else {
                    FlowStage::AudienceAlign
                }
            }
            _ => FlowStage::StyleValidation,
        }
    }

    /// Feedback class implied by a review decision
    pub fn feedback_for_decision(decision: ReviewDecision) -> Option<&'static str> {
        match decision {
            ReviewDecision::Approve | ReviewDecision::Skip => None,
            ReviewDecision::Edit => Some("minor"),
            ReviewDecision::Revise => Some("major"),
            ReviewDecision::Redirect => Some("pivot"),
        }
    }

    /// Canonical next stage in the linear chain
    pub fn canonical_next(stage: FlowStage) -> Option<FlowStage> {
        match stage {
            FlowStage::InputValidation => Some(FlowStage::AudienceAlign),
            FlowStage::Research => Some(FlowStage::AudienceAlign),
            FlowStage::AudienceAlign => Some(FlowStage::DraftGeneration),
            FlowStage::DraftGeneration => Some(FlowStage::StyleValidation),
            FlowStage::StyleValidation => Some(FlowStage::QualityCheck),
            FlowStage::QualityCheck => Some(FlowStage::Finalized),
            FlowStage::Finalized | FlowStage::Failed => None,
        }
    }
}

/// Execution guard counters kept alongside the loop prevention system
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GuardCounters {
    pub loop_violation: u32,
    pub timeout: u32,
    pub breaker_rejection: u32,
    pub fallback_used: u32,
}

pub struct FlowExecutionGuards {
    loop_prevention: Arc<LoopPreventionSystem>,
    counters: Mutex<GuardCounters>,
}

impl FlowExecutionGuards {
    pub fn new(loop_prevention: Arc<LoopPreventionSystem>) -> Self {
        Self {
            loop_prevention,
            counters: Mutex::new(GuardCounters::default()),
        }
    }

    pub fn loop_prevention(&self) -> &Arc<LoopPreventionSystem> {
        &self.loop_prevention
    }

    fn record_loop_violation(&self) {
        self.counters.lock().loop_violation += 1;
    }

    fn record_timeout(&self) {
        self.counters.lock().timeout += 1;
    }

    fn record_breaker_rejection(&self) {
        self.counters.lock().breaker_rejection += 1;
    }

    fn record_fallback(&self) {
        self.counters.lock().fallback_used += 1;
    }

    pub fn counters(&self) -> GuardCounters {
        *self.counters.lock()
    }

    pub fn status(&self) -> serde_json::Value {
        let counters = self.counters();
        serde_json::json!({
            "loop_violation": counters.loop_violation,
            "timeout": counters.timeout,
            "breaker_rejection": counters.breaker_rejection,
            "fallback_used": counters.fallback_used,
            "loop_prevention": self.loop_prevention.get_status(),
        })
    }
}

/// Final outcome of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExecutionResult {
    pub flow_id: String,
    pub success: bool,
    pub final_stage: FlowStage,
    pub completed_stages: Vec<FlowStage>,
    pub error: Option<String>,
    pub duration_seconds: f64,
    pub execution_summary: serde_json::Value,
    pub knowledge_stats: AdapterStats,
}

/// Builder wiring handlers and injected managers into a [`FlowEngine`]
pub struct FlowEngineBuilder {
    config: EngineConfig,
    handlers: HashMap<FlowStage, Arc<dyn StageHandler>>,
    knowledge: Option<Arc<dyn KnowledgeAdapter>>,
    review_gate: Option<Arc<ReviewGate>>,
    metrics: Option<Arc<FlowMetrics>>,
    events: Option<EventBus>,
    retry_config: Option<RetryConfig>,
    loop_prevention: Option<Arc<LoopPreventionSystem>>,
    breaker_threshold: Option<u32>,
}

impl FlowEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
            knowledge: None,
            review_gate: None,
            metrics: None,
            events: None,
            retry_config: None,
            loop_prevention: None,
            breaker_threshold: None,
        }
    }

    pub fn handler(mut self, stage: FlowStage, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    pub fn knowledge_adapter(mut self, adapter: Arc<dyn KnowledgeAdapter>) -> Self {
        self.knowledge = Some(adapter);
        self
    }

    pub fn review_gate(mut self, gate: Arc<ReviewGate>) -> Self {
        self.review_gate = Some(gate);
        self
    }

    pub fn metrics(mut self, metrics: Arc<FlowMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = Some(retry_config);
        self
    }

    pub fn loop_prevention(mut self, guard: Arc<LoopPreventionSystem>) -> Self {
        self.loop_prevention = Some(guard);
        self
    }

    /// Override the per-stage breaker failure threshold
    pub fn breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> Result<FlowEngine> {
        let state = Arc::new(FlowControlState::new());
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(FlowMetrics::new()));
        let events = self.events.unwrap_or_default();
        let persistence = Arc::new(FlowStateManager::new(&self.config.state_dir)?);

        let review_gate = self.review_gate.unwrap_or_else(|| {
            Arc::new(ReviewGate::new(ReviewGateConfig {
                auto_approve: self.config.auto_approve_reviews,
                enable_timeouts: true,
            }))
        });

        let knowledge = self
            .knowledge
            .unwrap_or_else(|| Arc::new(NullKnowledgeAdapter::new()));

        let retry_manager = match self.retry_config {
            Some(retry_config) => RetryManager::with_config(state.clone(), retry_config),
            None => RetryManager::new(state.clone()),
        };

        let loop_prevention = self
            .loop_prevention
            .unwrap_or_else(|| Arc::new(LoopPreventionSystem::new()));

        let breaker_threshold = self.breaker_threshold;
        let breakers = [
            FlowStage::InputValidation,
            FlowStage::Research,
            FlowStage::AudienceAlign,
            FlowStage::DraftGeneration,
            FlowStage::StyleValidation,
            FlowStage::QualityCheck,
        ]
        .into_iter()
        .map(|stage| {
            let breaker = match breaker_threshold {
                Some(threshold) => Arc::new(StageCircuitBreaker::with_settings(
                    stage,
                    state.clone(),
                    threshold,
                    crate::circuit_breaker::DEFAULT_RECOVERY_TIMEOUT,
                )),
                None => Arc::new(StageCircuitBreaker::new(stage, state.clone())),
            };
            (stage, breaker)
        })
        .collect();

        let stage_manager = StageManager::new(state.clone(), metrics.clone(), events.clone());

        Ok(FlowEngine {
            config: self.config,
            state,
            stage_manager,
            breakers,
            retry_manager,
            guards: FlowExecutionGuards::new(loop_prevention),
            handlers: self.handlers,
            events,
            metrics,
            persistence,
            review_gate,
            knowledge,
            writing_state: RwLock::new(WritingState::default()),
            initialized: AtomicBool::new(false),
            feedback_iterations: AtomicU32::new(0),
        })
    }
}

/// Linear flow engine.
///
/// One engine owns one run: its control state, breakers, retry budgets and
/// guards. Multiple runs in one process each get their own engine; shared
/// managers (metrics, persistence, review gate, knowledge adapter) are
/// injected through the builder.
pub struct FlowEngine {
    config: EngineConfig,
    state: Arc<FlowControlState>,
    stage_manager: StageManager,
    breakers: HashMap<FlowStage, Arc<StageCircuitBreaker>>,
    retry_manager: RetryManager,
    guards: FlowExecutionGuards,
    handlers: HashMap<FlowStage, Arc<dyn StageHandler>>,
    events: EventBus,
    metrics: Arc<FlowMetrics>,
    persistence: Arc<FlowStateManager>,
    review_gate: Arc<ReviewGate>,
    knowledge: Arc<dyn KnowledgeAdapter>,
    writing_state: RwLock<WritingState>,
    initialized: AtomicBool,
    feedback_iterations: AtomicU32,
}

impl FlowEngine {
    pub fn builder(config: EngineConfig) -> FlowEngineBuilder {
        FlowEngineBuilder::new(config)
    }

    pub fn state(&self) -> &Arc<FlowControlState> {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<FlowMetrics> {
        &self.metrics
    }

    pub fn review_gate(&self) -> &Arc<ReviewGate> {
        &self.review_gate
    }

    pub fn persistence(&self) -> &Arc<FlowStateManager> {
        &self.persistence
    }

    pub fn breaker(&self, stage: FlowStage) -> Option<&Arc<StageCircuitBreaker>> {
        self.breakers.get(&stage)
    }

    pub fn writing_state(&self) -> WritingState {
        self.writing_state.read().clone()
    }

    pub fn execution_guards_status(&self) -> serde_json::Value {
        self.guards.status()
    }

    pub fn guard_counters(&self) -> GuardCounters {
        self.guards.counters()
    }

    /// Validate inputs and arm the run. A validation failure here means the
    /// run never starts.
    pub fn initialize_flow(&self, inputs: WritingFlowInputs) -> Result<()> {
        inputs.validate()?;

        *self.writing_state.write() = WritingState::from_inputs(&inputs);
        self.initialized.store(true, Ordering::SeqCst);

        self.metrics
            .record_flow_start(self.state.execution_id(), FlowStage::InputValidation.key());
        self.events.emit(FlowEvent::FlowStarted {
            flow_id: self.state.execution_id().to_string(),
        });

        log_info(
            LogCategory::Flow,
            &format!(
                "Flow {} initialized: topic='{}' platform='{}' ownership='{}'",
                self.state.execution_id(),
                inputs.topic_title,
                inputs.platform,
                inputs.content_ownership
            ),
        );
        Ok(())
    }

    /// Trigger the sticky emergency stop: the kill-switch refuses new
    /// transitions and the run force-fails on its next step.
    pub fn emergency_stop(&self, reason: &str) {
        self.guards.loop_prevention().force_stop();
        self.state.activate_kill_switch(reason);
        log_error(
            LogCategory::Flow,
            &format!("Emergency stop requested: {reason}"),
        );
    }

    /// Drive the run to a terminal stage. Run-level failure is a normal
    /// outcome reported in the result; `Err` is reserved for calling the
    /// engine out of order.
    pub async fn execute(&self) -> Result<ChainExecutionResult> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(FlowError::Validation(
                "execute called before initialize_flow".to_string(),
            ));
        }

        let started = std::time::Instant::now();
        let mut run_error: Option<FlowError> = None;

        while !self.state.is_completed() {
            if self.state.kill_switch_active() {
                let error = FlowError::TransitionRejected("kill-switch active".to_string());
                self.fail_run(&error);
                run_error = Some(error);
                break;
            }

            let stage = self.state.current_stage();
            let step_result = match stage {
                FlowStage::InputValidation => self.run_input_validation().await,
                FlowStage::Finalized | FlowStage::Failed => break,
                stage => self.run_handler_stage(stage).await,
            };

            if let Err(error) = step_result {
                self.fail_run(&error);
                run_error = Some(error);
                break;
            }
        }

        let success = self.state.current_stage() == FlowStage::Finalized && run_error.is_none();
        if success {
            self.finalize_run();
        }

        Ok(ChainExecutionResult {
            flow_id: self.state.execution_id().to_string(),
            success,
            final_stage: self.state.current_stage(),
            completed_stages: self.state.completed_stages().into_iter().collect(),
            error: run_error.map(|e| e.to_string()),
            duration_seconds: started.elapsed().as_secs_f64(),
            execution_summary: self.state.execution_summary(),
            knowledge_stats: self.knowledge.stats(),
        })
    }

    async fn run_input_validation(&self) -> Result<()> {
        let stage = FlowStage::InputValidation;
        self.track_invocation("validate_inputs", stage)?;

        let execution = self.stage_manager.begin_stage(stage);
        let snapshot = self.writing_state();

        // Low-viability topics go through the viability gate before any
        // handler work is spent on them
        if self.config.enable_review_gates && snapshot.viral_score < self.config.viability_floor {
            let outcome = self
                .request_review(
                    "topic_viability",
                    serde_json::json!({
                        "topic_title": snapshot.topic_title,
                        "viral_score": snapshot.viral_score,
                        "platform": snapshot.platform,
                    }),
                )
                .await?;

            if outcome.decision == ReviewDecision::Skip {
                return Err(FlowError::Validation(format!(
                    "topic '{}' rejected by viability review",
                    snapshot.topic_title
                )));
            }
        }

        let result = execution.succeed(
            serde_json::json!({
                "topic_title": snapshot.topic_title,
                "platform": snapshot.platform,
                "content_ownership": snapshot.content_ownership,
            }),
            Some("input_validator".to_string()),
        );
        self.stage_manager.complete_stage(stage, result);
        self.checkpoint(stage);

        let next = if FlowDecisions::should_conduct_research(&snapshot) {
            FlowStage::Research
        } else {
            FlowStage::AudienceAlign
        };
        self.transition(next, "input validation complete")
    }

    async fn run_handler_stage(&self, stage: FlowStage) -> Result<()> {
        if self.state.is_stage_complete(stage) {
            let next = FlowDecisions::canonical_next(stage).ok_or_else(|| {
                FlowError::TransitionRejected(format!("no next stage after {stage}"))
            })?;
            return self.transition(next, "stage already completed");
        }

        let handler = self
            .handlers
            .get(&stage)
            .ok_or_else(|| {
                FlowError::Configuration(format!("no handler registered for stage {stage}"))
            })?
            .clone();
        let breaker = self
            .breakers
            .get(&stage)
            .ok_or_else(|| FlowError::Configuration(format!("no breaker for stage {stage}")))?
            .clone();

        loop {
            self.track_invocation(&format!("execute_stage::{}", stage.key()), stage)?;

            let execution = self.stage_manager.begin_stage(stage);
            let timeout_s = self.state.get_stage_timeout(stage);
            let token = CancellationToken::new();

            let input = StageInput {
                writing_state: self.writing_state(),
                config: serde_json::json!({ "stage": stage.key() }),
            };

            let breaker_state_before = breaker.state();
            let handler_clone = handler.clone();
            let child_token = token.child_token();
            let handler_future = async move { handler_clone.handle(child_token, input).await };

            let outcome: Result<StageOutput> = match tokio::time::timeout(
                Duration::from_secs(timeout_s),
                breaker.call_async(|| handler_future),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    // Set the cooperative cancellation signal and count the
                    // abandoned call as a breaker failure
                    token.cancel();
                    breaker.record_outcome(false);
                    Err(FlowError::Timeout { stage, timeout_s })
                }
            };

            match outcome {
                Ok(output) => {
                    self.apply_stage_output(stage, &output.data, &output.agent);
                    let result = execution.succeed(output.data, Some(output.agent));
                    self.stage_manager.complete_stage(stage, result);

                    if breaker_state_before != CircuitState::Closed && breaker.is_closed() {
                        self.events.emit(FlowEvent::CircuitClosed {
                            flow_id: self.state.execution_id().to_string(),
                            stage,
                        });
                    }

                    self.checkpoint(stage);
                    let (next, reason) = self.route_after(stage).await?;
                    return self.transition_with_reset(stage, next, &reason);
                }

                Err(error @ FlowError::CircuitOpen(_)) => {
                    self.guards.record_breaker_rejection();
                    return self.resolve_open_breaker(stage, error);
                }

                Err(error) => {
                    let result = match &error {
                        FlowError::Timeout { timeout_s, .. } => {
                            self.guards.record_timeout();
                            execution.timed_out(*timeout_s)
                        }
                        _ => execution.fail(&error.to_string()),
                    };
                    self.stage_manager.record_failed_attempt(stage, &result);

                    if breaker_state_before != CircuitState::Open && breaker.is_open() {
                        self.events.emit(FlowEvent::CircuitOpened {
                            flow_id: self.state.execution_id().to_string(),
                            stage,
                        });
                    }

                    if let Some(delay) = self.retry_manager.schedule_retry(stage, &error) {
                        let attempt = self.state.get_stage_retry_count(stage);
                        self.metrics
                            .record_retry(self.state.execution_id(), stage.key(), attempt);
                        self.events.emit(FlowEvent::RetryScheduled {
                            flow_id: self.state.execution_id().to_string(),
                            stage,
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });
                        tokio::time::sleep(delay).await;
                        // Retry re-invokes within the same transition
                        continue;
                    }

                    if breaker.is_open() {
                        return self.resolve_open_breaker(stage, error);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// A breaker refused (or kept refusing) a stage. Apply the stage
    /// fallback unless strict mode forbids it.
    fn resolve_open_breaker(&self, stage: FlowStage, error: FlowError) -> Result<()> {
        if self.config.strict_mode {
            log_error(
                LogCategory::Flow,
                &format!("Breaker open for {stage} in strict mode, failing run"),
            );
            return Err(error);
        }

        let Some(fallback) = Self::fallback_output(stage) else {
            return Err(error);
        };

        log_warn(
            LogCategory::Flow,
            &format!("Applying fallback for {stage}: breaker open"),
        );
        self.guards.record_fallback();

        let agent = format!("fallback:{}", stage.key());
        self.apply_stage_output(stage, &fallback, &agent);

        let result = StageResult {
            stage,
            status: StageStatus::Success,
            output: fallback,
            execution_time_seconds: 0.0,
            retry_count: self.state.get_stage_retry_count(stage),
            error_details: Some(error.to_string()),
            agent_executed: Some(agent),
            timestamp: chrono::Utc::now(),
        };
        self.stage_manager.complete_stage(stage, result);
        self.checkpoint(stage);

        let next = FlowDecisions::canonical_next(stage)
            .ok_or_else(|| FlowError::TransitionRejected(format!("no next stage after {stage}")))?;
        self.transition(next, "fallback applied, continuing")
    }

    /// Synthetic per-stage outputs used when a breaker is open
    fn fallback_output(stage: FlowStage) -> Option<serde_json::Value> {
        match stage {
            FlowStage::Research => Some(serde_json::json!({
                "sources": [],
                "summary": "research skipped",
                "fallback_used": true,
            })),
            FlowStage::DraftGeneration => Some(serde_json::json!({
                "draft": "[draft unavailable - generation service degraded]",
                "word_count": 0,
                "fallback_used": true,
            })),
            FlowStage::StyleValidation => Some(serde_json::json!({
                "compliant": true,
                "violations": [],
                "score": 50.0,
                "fallback_used": true,
            })),
            FlowStage::QualityCheck => Some(serde_json::json!({
                "score": 50.0,
                "issues": [],
                "recommend_manual_review": true,
                "fallback_used": true,
            })),
            _ => None,
        }
    }

    /// Fold a handler's output into the shared writing state
    fn apply_stage_output(&self, stage: FlowStage, data: &serde_json::Value, agent: &str) {
        let mut writing = self.writing_state.write();

        if !agent.is_empty() && !writing.agents_executed.iter().any(|a| a == agent) {
            writing.agents_executed.push(agent.to_string());
        }

        match stage {
            FlowStage::Research => {
                if let Some(sources) = data.get("sources").and_then(|v| v.as_array()) {
                    writing.research_sources = sources.clone();
                }
                if let Some(summary) = data.get("summary").and_then(|v| v.as_str()) {
                    writing.research_summary = summary.to_string();
                }
            }
            FlowStage::AudienceAlign => {
                if let Some(scores) = data.get("scores").and_then(|v| v.as_object()) {
                    writing.audience_scores = scores
                        .iter()
                        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                        .collect();
                }
                if let Some(insights) = data.get("insights").and_then(|v| v.as_str()) {
                    writing.audience_insights = insights.to_string();
                }
            }
            FlowStage::DraftGeneration => {
                if let Some(draft) = data.get("draft").and_then(|v| v.as_str()) {
                    writing.current_draft = draft.to_string();
                    writing.draft_versions.push(draft.to_string());
                }
            }
            FlowStage::StyleValidation => {
                writing.style_compliant =
                    data.get("compliant").and_then(|v| v.as_bool()).unwrap_or(true);
                if let Some(violations) = data.get("violations").and_then(|v| v.as_array()) {
                    writing.style_violations = violations.clone();
                }
                if let Some(score) = data.get("score").and_then(|v| v.as_f64()) {
                    writing.style_score = score;
                }
            }
            FlowStage::QualityCheck => {
                if let Some(score) = data.get("score").and_then(|v| v.as_f64()) {
                    writing.quality_score = score;
                }
                if let Some(issues) = data.get("issues").and_then(|v| v.as_array()) {
                    writing.quality_issues = issues
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
            }
            _ => {}
        }
    }

    /// Routing after a successful stage: canonical next unless a review
    /// gate redirects the run.
    async fn route_after(&self, stage: FlowStage) -> Result<(FlowStage, String)> {
        let canonical = FlowDecisions::canonical_next(stage)
            .ok_or_else(|| FlowError::TransitionRejected(format!("no next stage after {stage}")))?;

        if !self.config.enable_review_gates {
            return Ok((canonical, format!("{stage} complete")));
        }

        let gate_point = match stage {
            FlowStage::DraftGeneration => Some("draft_completion"),
            FlowStage::QualityCheck => Some("quality_gate"),
            _ => None,
        };
        let Some(point) = gate_point else {
            return Ok((canonical, format!("{stage} complete")));
        };

        let snapshot = self.writing_state();
        let content = match stage {
            FlowStage::DraftGeneration => serde_json::json!({
                "draft": snapshot.current_draft,
                "word_count": snapshot.current_draft.split_whitespace().count(),
                "platform": snapshot.platform,
                "content_type": snapshot.content_type,
            }),
            _ => serde_json::json!({
                "quality_score": snapshot.quality_score,
                "checklist_status": snapshot.quality_issues.is_empty(),
                "draft": snapshot.current_draft,
            }),
        };

        let outcome = self.request_review(point, content).await?;
        let feedback = FlowDecisions::feedback_for_decision(outcome.decision);

        let Some(feedback_type) = feedback else {
            return Ok((canonical, format!("review {point}: {}", outcome.decision)));
        };

        let iterations = self.feedback_iterations.fetch_add(1, Ordering::SeqCst) + 1;
        if iterations > self.config.max_feedback_iterations {
            log_warn(
                LogCategory::Flow,
                &format!(
                    "Feedback iteration cap ({}) reached, taking canonical route",
                    self.config.max_feedback_iterations
                ),
            );
            return Ok((canonical, "feedback iteration cap reached".to_string()));
        }

        {
            let mut writing = self.writing_state.write();
            writing.human_feedback_type = Some(feedback_type.to_string());
            writing.revision_count += 1;
        }

        let target =
            FlowDecisions::next_after_feedback(Some(feedback_type), &snapshot.content_ownership);
        Ok((target, format!("review {point}: {feedback_type} feedback")))
    }

    async fn request_review(
        &self,
        point: &str,
        content: serde_json::Value,
    ) -> Result<crate::review_gate::ReviewOutcome> {
        self.events.emit(FlowEvent::ReviewRequested {
            flow_id: self.state.execution_id().to_string(),
            review_point: point.to_string(),
        });

        // Review waits checkpoint first so a crashed process can resume at
        // the gate
        self.checkpoint(self.state.current_stage());

        let outcome = self.review_gate.request_review(point, content).await?;

        self.events.emit(FlowEvent::ReviewDecided {
            flow_id: self.state.execution_id().to_string(),
            review_point: point.to_string(),
            decision: outcome.decision.to_string(),
            timed_out: outcome.timed_out,
        });
        Ok(outcome)
    }

    fn transition(&self, to: FlowStage, reason: &str) -> Result<()> {
        let transition = self.state.add_transition(to, reason)?;
        self.events.emit(FlowEvent::TransitionRecorded {
            flow_id: self.state.execution_id().to_string(),
            from_stage: transition.from_stage,
            to_stage: transition.to_stage,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Transition that re-opens the target (and its canonical successors)
    /// when routing backwards for a revision pass.
    fn transition_with_reset(&self, from: FlowStage, to: FlowStage, reason: &str) -> Result<()> {
        let canonical = FlowDecisions::canonical_next(from);
        if canonical != Some(to) && to != FlowStage::Failed {
            self.reset_downstream(to);
        }
        self.transition(to, reason)
    }

    /// Re-open a stage and everything after it in the canonical order
    fn reset_downstream(&self, from: FlowStage) {
        const CANONICAL: [FlowStage; 5] = [
            FlowStage::Research,
            FlowStage::AudienceAlign,
            FlowStage::DraftGeneration,
            FlowStage::StyleValidation,
            FlowStage::QualityCheck,
        ];
        let Some(start) = CANONICAL.iter().position(|s| *s == from) else {
            return;
        };
        for stage in &CANONICAL[start..] {
            self.state.reset_stage(*stage);
        }
    }

    fn track_invocation(&self, method: &str, stage: FlowStage) -> Result<()> {
        match self.guards.loop_prevention().track_execution(method, Some(stage)) {
            Ok(_) => Ok(()),
            Err(error) => {
                self.guards.record_loop_violation();
                Err(error)
            }
        }
    }

    fn checkpoint(&self, stage: FlowStage) {
        if !self.config.checkpoint_every_stage {
            return;
        }
        // Checkpoint failures are logged, never fatal to the run
        if let Err(e) = self.persistence.save_checkpoint(
            self.state.execution_id(),
            &self.state,
            stage,
            HashMap::new(),
        ) {
            log_error(
                LogCategory::Persistence,
                &format!("Checkpoint failed at {stage}: {e}"),
            );
        }
    }

    fn finalize_run(&self) {
        {
            let mut writing = self.writing_state.write();
            writing.final_draft = writing.current_draft.clone();
        }
        let snapshot = self.writing_state();

        let results = serde_json::json!({
            "final_draft": snapshot.final_draft,
            "platform": snapshot.platform,
            "quality_score": snapshot.quality_score,
            "style_score": snapshot.style_score,
            "revision_count": snapshot.revision_count,
            "agents_executed": snapshot.agents_executed,
            "knowledge_stats": self.knowledge.stats(),
        });

        if let Err(e) =
            self.persistence
                .save_completed(self.state.execution_id(), &self.state, results)
        {
            log_error(
                LogCategory::Persistence,
                &format!("Completed-run archival failed: {e}"),
            );
        }

        self.metrics
            .record_flow_completion(self.state.execution_id(), true);
        self.events.emit(FlowEvent::FlowCompleted {
            flow_id: self.state.execution_id().to_string(),
            duration_s: self.state.execution_duration_seconds(),
        });

        log_info(
            LogCategory::Flow,
            &format!("Flow {} finalized", self.state.execution_id()),
        );
    }

    fn fail_run(&self, error: &FlowError) {
        let failing_stage = self.state.current_stage();
        if self.state.current_stage() != FlowStage::Failed {
            self.state.force_transition_to_failed(&error.to_string());
        }

        if let Err(e) =
            self.persistence
                .save_failed(self.state.execution_id(), &self.state, error, failing_stage)
        {
            log_error(
                LogCategory::Persistence,
                &format!("Failed-run archival failed: {e}"),
            );
        }

        self.metrics
            .record_flow_completion(self.state.execution_id(), false);
        self.events.emit(FlowEvent::FlowFailed {
            flow_id: self.state.execution_id().to_string(),
            reason: error.to_string(),
        });

        log_error(
            LogCategory::Flow,
            &format!("Flow {} failed: {error}", self.state.execution_id()),
        );
    }
}
