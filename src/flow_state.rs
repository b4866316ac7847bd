//! # Flow Control State - Authoritative Per-Run State
//!
//! Central state management for one flow run. Tracks the current stage,
//! transition history, retry counters, per-stage circuit breaker mirrors and
//! the global kill-switch so execution stays predictable and loop-free.
//!
//! All mutation goes through the methods on [`FlowControlState`]; external
//! observers read through copy-returning getters or take a serializable
//! [`FlowStateSnapshot`] for checkpointing. Internally a single
//! `parking_lot::RwLock` guards the whole aggregate and no lock is held
//! across an await point.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::flow_stage::{is_terminal_stage, validate_transition, FlowStage};
use crate::logging::{log_debug, log_info, log_warn, LogCategory};
use crate::{FlowError, Result};

/// History cap; trimmed to half when exceeded
pub const MAX_HISTORY_SIZE: usize = 1000;
/// Per-stage execution cap (total and consecutive)
pub const MAX_STAGE_EXECUTIONS: usize = 1000;
/// Failures before the per-stage breaker mirror opens
pub const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// Seconds before an open breaker mirror may attempt recovery
pub const CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECONDS: i64 = 300;

/// Status of a finished stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

/// Circuit breaker states, mirrored per stage into the flow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Result of a single stage execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: FlowStage,
    pub status: StageStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    pub execution_time_seconds: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_details: Option<String>,
    /// Handler that produced the result
    #[serde(default)]
    pub agent_executed: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StageResult {
    pub fn success(stage: FlowStage, output: serde_json::Value, duration_s: f64) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            output,
            execution_time_seconds: duration_s,
            retry_count: 0,
            error_details: None,
            agent_executed: None,
            timestamp: Utc::now(),
        }
    }

}

/// Immutable record of an accepted stage transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from_stage: FlowStage,
    pub to_stage: FlowStage,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub transition_id: String,
}

impl StageTransition {
    fn new(from_stage: FlowStage, to_stage: FlowStage, reason: &str) -> Self {
        Self {
            from_stage,
            to_stage,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            transition_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Short-lived wrapper around one handler invocation. Completes into a
/// [`StageResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageExecution {
    pub stage: FlowStage,
    pub execution_id: String,
    pub retry_attempt: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
}

impl StageExecution {
    pub fn new(stage: FlowStage, execution_id: String, retry_attempt: u32) -> Self {
        Self {
            stage,
            execution_id,
            retry_attempt,
            start_time: Utc::now(),
            end_time: None,
            success: false,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Complete successfully with the handler's output
    pub fn succeed(mut self, output: serde_json::Value, agent: Option<String>) -> StageResult {
        self.end_time = Some(Utc::now());
        self.success = true;
        StageResult {
            stage: self.stage,
            status: StageStatus::Success,
            output,
            execution_time_seconds: self.elapsed_seconds(),
            retry_count: self.retry_attempt,
            error_details: None,
            agent_executed: agent,
            timestamp: Utc::now(),
        }
    }

    /// Complete with a failure
    pub fn fail(mut self, error: &str) -> StageResult {
        self.end_time = Some(Utc::now());
        self.success = false;
        StageResult {
            stage: self.stage,
            status: StageStatus::Failed,
            output: serde_json::Value::Null,
            execution_time_seconds: self.elapsed_seconds(),
            retry_count: self.retry_attempt,
            error_details: Some(error.to_string()),
            agent_executed: None,
            timestamp: Utc::now(),
        }
    }

    /// Complete as a timeout; treated as failure by breakers and retry policy
    pub fn timed_out(mut self, timeout_s: u64) -> StageResult {
        self.end_time = Some(Utc::now());
        self.success = false;
        StageResult {
            stage: self.stage,
            status: StageStatus::Timeout,
            output: serde_json::Value::Null,
            execution_time_seconds: self.elapsed_seconds(),
            retry_count: self.retry_attempt,
            error_details: Some(format!("stage exceeded {timeout_s}s budget")),
            agent_executed: None,
            timestamp: Utc::now(),
        }
    }
}

fn default_max_retries() -> HashMap<FlowStage, u32> {
    HashMap::from([
        (FlowStage::DraftGeneration, 3),
        (FlowStage::StyleValidation, 2),
        (FlowStage::QualityCheck, 2),
        (FlowStage::Research, 1),
    ])
}

fn default_stage_timeouts() -> HashMap<FlowStage, u64> {
    HashMap::from([
        (FlowStage::InputValidation, 30),
        (FlowStage::Research, 120),
        (FlowStage::AudienceAlign, 60),
        (FlowStage::DraftGeneration, 180),
        (FlowStage::StyleValidation, 90),
        (FlowStage::QualityCheck, 60),
        (FlowStage::Finalized, 30),
        (FlowStage::Failed, 30),
    ])
}

/// Serializable view of the full flow state, including the
/// `transition_history` list expected by checkpoint consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStateSnapshot {
    pub execution_id: String,
    pub current_stage: FlowStage,
    pub completed_stages: BTreeSet<FlowStage>,
    pub start_time: DateTime<Utc>,
    pub retry_count: HashMap<FlowStage, u32>,
    pub max_retries: HashMap<FlowStage, u32>,
    pub transition_history: Vec<StageTransition>,
    pub stage_results: HashMap<FlowStage, StageResult>,
    pub circuit_breaker_state: HashMap<FlowStage, CircuitState>,
    pub circuit_breaker_failures: HashMap<FlowStage, u32>,
    pub circuit_breaker_last_failure: HashMap<FlowStage, DateTime<Utc>>,
    pub stage_timeouts: HashMap<FlowStage, u64>,
    pub total_execution_time: f64,
    pub total_retry_count: u32,
    pub circuit_breaker_active: bool,
    pub circuit_breaker_reason: Option<String>,
    pub circuit_breaker_activated_at: Option<DateTime<Utc>>,
}

struct StateInner {
    current_stage: FlowStage,
    completed_stages: BTreeSet<FlowStage>,
    start_time: DateTime<Utc>,
    retry_count: HashMap<FlowStage, u32>,
    max_retries: HashMap<FlowStage, u32>,
    execution_history: Vec<StageTransition>,
    stage_results: HashMap<FlowStage, StageResult>,
    circuit_breaker_state: HashMap<FlowStage, CircuitState>,
    circuit_breaker_failures: HashMap<FlowStage, u32>,
    circuit_breaker_last_failure: HashMap<FlowStage, DateTime<Utc>>,
    stage_timeouts: HashMap<FlowStage, u64>,
    total_execution_time: f64,
    total_retry_count: u32,
    // Global kill-switch, separate from the per-stage breakers
    circuit_breaker_active: bool,
    circuit_breaker_reason: Option<String>,
    circuit_breaker_activated_at: Option<DateTime<Utc>>,
}

/// Central state management for flow execution.
///
/// Thread-safe: every mutation happens under the internal lock, and getters
/// return copies so callers never observe a partially updated aggregate.
pub struct FlowControlState {
    execution_id: String,
    inner: RwLock<StateInner>,
}

impl FlowControlState {
    pub fn new() -> Self {
        Self::with_execution_id(Uuid::new_v4().to_string())
    }

    pub fn with_execution_id(execution_id: String) -> Self {
        let breaker_states = FlowStage::ALL
            .iter()
            .map(|s| (*s, CircuitState::Closed))
            .collect();

        Self {
            execution_id,
            inner: RwLock::new(StateInner {
                current_stage: FlowStage::InputValidation,
                completed_stages: BTreeSet::new(),
                start_time: Utc::now(),
                retry_count: HashMap::new(),
                max_retries: default_max_retries(),
                execution_history: Vec::new(),
                stage_results: HashMap::new(),
                circuit_breaker_state: breaker_states,
                circuit_breaker_failures: HashMap::new(),
                circuit_breaker_last_failure: HashMap::new(),
                stage_timeouts: default_stage_timeouts(),
                total_execution_time: 0.0,
                total_retry_count: 0,
                circuit_breaker_active: false,
                circuit_breaker_reason: None,
                circuit_breaker_activated_at: None,
            }),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn current_stage(&self) -> FlowStage {
        self.inner.read().current_stage
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.read().start_time
    }

    /// Record a stage transition with validation and loop protection.
    ///
    /// Rejects when the global kill-switch is active, when the transition is
    /// not in the table (except `→ Failed` and self-transitions), when the
    /// current stage is terminal (except `→ Failed`), or when the target
    /// stage exceeded its execution cap.
    pub fn add_transition(&self, to_stage: FlowStage, reason: &str) -> Result<StageTransition> {
        let mut inner = self.inner.write();

        if inner.circuit_breaker_active {
            return Err(FlowError::TransitionRejected(format!(
                "kill-switch active: {}",
                inner
                    .circuit_breaker_reason
                    .as_deref()
                    .unwrap_or("no reason provided")
            )));
        }

        let from_stage = inner.current_stage;
        if !validate_transition(from_stage, to_stage) {
            let allowed = crate::flow_stage::allowed_next(from_stage)
                .iter()
                .map(|s| s.key())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(FlowError::TransitionRejected(format!(
                "invalid transition: {from_stage} -> {to_stage} (allowed: [{allowed}])"
            )));
        }

        if is_terminal_stage(from_stage) && to_stage != FlowStage::Failed {
            return Err(FlowError::TransitionRejected(format!(
                "cannot transition from terminal stage {from_stage}"
            )));
        }

        if Self::exceeded_execution_limit(&inner.execution_history, to_stage) {
            return Err(FlowError::TransitionRejected(format!(
                "stage {to_stage} exceeded execution limit of {MAX_STAGE_EXECUTIONS}"
            )));
        }

        let elapsed = (Utc::now() - inner.start_time).num_milliseconds() as f64 / 1000.0;
        log_info(
            LogCategory::Transition,
            &format!(
                "Flow {}: {from_stage} -> {to_stage} (elapsed: {elapsed:.2}s, reason: {reason})",
                self.execution_id
            ),
        );

        let transition = StageTransition::new(from_stage, to_stage, reason);
        inner.execution_history.push(transition.clone());

        if inner.execution_history.len() > MAX_HISTORY_SIZE {
            let keep_from = inner.execution_history.len() - MAX_HISTORY_SIZE / 2;
            inner.execution_history.drain(0..keep_from);
            log_debug(
                LogCategory::Transition,
                &format!(
                    "Trimmed execution history to {} entries",
                    inner.execution_history.len()
                ),
            );
        }

        inner.current_stage = to_stage;
        Ok(transition)
    }

    /// Always allowed; used for emergency stops and unrecoverable errors.
    pub fn force_transition_to_failed(&self, reason: &str) -> StageTransition {
        log_warn(
            LogCategory::Transition,
            &format!("Forcing transition to failed state: {reason}"),
        );

        let mut inner = self.inner.write();
        let transition = StageTransition::new(
            inner.current_stage,
            FlowStage::Failed,
            &format!("FORCED FAILURE: {reason}"),
        );
        inner.execution_history.push(transition.clone());
        inner.current_stage = FlowStage::Failed;
        transition
    }

    fn exceeded_execution_limit(history: &[StageTransition], stage: FlowStage) -> bool {
        if history.is_empty() {
            return false;
        }

        let total = history.iter().filter(|t| t.to_stage == stage).count();
        if total >= MAX_STAGE_EXECUTIONS {
            return true;
        }

        let consecutive = history
            .iter()
            .rev()
            .take_while(|t| t.to_stage == stage)
            .count();
        consecutive >= MAX_STAGE_EXECUTIONS
    }

    pub fn mark_stage_complete(&self, stage: FlowStage, result: StageResult) {
        let mut inner = self.inner.write();
        inner.completed_stages.insert(stage);
        inner.total_execution_time += result.execution_time_seconds;
        inner.total_retry_count += result.retry_count;
        inner.stage_results.insert(stage, result);
    }

    pub fn is_stage_complete(&self, stage: FlowStage) -> bool {
        self.inner.read().completed_stages.contains(&stage)
    }

    pub fn get_stage_result(&self, stage: FlowStage) -> Option<StageResult> {
        self.inner.read().stage_results.get(&stage).cloned()
    }

    pub fn get_stage_retry_count(&self, stage: FlowStage) -> u32 {
        self.inner.read().retry_count.get(&stage).copied().unwrap_or(0)
    }

    /// Thread-safe increment; returns the new value
    pub fn increment_retry(&self, stage: FlowStage) -> u32 {
        let mut inner = self.inner.write();
        let count = inner.retry_count.entry(stage).or_insert(0);
        *count += 1;
        let new_count = *count;
        inner.total_retry_count += 1;
        new_count
    }

    pub fn can_retry(&self, stage: FlowStage) -> bool {
        let inner = self.inner.read();
        let current = inner.retry_count.get(&stage).copied().unwrap_or(0);
        let max = inner.max_retries.get(&stage).copied().unwrap_or(0);
        current < max
    }

    pub fn max_retries_for(&self, stage: FlowStage) -> u32 {
        self.inner.read().max_retries.get(&stage).copied().unwrap_or(0)
    }

    pub fn set_max_retries(&self, stage: FlowStage, max: u32) {
        self.inner.write().max_retries.insert(stage, max);
    }

    /// Timeout budget in seconds; 60 when unconfigured
    pub fn get_stage_timeout(&self, stage: FlowStage) -> u64 {
        self.inner.read().stage_timeouts.get(&stage).copied().unwrap_or(60)
    }

    pub fn set_stage_timeout(&self, stage: FlowStage, timeout_s: u64) {
        self.inner.write().stage_timeouts.insert(stage, timeout_s);
    }

    /// Update the per-stage breaker mirror from an execution outcome.
    /// Success resets failures and closes; failures accumulate and open the
    /// breaker at the threshold.
    pub fn update_circuit_breaker(&self, stage: FlowStage, success: bool) {
        let mut inner = self.inner.write();
        if success {
            inner.circuit_breaker_failures.insert(stage, 0);
            if inner.circuit_breaker_state.get(&stage) != Some(&CircuitState::Closed) {
                inner.circuit_breaker_state.insert(stage, CircuitState::Closed);
            }
        } else {
            let failures = inner.circuit_breaker_failures.get(&stage).copied().unwrap_or(0) + 1;
            inner.circuit_breaker_failures.insert(stage, failures);
            inner.circuit_breaker_last_failure.insert(stage, Utc::now());

            if failures >= CIRCUIT_BREAKER_FAILURE_THRESHOLD {
                inner.circuit_breaker_state.insert(stage, CircuitState::Open);
            }
        }
    }

    /// Set the breaker mirror directly (used by an attached stage breaker)
    pub fn set_circuit_breaker_state(&self, stage: FlowStage, state: CircuitState) {
        self.inner.write().circuit_breaker_state.insert(stage, state);
    }

    pub fn is_circuit_breaker_open(&self, stage: FlowStage) -> bool {
        self.inner.read().circuit_breaker_state.get(&stage) == Some(&CircuitState::Open)
    }

    pub fn circuit_breaker_state(&self, stage: FlowStage) -> CircuitState {
        self.inner
            .read()
            .circuit_breaker_state
            .get(&stage)
            .copied()
            .unwrap_or(CircuitState::Closed)
    }

    /// True iff the breaker mirror is open and the recovery window elapsed
    pub fn should_attempt_circuit_recovery(&self, stage: FlowStage) -> bool {
        let inner = self.inner.read();
        if inner.circuit_breaker_state.get(&stage) != Some(&CircuitState::Open) {
            return false;
        }
        match inner.circuit_breaker_last_failure.get(&stage) {
            None => true,
            Some(last) => {
                (Utc::now() - *last).num_seconds() > CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECONDS
            }
        }
    }

    /// Activate the global kill-switch; no new transitions are accepted
    /// until deactivation.
    pub fn activate_kill_switch(&self, reason: &str) {
        let mut inner = self.inner.write();
        inner.circuit_breaker_active = true;
        inner.circuit_breaker_reason = Some(reason.to_string());
        inner.circuit_breaker_activated_at = Some(Utc::now());
    }

    pub fn deactivate_kill_switch(&self) {
        let mut inner = self.inner.write();
        inner.circuit_breaker_active = false;
        inner.circuit_breaker_reason = None;
        inner.circuit_breaker_activated_at = None;
    }

    pub fn kill_switch_active(&self) -> bool {
        self.inner.read().circuit_breaker_active
    }

    pub fn completed_stages(&self) -> BTreeSet<FlowStage> {
        self.inner.read().completed_stages.clone()
    }

    pub fn transition_history(&self) -> Vec<StageTransition> {
        self.inner.read().execution_history.clone()
    }

    pub fn history_len(&self) -> usize {
        self.inner.read().execution_history.len()
    }

    pub fn total_execution_time(&self) -> f64 {
        self.inner.read().total_execution_time
    }

    pub fn total_retry_count(&self) -> u32 {
        self.inner.read().total_retry_count
    }

    /// Begin tracking one handler invocation for `stage`
    pub fn start_stage_execution(&self, stage: FlowStage) -> StageExecution {
        StageExecution::new(
            stage,
            self.execution_id.clone(),
            self.get_stage_retry_count(stage),
        )
    }

    /// Remove retry counters, completion flag and result for a stage
    pub fn reset_stage(&self, stage: FlowStage) {
        let mut inner = self.inner.write();
        inner.retry_count.remove(&stage);
        inner.completed_stages.remove(&stage);
        inner.stage_results.remove(&stage);
    }

    pub fn is_completed(&self) -> bool {
        is_terminal_stage(self.inner.read().current_stage)
    }

    pub fn execution_duration_seconds(&self) -> f64 {
        (Utc::now() - self.inner.read().start_time).num_milliseconds() as f64 / 1000.0
    }

    /// Drop transitions older than `max_age_hours`; returns removed count
    pub fn cleanup_old_history(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours);
        let mut inner = self.inner.write();
        let before = inner.execution_history.len();
        inner.execution_history.retain(|t| t.timestamp >= cutoff);
        before - inner.execution_history.len()
    }

    /// Summary for status endpoints and completion events
    pub fn execution_summary(&self) -> serde_json::Value {
        let inner = self.inner.read();
        let open_breakers: Vec<&str> = inner
            .circuit_breaker_state
            .iter()
            .filter(|(_, state)| **state == CircuitState::Open)
            .map(|(stage, _)| stage.key())
            .collect();

        serde_json::json!({
            "execution_id": self.execution_id,
            "current_stage": inner.current_stage.key(),
            "completed_stages": inner.completed_stages.iter().map(|s| s.key()).collect::<Vec<_>>(),
            "total_execution_time": inner.total_execution_time,
            "total_retry_count": inner.total_retry_count,
            "transitions": inner.execution_history.len(),
            "circuit_breakers_open": open_breakers,
        })
    }

    /// Comprehensive health block, including potential-loop warnings over
    /// the last 10 transitions
    pub fn health_status(&self) -> serde_json::Value {
        let inner = self.inner.read();
        let execution_time = (Utc::now() - inner.start_time).num_milliseconds() as f64 / 1000.0;

        let open_breakers: Vec<&str> = inner
            .circuit_breaker_state
            .iter()
            .filter(|(_, state)| **state == CircuitState::Open)
            .map(|(stage, _)| stage.key())
            .collect();

        serde_json::json!({
            "is_healthy": open_breakers.is_empty() && !inner.circuit_breaker_active,
            "execution_time_seconds": execution_time,
            "stages_completed": inner.completed_stages.len(),
            "total_retries": inner.total_retry_count,
            "open_circuit_breakers": open_breakers,
            "kill_switch_active": inner.circuit_breaker_active,
            "potential_loops": Self::detect_potential_loops(&inner.execution_history),
        })
    }

    fn detect_potential_loops(history: &[StageTransition]) -> Vec<String> {
        let recent = if history.len() >= 10 {
            &history[history.len() - 10..]
        } else {
            history
        };

        let mut warnings = BTreeSet::new();
        for window in recent.windows(3) {
            let (t1, t3) = (&window[0], &window[2]);
            if t1.from_stage == t3.from_stage && t1.to_stage == t3.to_stage {
                warnings.insert(format!(
                    "potential loop detected: {} <-> {}",
                    t1.from_stage, t1.to_stage
                ));
            }
        }
        warnings.into_iter().collect()
    }

    /// Stable serializable view including `transition_history`
    pub fn snapshot(&self) -> FlowStateSnapshot {
        let inner = self.inner.read();
        FlowStateSnapshot {
            execution_id: self.execution_id.clone(),
            current_stage: inner.current_stage,
            completed_stages: inner.completed_stages.clone(),
            start_time: inner.start_time,
            retry_count: inner.retry_count.clone(),
            max_retries: inner.max_retries.clone(),
            transition_history: inner.execution_history.clone(),
            stage_results: inner.stage_results.clone(),
            circuit_breaker_state: inner.circuit_breaker_state.clone(),
            circuit_breaker_failures: inner.circuit_breaker_failures.clone(),
            circuit_breaker_last_failure: inner.circuit_breaker_last_failure.clone(),
            stage_timeouts: inner.stage_timeouts.clone(),
            total_execution_time: inner.total_execution_time,
            total_retry_count: inner.total_retry_count,
            circuit_breaker_active: inner.circuit_breaker_active,
            circuit_breaker_reason: inner.circuit_breaker_reason.clone(),
            circuit_breaker_activated_at: inner.circuit_breaker_activated_at,
        }
    }

    /// Rebuild a state from a checkpointed snapshot
    pub fn restore(snapshot: FlowStateSnapshot) -> Self {
        Self {
            execution_id: snapshot.execution_id,
            inner: RwLock::new(StateInner {
                current_stage: snapshot.current_stage,
                completed_stages: snapshot.completed_stages,
                start_time: snapshot.start_time,
                retry_count: snapshot.retry_count,
                max_retries: snapshot.max_retries,
                execution_history: snapshot.transition_history,
                stage_results: snapshot.stage_results,
                circuit_breaker_state: snapshot.circuit_breaker_state,
                circuit_breaker_failures: snapshot.circuit_breaker_failures,
                circuit_breaker_last_failure: snapshot.circuit_breaker_last_failure,
                stage_timeouts: snapshot.stage_timeouts,
                total_execution_time: snapshot.total_execution_time,
                total_retry_count: snapshot.total_retry_count,
                circuit_breaker_active: snapshot.circuit_breaker_active,
                circuit_breaker_reason: snapshot.circuit_breaker_reason,
                circuit_breaker_activated_at: snapshot.circuit_breaker_activated_at,
            }),
        }
    }
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self::new()
    }
}
