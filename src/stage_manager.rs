//! # Stage Manager - Stage Lifecycle Bookkeeping
//!
//! Starts and completes stage executions against the flow state, stamps
//! timing, feeds the KPI collector and fans out stage events. The execution
//! chain drives it once per handler invocation; a retried stage gets a
//! fresh execution each attempt.

use std::sync::Arc;
use std::time::Duration;

use crate::events::{EventBus, FlowEvent};
use crate::flow_stage::FlowStage;
use crate::flow_state::{FlowControlState, StageExecution, StageResult, StageStatus};
use crate::logging::{log_info, LogCategory};
use crate::metrics::FlowMetrics;

/// Stage lifecycle manager bound to one run
pub struct StageManager {
    state: Arc<FlowControlState>,
    metrics: Arc<FlowMetrics>,
    events: EventBus,
}

impl StageManager {
    pub fn new(state: Arc<FlowControlState>, metrics: Arc<FlowMetrics>, events: EventBus) -> Self {
        Self {
            state,
            metrics,
            events,
        }
    }

    /// Timeout budget for a stage
    pub fn timeout_budget(&self, stage: FlowStage) -> Duration {
        Duration::from_secs(self.state.get_stage_timeout(stage))
    }

    /// Begin one handler invocation; emits `StageStarted`
    pub fn begin_stage(&self, stage: FlowStage) -> StageExecution {
        let execution = self.state.start_stage_execution(stage);

        log_info(
            LogCategory::Stage,
            &format!(
                "Stage {stage} started (attempt {})",
                execution.retry_attempt + 1
            ),
        );
        self.events.emit(FlowEvent::StageStarted {
            flow_id: self.state.execution_id().to_string(),
            stage,
            retry_attempt: execution.retry_attempt,
        });
        metrics::counter!("flow_stage_started_total", 1, "stage" => stage.key());

        execution
    }

    /// Complete a successful execution: records the result, feeds KPIs and
    /// emits `StageCompleted`. Breaker mirrors are owned by the stage
    /// breakers themselves and are not touched here.
    pub fn complete_stage(&self, stage: FlowStage, result: StageResult) {
        let duration = result.execution_time_seconds;
        let status = result.status;

        self.state.mark_stage_complete(stage, result);

        self.metrics.record_stage_completion(
            self.state.execution_id(),
            stage.key(),
            duration,
            status == StageStatus::Success,
        );
        self.events.emit(FlowEvent::StageCompleted {
            flow_id: self.state.execution_id().to_string(),
            stage,
            status,
            duration_s: duration,
        });

        log_info(
            LogCategory::Stage,
            &format!("Stage {stage} completed with {status:?} in {duration:.2}s"),
        );
    }

    /// Record a failed or timed-out execution without marking the stage
    /// complete; the chain decides whether to retry, fall back or fail
    pub fn record_failed_attempt(&self, stage: FlowStage, result: &StageResult) {
        self.metrics.record_stage_completion(
            self.state.execution_id(),
            stage.key(),
            result.execution_time_seconds,
            false,
        );
        self.events.emit(FlowEvent::StageCompleted {
            flow_id: self.state.execution_id().to_string(),
            stage,
            status: result.status,
            duration_s: result.execution_time_seconds,
        });

        log_info(
            LogCategory::Stage,
            &format!(
                "Stage {stage} attempt failed with {:?}: {}",
                result.status,
                result.error_details.as_deref().unwrap_or("unknown error")
            ),
        );
    }

}
