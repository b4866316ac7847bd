//! # Retry Policy - Classified Error Backoff
//!
//! Exponential-backoff retry policy keyed by stage and classified error.
//! Stage handlers surface failures as [`StageError`] values carrying a
//! [`StageErrorKind`]; whether a kind is retryable depends on the stage it
//! occurred in. Circuit-open rejections are never retried here, the breaker
//! owns that decision.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::flow_stage::FlowStage;
use crate::flow_state::FlowControlState;
use crate::logging::{log_info, LogCategory};
use crate::FlowError;

/// Classified error kinds raised by stage handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Timeout or network failure reaching a backend
    ConnectionError,
    /// Backend API returned an error response
    ApiError,
    /// Output failed structural/style validation
    ValidationError,
    /// Output fell below the quality threshold
    QualityError,
    /// Generated content unusable
    ContentQuality,
    /// Generated content out of length bounds
    LengthIssues,
    /// Anything unclassified; non-retryable
    Other,
}

impl StageErrorKind {
    pub fn key(&self) -> &'static str {
        match self {
            StageErrorKind::ConnectionError => "connection_error",
            StageErrorKind::ApiError => "api_error",
            StageErrorKind::ValidationError => "validation_error",
            StageErrorKind::QualityError => "quality_error",
            StageErrorKind::ContentQuality => "content_quality",
            StageErrorKind::LengthIssues => "length_issues",
            StageErrorKind::Other => "other",
        }
    }

    /// Stage-specific retryability table
    pub fn retryable_for(&self, stage: FlowStage) -> bool {
        match stage {
            FlowStage::Research => matches!(
                self,
                StageErrorKind::ConnectionError | StageErrorKind::ApiError
            ),
            FlowStage::DraftGeneration => matches!(
                self,
                StageErrorKind::ContentQuality | StageErrorKind::LengthIssues
            ),
            FlowStage::StyleValidation => matches!(self, StageErrorKind::ValidationError),
            FlowStage::QualityCheck => matches!(self, StageErrorKind::QualityError),
            _ => false,
        }
    }
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Classified failure from a stage handler
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: StageErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }

    pub fn other(message: &str) -> Self {
        Self::new(StageErrorKind::Other, message)
    }
}

/// Backoff policy parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay: Duration,
    /// Global delay cap, overridable per stage
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 0.0 to 1.0
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Retry policy keyed by stage and classified error.
///
/// Maximum attempts come from the flow state's per-stage `max_retries`
/// budgets; the manager only decides *whether* and *when*, the engine drives
/// the actual re-invocation.
pub struct RetryManager {
    flow_state: Arc<FlowControlState>,
    config: RetryConfig,
    stage_max_delay: HashMap<FlowStage, Duration>,
}

impl RetryManager {
    pub fn new(flow_state: Arc<FlowControlState>) -> Self {
        Self::with_config(flow_state, RetryConfig::default())
    }

    pub fn with_config(flow_state: Arc<FlowControlState>, config: RetryConfig) -> Self {
        Self {
            flow_state,
            config,
            stage_max_delay: HashMap::new(),
        }
    }

    /// Override the delay cap for one stage
    pub fn set_stage_max_delay(&mut self, stage: FlowStage, cap: Duration) {
        self.stage_max_delay.insert(stage, cap);
    }

    /// True iff the stage has retry budget left and the error kind is
    /// retryable for it
    pub fn should_retry(&self, stage: FlowStage, error: &StageError) -> bool {
        self.flow_state.can_retry(stage) && error.kind.retryable_for(stage)
    }

    /// Engine-facing check over the full error taxonomy. Circuit-open
    /// rejections are never retried; the breaker decides when the next
    /// probe happens.
    pub fn should_retry_error(&self, stage: FlowStage, error: &FlowError) -> bool {
        match error {
            FlowError::CircuitOpen(_) => false,
            FlowError::StageFailure(stage_error) => self.should_retry(stage, stage_error),
            FlowError::Timeout { .. } => {
                // Timeouts count as connection-class failures
                self.flow_state.can_retry(stage)
                    && StageErrorKind::ConnectionError.retryable_for(stage)
            }
            _ => false,
        }
    }

    /// `delay = base · multiplier^attempt` with jitter, capped per stage
    pub fn backoff_delay(&self, stage: FlowStage, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let raw_ms = base_ms * self.config.backoff_multiplier.powi(attempt as i32);
        let jitter = raw_ms * self.config.jitter_factor * rand::thread_rng().gen::<f64>();

        let cap = self
            .stage_max_delay
            .get(&stage)
            .copied()
            .unwrap_or(self.config.max_delay);

        Duration::from_millis(((raw_ms + jitter) as u64).min(cap.as_millis() as u64))
    }

    /// Consume one unit of retry budget, log the schedule and return the
    /// delay to sleep before re-invoking. `None` when the policy rejects.
    pub fn schedule_retry(&self, stage: FlowStage, error: &FlowError) -> Option<Duration> {
        if !self.should_retry_error(stage, error) {
            return None;
        }

        let attempt = self.flow_state.increment_retry(stage);
        let delay = self.backoff_delay(stage, attempt);

        log_info(
            LogCategory::Retry,
            &format!(
                "Scheduling retry {attempt}/{} for stage {stage} in {delay:?} ({error})",
                self.flow_state.max_retries_for(stage)
            ),
        );
        metrics::counter!("flow_retries_total", 1, "stage" => stage.key());

        Some(delay)
    }
}
