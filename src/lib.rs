//! # Content Flow Engine
//!
//! A durable multi-stage content-generation flow engine: a state machine
//! with retries, circuit breakers, loop prevention, timeouts,
//! human-in-the-loop review points and live observability.
//!
//! ## Architecture Overview
//!
//! A run moves through a fixed linear chain:
//!
//! ```text
//! INPUT_VALIDATION -> (RESEARCH?) -> AUDIENCE_ALIGN -> DRAFT_GENERATION
//!                  -> STYLE_VALIDATION -> QUALITY_CHECK -> FINALIZED
//! ```
//!
//! Every transition passes through the execution chain, which consults the
//! flow control state, the per-stage circuit breakers, the retry policy and
//! the loop prevention guards, and emits events to the observability fabric.
//!
//! - **Flow state** ([`flow_state`]): authoritative per-run aggregate with
//!   an append-only transition history, retry budgets, breaker mirrors and
//!   a global kill-switch.
//! - **Fault tolerance** ([`circuit_breaker`], [`retry`],
//!   [`loop_prevention`]): per-stage three-state breakers with time-based
//!   recovery, classified exponential-backoff retries, and runaway-loop
//!   detection with a sticky emergency stop.
//! - **Execution** ([`stage_manager`], [`execution_chain`]): timeout-guarded
//!   stage dispatch over a declarative handler table with routing
//!   predicates, per-stage fallbacks and human review gates.
//! - **Observability** ([`metrics`], [`alerting`], [`events`],
//!   [`logging`]): KPI snapshotting with threshold alerts, notification
//!   channels, a typed event stream and structured logging.
//! - **Durability** ([`persistence`], [`storage`]): checkpoint/recover for
//!   flow runs and buffered, aggregated metric history.
//!
//! The individual content agents (research crawler, draft generator, style
//! and quality analyzers) are external collaborators invoked through the
//! uniform [`execution_chain::StageHandler`] contract; knowledge bases are
//! consumed through the [`knowledge::KnowledgeAdapter`] capability.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use content_flow_engine::{
//!     EngineConfig, FlowEngine, FlowStage, FnHandler, StageOutput, WritingFlowInputs,
//! };
//!
//! #[tokio::main]
//! async fn main() -> content_flow_engine::Result<()> {
//!     let draft = Arc::new(FnHandler::new("draft_writer", |_ctx, input| async move {
//!         let draft = format!("Notes on {}", input.writing_state.topic_title);
//!         Ok(StageOutput::new("draft_writer", serde_json::json!({ "draft": draft })))
//!     }));
//!     # let audience = draft.clone(); let style = draft.clone(); let quality = draft.clone();
//!
//!     let engine = FlowEngine::builder(EngineConfig::default())
//!         .handler(FlowStage::AudienceAlign, audience)
//!         .handler(FlowStage::DraftGeneration, draft)
//!         .handler(FlowStage::StyleValidation, style)
//!         .handler(FlowStage::QualityCheck, quality)
//!         .build()?;
//!
//!     engine.initialize_flow(WritingFlowInputs {
//!         topic_title: "Quantized edge inference".into(),
//!         platform: "LinkedIn".into(),
//!         file_path: None,
//!         content_type: "STANDALONE".into(),
//!         content_ownership: "ORIGINAL".into(),
//!         viral_score: 7.0,
//!         editorial_recommendations: String::new(),
//!         skip_research: false,
//!     })?;
//!
//!     let result = engine.execute().await?;
//!     println!("final stage: {}", result.final_stage);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine version for compatibility tracking
pub const ENGINE_VERSION: &str = "1.0.0-linear";

pub mod alerting;
pub mod circuit_breaker;
pub mod config;
pub mod events;
pub mod execution_chain;
pub mod flow_stage;
pub mod flow_state;
pub mod knowledge;
pub mod logging;
pub mod loop_prevention;
pub mod metrics;
pub mod persistence;
pub mod retry;
pub mod review_gate;
pub mod stage_manager;
pub mod storage;

pub use config::EngineConfig;
pub use execution_chain::{
    ChainExecutionResult, FlowDecisions, FlowEngine, FlowEngineBuilder, FnHandler, StageHandler,
    StageInput, StageOutput, WritingFlowInputs, WritingState,
};
pub use flow_stage::FlowStage;
pub use flow_state::{FlowControlState, StageResult, StageStatus};
pub use retry::{StageError, StageErrorKind};

/// Error taxonomy for the flow engine.
///
/// Recoverable classes (classified stage failures, timeouts) are handled
/// locally by the retry policy and breakers; unrecoverable classes
/// transition the run to the failed stage with a full reason.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum FlowError {
    /// Inputs rejected at initialize; the run never starts
    #[error("Validation error: {0}")]
    Validation(String),

    /// Illegal stage transition or kill-switch active
    #[error("Transition rejected: {0}")]
    TransitionRejected(String),

    /// Classified handler failure, subject to retry and breaker policy
    #[error("Stage failure: {0}")]
    StageFailure(#[from] retry::StageError),

    /// Stage exceeded its timeout budget; counted as a failure
    #[error("Stage {stage} timed out after {timeout_s}s")]
    Timeout {
        stage: flow_stage::FlowStage,
        timeout_s: u64,
    },

    /// A circuit breaker refused the call
    #[error("Circuit breaker '{0}' is open - calls are blocked")]
    CircuitOpen(String),

    /// Loop prevention blocked an invocation; always fatal for the run
    #[error("Loop violation: {0}")]
    LoopViolation(String),

    /// Checkpoint or recovery I/O failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Alert dispatch failure; never affects run outcome
    #[error("Notification error: {0}")]
    Notification(String),

    /// Invalid parameters, missing resources, initialization failures
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal condition
    #[error("System error: {0}")]
    System(String),
}

impl FlowError {
    /// Stable snake_case tag for archives and log payloads
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Validation(_) => "validation",
            FlowError::TransitionRejected(_) => "transition_rejected",
            FlowError::StageFailure(_) => "stage_failure",
            FlowError::Timeout { .. } => "timeout",
            FlowError::CircuitOpen(_) => "circuit_open",
            FlowError::LoopViolation(_) => "loop_violation",
            FlowError::Persistence(_) => "persistence",
            FlowError::Notification(_) => "notification",
            FlowError::Configuration(_) => "configuration",
            FlowError::System(_) => "system",
        }
    }
}

/// Result type for all flow engine operations
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(FlowError::Validation("x".into()).kind(), "validation");
        assert_eq!(
            FlowError::CircuitOpen("draft_generation".into()).kind(),
            "circuit_open"
        );
        assert_eq!(
            FlowError::Timeout {
                stage: FlowStage::DraftGeneration,
                timeout_s: 180
            }
            .kind(),
            "timeout"
        );
    }

    #[test]
    fn test_stage_error_converts_to_flow_error() {
        let stage_error = StageError::new(StageErrorKind::ContentQuality, "draft too thin");
        let flow_error: FlowError = stage_error.into();
        assert_eq!(flow_error.kind(), "stage_failure");
        assert!(flow_error.to_string().contains("content_quality"));
    }
}
