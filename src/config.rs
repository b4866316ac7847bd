//! # Engine Configuration
//!
//! Layered configuration for the flow engine: compiled defaults, an
//! optional `flow_engine.toml` next to the process, then `FLOW_ENGINE_*`
//! environment variables. Defaults are production-ready.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{FlowError, Result};

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fail instead of falling back when a breaker is open
    pub strict_mode: bool,

    /// Directory for checkpoints and archives
    pub state_dir: PathBuf,

    /// Directory for durable metric history
    pub metrics_storage_path: PathBuf,

    /// Collect KPIs and evaluate alert rules
    pub enable_monitoring: bool,

    /// Persist a checkpoint at every stage boundary
    pub checkpoint_every_stage: bool,

    /// Human review gates active; disabled runs take canonical routes
    pub enable_review_gates: bool,

    /// Auto-approve review gates (testing and unattended runs)
    pub auto_approve_reviews: bool,

    /// Viral score below which the topic viability gate activates
    pub viability_floor: f64,

    /// Cap on feedback-driven re-routing loops per run
    pub max_feedback_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            state_dir: PathBuf::from("./flow_states"),
            metrics_storage_path: PathBuf::from("./metrics_storage"),
            enable_monitoring: true,
            checkpoint_every_stage: true,
            enable_review_gates: false,
            auto_approve_reviews: false,
            viability_floor: 3.0,
            max_feedback_iterations: 3,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then `flow_engine.toml` when present,
    /// then `FLOW_ENGINE_*` environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&EngineConfig::default())
            .map_err(|e| FlowError::Configuration(format!("default config: {e}")))?;

        config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("flow_engine").required(false))
            .add_source(config::Environment::with_prefix("FLOW_ENGINE"))
            .build()
            .map_err(|e| FlowError::Configuration(format!("config build: {e}")))?
            .try_deserialize()
            .map_err(|e| FlowError::Configuration(format!("config deserialize: {e}")))
    }
}
