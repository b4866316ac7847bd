//! # Flow Persistence - Checkpoints and Archival
//!
//! Durable snapshots of [`FlowControlState`] taken at stage boundaries.
//! Active checkpoints live under `checkpoints/`; completed and failed runs
//! are archived in their own compartments and archival removes the run's
//! active checkpoints.
//!
//! Checkpoint files are named `<flow_id>_<stage>_<YYYYMMDD_HHMMSS>.json`.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::flow_stage::FlowStage;
use crate::flow_state::{FlowControlState, FlowStateSnapshot};
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::{FlowError, Result};

/// On-disk checkpoint layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub flow_id: String,
    pub stage: String,
    pub timestamp: String,
    pub state: FlowStateSnapshot,
    pub state_class: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Checkpoint listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub filepath: PathBuf,
    pub stage: String,
    pub timestamp: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Checkpoint and archive manager for flow runs.
pub struct FlowStateManager {
    state_dir: PathBuf,
    checkpoints_dir: PathBuf,
    completed_dir: PathBuf,
    failed_dir: PathBuf,
    io_lock: Mutex<()>,
}

impl FlowStateManager {
    pub fn new(state_dir: &Path) -> Result<Self> {
        let checkpoints_dir = state_dir.join("checkpoints");
        let completed_dir = state_dir.join("completed");
        let failed_dir = state_dir.join("failed");

        for dir in [state_dir, &checkpoints_dir, &completed_dir, &failed_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                FlowError::Persistence(format!("failed to create state dir {dir:?}: {e}"))
            })?;
        }

        log_info(
            LogCategory::Persistence,
            &format!("Flow state manager initialized at {state_dir:?}"),
        );

        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            checkpoints_dir,
            completed_dir,
            failed_dir,
            io_lock: Mutex::new(()),
        })
    }

    fn timestamp_now() -> String {
        Utc::now().format("%Y%m%d_%H%M%S").to_string()
    }

    fn write_json(path: &Path, value: &serde_json::Value) -> Result<()> {
        let contents = serde_json::to_string_pretty(value)
            .map_err(|e| FlowError::Persistence(format!("serialization failed: {e}")))?;
        std::fs::write(path, contents)
            .map_err(|e| FlowError::Persistence(format!("write failed for {path:?}: {e}")))
    }

    /// Save a checkpoint for a flow at a stage boundary
    pub fn save_checkpoint(
        &self,
        flow_id: &str,
        state: &FlowControlState,
        stage: FlowStage,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<PathBuf> {
        let timestamp = Self::timestamp_now();
        let filename = format!("{flow_id}_{}_{timestamp}.json", stage.key());
        let filepath = self.checkpoints_dir.join(filename);

        let checkpoint = CheckpointData {
            flow_id: flow_id.to_string(),
            stage: stage.key().to_string(),
            timestamp,
            state: state.snapshot(),
            state_class: "FlowControlState".to_string(),
            metadata,
        };

        let value = serde_json::to_value(&checkpoint)
            .map_err(|e| FlowError::Persistence(format!("checkpoint serialization: {e}")))?;

        let _guard = self.io_lock.lock();
        Self::write_json(&filepath, &value)?;

        log_info(
            LogCategory::Persistence,
            &format!("Checkpoint saved: {flow_id} at {stage} -> {filepath:?}"),
        );
        Ok(filepath)
    }

    /// List checkpoints for a flow, newest first
    pub fn list_checkpoints(&self, flow_id: &str) -> Vec<CheckpointInfo> {
        let _guard = self.io_lock.lock();
        let prefix = format!("{flow_id}_");
        let mut checkpoints = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&self.checkpoints_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(&prefix) || !name.ends_with(".json") {
                    continue;
                }
                match std::fs::read_to_string(entry.path())
                    .ok()
                    .and_then(|s| serde_json::from_str::<CheckpointData>(&s).ok())
                {
                    Some(data) => checkpoints.push(CheckpointInfo {
                        filepath: entry.path(),
                        stage: data.stage,
                        timestamp: data.timestamp,
                        metadata: data.metadata,
                    }),
                    None => log_warn(
                        LogCategory::Persistence,
                        &format!("Failed to read checkpoint {:?}", entry.path()),
                    ),
                }
            }
        }

        checkpoints.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        checkpoints
    }

    /// Load the most recent checkpoint for a flow
    pub fn load_latest_checkpoint(&self, flow_id: &str) -> Option<CheckpointData> {
        let latest = self.list_checkpoints(flow_id).into_iter().next()?;
        let _guard = self.io_lock.lock();
        match std::fs::read_to_string(&latest.filepath)
            .ok()
            .and_then(|s| serde_json::from_str::<CheckpointData>(&s).ok())
        {
            Some(data) => Some(data),
            None => {
                log_error(
                    LogCategory::Persistence,
                    &format!("Failed to load checkpoint {:?}", latest.filepath),
                );
                None
            }
        }
    }

    /// Recover a flow from its latest checkpoint
    pub fn recover_flow(&self, flow_id: &str) -> Option<(FlowControlState, FlowStage)> {
        let checkpoint = self.load_latest_checkpoint(flow_id)?;
        let stage = FlowStage::from_key(&checkpoint.stage)?;
        let state = FlowControlState::restore(checkpoint.state);

        log_info(
            LogCategory::Persistence,
            &format!(
                "Flow recovered from checkpoint: {flow_id} at {} ({})",
                checkpoint.stage, checkpoint.timestamp
            ),
        );
        Some((state, stage))
    }

    /// Archive a completed run; removes its active checkpoints
    pub fn save_completed(
        &self,
        flow_id: &str,
        state: &FlowControlState,
        results: serde_json::Value,
    ) -> Result<PathBuf> {
        let timestamp = Self::timestamp_now();
        let filepath = self
            .completed_dir
            .join(format!("{flow_id}_completed_{timestamp}.json"));

        let data = serde_json::json!({
            "flow_id": flow_id,
            "timestamp": timestamp,
            "state": state.snapshot(),
            "results": results,
            "completion_time": Utc::now().to_rfc3339(),
        });

        {
            let _guard = self.io_lock.lock();
            Self::write_json(&filepath, &data)?;
        }
        self.cleanup_checkpoints(flow_id);

        log_info(
            LogCategory::Persistence,
            &format!("Completed flow archived: {flow_id} -> {filepath:?}"),
        );
        Ok(filepath)
    }

    /// Archive a failed run for debugging; removes its active checkpoints
    pub fn save_failed(
        &self,
        flow_id: &str,
        state: &FlowControlState,
        error: &FlowError,
        stage: FlowStage,
    ) -> Result<PathBuf> {
        let timestamp = Self::timestamp_now();
        let filepath = self
            .failed_dir
            .join(format!("{flow_id}_failed_{timestamp}.json"));

        let data = serde_json::json!({
            "flow_id": flow_id,
            "timestamp": timestamp,
            "stage": stage.key(),
            "state": state.snapshot(),
            "error": {
                "type": error.kind(),
                "message": error.to_string(),
            },
            "failure_time": Utc::now().to_rfc3339(),
        });

        {
            let _guard = self.io_lock.lock();
            Self::write_json(&filepath, &data)?;
        }
        self.cleanup_checkpoints(flow_id);

        log_info(
            LogCategory::Persistence,
            &format!("Failed flow archived: {flow_id} at {stage} -> {filepath:?}"),
        );
        Ok(filepath)
    }

    /// Remove all active checkpoints for a flow
    fn cleanup_checkpoints(&self, flow_id: &str) {
        let _guard = self.io_lock.lock();
        let prefix = format!("{flow_id}_");
        if let Ok(entries) = std::fs::read_dir(&self.checkpoints_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&prefix) && name.ends_with(".json") {
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        log_warn(
                            LogCategory::Persistence,
                            &format!("Failed to remove checkpoint {:?}: {e}", entry.path()),
                        );
                    }
                }
            }
        }
    }

    /// Keep only the most recent `keep` checkpoints per flow
    pub fn prune_checkpoints(&self, flow_id: &str, keep: usize) -> usize {
        let checkpoints = self.list_checkpoints(flow_id);
        if checkpoints.len() <= keep {
            return 0;
        }

        let _guard = self.io_lock.lock();
        let mut removed = 0;
        for checkpoint in &checkpoints[keep..] {
            if std::fs::remove_file(&checkpoint.filepath).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Persistence statistics across compartments
    pub fn statistics(&self) -> serde_json::Value {
        let _guard = self.io_lock.lock();
        let count_json = |dir: &Path| -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .flatten()
                        .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
                        .count()
                })
                .unwrap_or(0)
        };

        let mut storage_bytes = 0u64;
        for dir in [&self.checkpoints_dir, &self.completed_dir, &self.failed_dir] {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    if let Ok(meta) = entry.metadata() {
                        storage_bytes += meta.len();
                    }
                }
            }
        }

        serde_json::json!({
            "state_dir": self.state_dir,
            "total_checkpoints": count_json(&self.checkpoints_dir),
            "completed_flows": count_json(&self.completed_dir),
            "failed_flows": count_json(&self.failed_dir),
            "storage_used_mb": storage_bytes as f64 / (1024.0 * 1024.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_state::StageResult;
    use tempfile::TempDir;

    fn sample_state() -> FlowControlState {
        let state = FlowControlState::new();
        state.add_transition(FlowStage::Research, "external").unwrap();
        state.increment_retry(FlowStage::Research);
        state.mark_stage_complete(
            FlowStage::Research,
            StageResult::success(FlowStage::Research, serde_json::json!({"sources": []}), 1.5),
        );
        state
    }

    #[test]
    fn test_checkpoint_then_recover_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = FlowStateManager::new(dir.path()).unwrap();
        let state = sample_state();
        let flow_id = state.execution_id().to_string();

        manager
            .save_checkpoint(&flow_id, &state, FlowStage::Research, HashMap::new())
            .unwrap();

        let (recovered, stage) = manager.recover_flow(&flow_id).unwrap();
        assert_eq!(stage, FlowStage::Research);
        assert_eq!(recovered.current_stage(), state.current_stage());
        assert_eq!(recovered.completed_stages(), state.completed_stages());
        assert_eq!(
            recovered.get_stage_retry_count(FlowStage::Research),
            state.get_stage_retry_count(FlowStage::Research)
        );
        assert_eq!(recovered.history_len(), state.history_len());
    }

    #[test]
    fn test_checkpoint_filename_layout() {
        let dir = TempDir::new().unwrap();
        let manager = FlowStateManager::new(dir.path()).unwrap();
        let state = FlowControlState::with_execution_id("flow-abc".to_string());

        let path = manager
            .save_checkpoint("flow-abc", &state, FlowStage::InputValidation, HashMap::new())
            .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("flow-abc_input_validation_"));
        assert!(name.ends_with(".json"));
    }

    #[test]
    fn test_listing_sorted_newest_first() {
        let dir = TempDir::new().unwrap();
        let manager = FlowStateManager::new(dir.path()).unwrap();
        let state = FlowControlState::with_execution_id("flow-1".to_string());

        manager
            .save_checkpoint("flow-1", &state, FlowStage::InputValidation, HashMap::new())
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        manager
            .save_checkpoint("flow-1", &state, FlowStage::AudienceAlign, HashMap::new())
            .unwrap();

        let checkpoints = manager.list_checkpoints("flow-1");
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].stage, "audience_align");
        assert!(checkpoints[0].timestamp >= checkpoints[1].timestamp);
    }

    #[test]
    fn test_completion_archival_removes_checkpoints() {
        let dir = TempDir::new().unwrap();
        let manager = FlowStateManager::new(dir.path()).unwrap();
        let state = FlowControlState::with_execution_id("flow-2".to_string());

        manager
            .save_checkpoint("flow-2", &state, FlowStage::DraftGeneration, HashMap::new())
            .unwrap();
        assert_eq!(manager.list_checkpoints("flow-2").len(), 1);

        manager
            .save_completed("flow-2", &state, serde_json::json!({"final_draft": "done"}))
            .unwrap();

        assert!(manager.list_checkpoints("flow-2").is_empty());
        let stats = manager.statistics();
        assert_eq!(stats["completed_flows"], 1);
        assert_eq!(stats["total_checkpoints"], 0);
    }

    #[test]
    fn test_failed_archival_includes_error() {
        let dir = TempDir::new().unwrap();
        let manager = FlowStateManager::new(dir.path()).unwrap();
        let state = FlowControlState::with_execution_id("flow-3".to_string());

        let error = FlowError::LoopViolation("stage draft_generation is blocked".to_string());
        let path = manager
            .save_failed("flow-3", &state, &error, FlowStage::DraftGeneration)
            .unwrap();

        let contents: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(contents["error"]["type"], "loop_violation");
        assert!(contents["error"]["message"]
            .as_str()
            .unwrap()
            .contains("blocked"));
        assert_eq!(contents["stage"], "draft_generation");
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let manager = FlowStateManager::new(dir.path()).unwrap();
        let state = FlowControlState::with_execution_id("flow-4".to_string());

        for stage in [
            FlowStage::InputValidation,
            FlowStage::AudienceAlign,
            FlowStage::DraftGeneration,
        ] {
            manager
                .save_checkpoint("flow-4", &state, stage, HashMap::new())
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }

        let removed = manager.prune_checkpoints("flow-4", 1);
        assert_eq!(removed, 2);
        let remaining = manager.list_checkpoints("flow-4");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].stage, "draft_generation");
    }

    #[test]
    fn test_recover_unknown_flow_returns_none() {
        let dir = TempDir::new().unwrap();
        let manager = FlowStateManager::new(dir.path()).unwrap();
        assert!(manager.recover_flow("missing-flow").is_none());
    }
}
