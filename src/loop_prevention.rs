//! # Loop Prevention - Runaway Execution Guards
//!
//! Bounded in-memory tracking of every stage-handler invocation with hard
//! caps, periodic pattern detection and a sticky emergency stop. The
//! counters are the primary gate; pattern detection is a monitor that
//! escalates to block-lists when a critical pattern shows up.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::flow_stage::FlowStage;
use crate::logging::{log_debug, log_error, log_info, log_warn, LogCategory};
use crate::{FlowError, Result};

/// Risk levels for detected loop patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopRiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Kinds of loop patterns the detector recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPatternKind {
    MethodRepetition,
    CyclicCalls,
    StageOscillation,
}

/// Record of one tracked invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: u64,
    pub method_name: String,
    pub stage: Option<FlowStage>,
    pub timestamp: DateTime<Utc>,
    pub execution_time_seconds: Option<f64>,
}

/// Detected loop pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPattern {
    pub kind: LoopPatternKind,
    pub method_names: Vec<String>,
    pub execution_count: usize,
    pub time_span_seconds: f64,
    pub risk_level: LoopRiskLevel,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub stage: Option<FlowStage>,
    pub recommendation: String,
}

/// Tunable limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPreventionConfig {
    pub max_executions_per_method: usize,
    pub max_executions_per_stage: usize,
    pub max_total_execution_minutes: i64,
    pub pattern_detection_window_minutes: i64,
    /// Record retention for cleanup
    pub record_max_age_minutes: i64,
}

impl Default for LoopPreventionConfig {
    fn default() -> Self {
        Self {
            max_executions_per_method: 50,
            max_executions_per_stage: 10,
            max_total_execution_minutes: 30,
            pattern_detection_window_minutes: 5,
            record_max_age_minutes: 60,
        }
    }
}

struct GuardInner {
    records: Vec<ExecutionRecord>,
    method_counts: HashMap<String, usize>,
    stage_counts: HashMap<FlowStage, usize>,
    start_time: DateTime<Utc>,
    emergency_stop: bool,
    blocked_methods: HashSet<String>,
    blocked_stages: HashSet<FlowStage>,
    detected_patterns: Vec<LoopPattern>,
    last_pattern_check: DateTime<Utc>,
    next_record_id: u64,
}

/// Comprehensive system for preventing infinite loops in flow execution.
///
/// Enforces per-method and per-stage caps, a total-runtime budget, and runs
/// pattern detection over a sliding window roughly every 30 seconds. Once a
/// method or stage lands on a block-list, every further invocation raises a
/// loop violation; the emergency stop is sticky until an explicit reset.
pub struct LoopPreventionSystem {
    config: LoopPreventionConfig,
    inner: Mutex<GuardInner>,
}

impl LoopPreventionSystem {
    pub fn new() -> Self {
        Self::with_config(LoopPreventionConfig::default())
    }

    pub fn with_config(config: LoopPreventionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(GuardInner {
                records: Vec::new(),
                method_counts: HashMap::new(),
                stage_counts: HashMap::new(),
                start_time: Utc::now(),
                emergency_stop: false,
                blocked_methods: HashSet::new(),
                blocked_stages: HashSet::new(),
                detected_patterns: Vec::new(),
                last_pattern_check: Utc::now(),
                next_record_id: 0,
            }),
        }
    }

    /// Track a method execution. Errors with a loop violation when any cap
    /// is exceeded, a block-list matches, or the emergency stop is active.
    pub fn track_execution(
        &self,
        method_name: &str,
        stage: Option<FlowStage>,
    ) -> Result<ExecutionRecord> {
        let mut inner = self.inner.lock();

        if inner.emergency_stop {
            return Err(FlowError::LoopViolation(
                "emergency stop active - loop prevention halted execution".to_string(),
            ));
        }

        if inner.blocked_methods.contains(method_name) {
            return Err(FlowError::LoopViolation(format!(
                "method {method_name} is blocked due to loop detection"
            )));
        }

        if let Some(stage) = stage {
            if inner.blocked_stages.contains(&stage) {
                return Err(FlowError::LoopViolation(format!(
                    "stage {stage} is blocked due to loop detection"
                )));
            }
        }

        let method_count = inner.method_counts.get(method_name).copied().unwrap_or(0);
        if method_count >= self.config.max_executions_per_method {
            inner.blocked_methods.insert(method_name.to_string());
            log_error(
                LogCategory::LoopGuard,
                &format!("Blocked method {method_name}: execution limit exceeded"),
            );
            return Err(FlowError::LoopViolation(format!(
                "method {method_name} exceeded execution limit ({})",
                self.config.max_executions_per_method
            )));
        }

        if let Some(stage) = stage {
            let window_start =
                Utc::now() - ChronoDuration::minutes(self.config.pattern_detection_window_minutes);
            let stage_count = inner
                .records
                .iter()
                .filter(|r| r.stage == Some(stage) && r.timestamp >= window_start)
                .count();
            if stage_count >= self.config.max_executions_per_stage {
                inner.blocked_stages.insert(stage);
                log_error(
                    LogCategory::LoopGuard,
                    &format!("Blocked stage {stage}: execution limit exceeded"),
                );
                return Err(FlowError::LoopViolation(format!(
                    "stage {stage} exceeded execution limit ({})",
                    self.config.max_executions_per_stage
                )));
            }
        }

        let total_time = Utc::now() - inner.start_time;
        if total_time > ChronoDuration::minutes(self.config.max_total_execution_minutes) {
            inner.emergency_stop = true;
            log_error(
                LogCategory::LoopGuard,
                "Emergency stop triggered: total execution time exceeded",
            );
            return Err(FlowError::LoopViolation(format!(
                "total execution time exceeded ({} minutes)",
                self.config.max_total_execution_minutes
            )));
        }

        let record = ExecutionRecord {
            id: inner.next_record_id,
            method_name: method_name.to_string(),
            stage,
            timestamp: Utc::now(),
            execution_time_seconds: None,
        };
        inner.next_record_id += 1;

        *inner.method_counts.entry(method_name.to_string()).or_insert(0) += 1;
        if let Some(stage) = stage {
            *inner.stage_counts.entry(stage).or_insert(0) += 1;
        }
        inner.records.push(record.clone());

        // Periodic sweep, roughly every 30 seconds
        if Utc::now() - inner.last_pattern_check > ChronoDuration::seconds(30) {
            Self::detect_patterns_locked(&self.config, &mut inner);
            inner.last_pattern_check = Utc::now();
        }

        log_debug(
            LogCategory::LoopGuard,
            &format!(
                "Tracked execution: {method_name} (count: {}, stage: {stage:?})",
                inner.method_counts[method_name]
            ),
        );

        Ok(record)
    }

    /// Mark a tracked execution complete with timing information
    pub fn complete_execution(&self, record: &ExecutionRecord) {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.records.iter_mut().rev().find(|r| r.id == record.id) {
            let elapsed = (Utc::now() - stored.timestamp).num_milliseconds() as f64 / 1000.0;
            stored.execution_time_seconds = Some(elapsed);
        }
    }

    /// Run pattern detection immediately over the current window
    pub fn detect_patterns(&self) -> Vec<LoopPattern> {
        let mut inner = self.inner.lock();
        Self::detect_patterns_locked(&self.config, &mut inner)
    }

    fn detect_patterns_locked(
        config: &LoopPreventionConfig,
        inner: &mut GuardInner,
    ) -> Vec<LoopPattern> {
        let cutoff = Utc::now() - ChronoDuration::minutes(config.pattern_detection_window_minutes);
        let recent: Vec<ExecutionRecord> = inner
            .records
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect();

        let mut patterns = Vec::new();
        patterns.extend(Self::detect_method_repetition(&recent));
        patterns.extend(Self::detect_cyclic_calls(&recent));
        patterns.extend(Self::detect_stage_oscillation(&recent));

        for pattern in &patterns {
            if pattern.risk_level == LoopRiskLevel::Critical {
                log_error(
                    LogCategory::LoopGuard,
                    &format!("Critical loop pattern detected: {}", pattern.recommendation),
                );
                for method_name in &pattern.method_names {
                    inner.blocked_methods.insert(method_name.clone());
                }
                if let Some(stage) = pattern.stage {
                    inner.blocked_stages.insert(stage);
                }
            }
        }

        inner.detected_patterns.extend(patterns.clone());
        patterns
    }

    fn detect_method_repetition(records: &[ExecutionRecord]) -> Vec<LoopPattern> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in records {
            *counts.entry(record.method_name.as_str()).or_insert(0) += 1;
        }

        let mut patterns = Vec::new();
        for (method_name, count) in counts {
            if count > 20 {
                let method_records: Vec<&ExecutionRecord> = records
                    .iter()
                    .filter(|r| r.method_name == method_name)
                    .collect();
                let first = method_records.first().unwrap().timestamp;
                let last = method_records.last().unwrap().timestamp;

                let risk_level = if count > 50 {
                    LoopRiskLevel::High
                } else {
                    LoopRiskLevel::Medium
                };

                patterns.push(LoopPattern {
                    kind: LoopPatternKind::MethodRepetition,
                    method_names: vec![method_name.to_string()],
                    execution_count: count,
                    time_span_seconds: (last - first).num_milliseconds() as f64 / 1000.0,
                    risk_level,
                    first_occurrence: first,
                    last_occurrence: last,
                    stage: None,
                    recommendation: format!(
                        "method {method_name} called {count} times - possible infinite loop"
                    ),
                });
            }
        }
        patterns
    }

    fn detect_cyclic_calls(records: &[ExecutionRecord]) -> Vec<LoopPattern> {
        let mut patterns = Vec::new();
        for window in records.windows(3) {
            let (a, b, c) = (&window[0], &window[1], &window[2]);
            if a.method_name == c.method_name && a.method_name != b.method_name {
                patterns.push(LoopPattern {
                    kind: LoopPatternKind::CyclicCalls,
                    method_names: vec![a.method_name.clone(), b.method_name.clone()],
                    execution_count: 3,
                    time_span_seconds: (c.timestamp - a.timestamp).num_milliseconds() as f64
                        / 1000.0,
                    risk_level: LoopRiskLevel::Medium,
                    first_occurrence: a.timestamp,
                    last_occurrence: c.timestamp,
                    stage: None,
                    recommendation: format!(
                        "cyclic pattern detected: {} -> {} -> {}",
                        a.method_name, b.method_name, c.method_name
                    ),
                });
            }
        }
        patterns
    }

    fn detect_stage_oscillation(records: &[ExecutionRecord]) -> Vec<LoopPattern> {
        let mut by_stage: HashMap<FlowStage, Vec<&ExecutionRecord>> = HashMap::new();
        for record in records {
            if let Some(stage) = record.stage {
                by_stage.entry(stage).or_default().push(record);
            }
        }

        let mut patterns = Vec::new();
        for (stage, stage_records) in by_stage {
            if stage_records.len() > 10 {
                let first = stage_records.first().unwrap().timestamp;
                let last = stage_records.last().unwrap().timestamp;

                let risk_level = if stage_records.len() > 20 {
                    LoopRiskLevel::Critical
                } else {
                    LoopRiskLevel::High
                };

                patterns.push(LoopPattern {
                    kind: LoopPatternKind::StageOscillation,
                    method_names: stage_records
                        .iter()
                        .map(|r| r.method_name.clone())
                        .collect(),
                    execution_count: stage_records.len(),
                    time_span_seconds: (last - first).num_milliseconds() as f64 / 1000.0,
                    risk_level,
                    first_occurrence: first,
                    last_occurrence: last,
                    stage: Some(stage),
                    recommendation: format!(
                        "stage {stage} executed {} times - check for loops",
                        stage_records.len()
                    ),
                });
            }
        }
        patterns
    }

    /// True when execution should halt: emergency stop, runtime budget
    /// exceeded, or anything on a block-list
    pub fn should_stop_execution(&self) -> bool {
        let inner = self.inner.lock();
        if inner.emergency_stop {
            return true;
        }
        if Utc::now() - inner.start_time
            > ChronoDuration::minutes(self.config.max_total_execution_minutes)
        {
            return true;
        }
        !inner.blocked_methods.is_empty() || !inner.blocked_stages.is_empty()
    }

    pub fn emergency_stop_active(&self) -> bool {
        self.inner.lock().emergency_stop
    }

    /// Force stop execution - for emergency situations
    pub fn force_stop(&self) {
        let mut inner = self.inner.lock();
        inner.emergency_stop = true;
        log_error(LogCategory::LoopGuard, "Loop prevention system force stopped");
    }

    /// Reset all counters, block-lists and the emergency stop
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.records.clear();
        inner.method_counts.clear();
        inner.stage_counts.clear();
        inner.blocked_methods.clear();
        inner.blocked_stages.clear();
        inner.detected_patterns.clear();
        inner.emergency_stop = false;
        inner.start_time = Utc::now();
        log_info(LogCategory::LoopGuard, "Loop prevention system reset");
    }

    /// Drop records older than the retention window; returns removed count
    pub fn cleanup_old_records(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::minutes(self.config.record_max_age_minutes);
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner.records.retain(|r| r.timestamp >= cutoff);
        let removed = before - inner.records.len();
        if removed > 0 {
            log_info(
                LogCategory::LoopGuard,
                &format!("Cleaned up {removed} old execution records"),
            );
        }
        removed
    }

    /// Comprehensive status report
    pub fn status_report(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let total_time = (Utc::now() - inner.start_time).num_milliseconds() as f64 / 1000.0;

        let recent_patterns: Vec<serde_json::Value> = inner
            .detected_patterns
            .iter()
            .rev()
            .take(5)
            .map(|p| {
                serde_json::json!({
                    "kind": p.kind,
                    "risk_level": p.risk_level,
                    "execution_count": p.execution_count,
                    "methods": p.method_names.iter().take(3).collect::<Vec<_>>(),
                    "recommendation": p.recommendation,
                })
            })
            .collect();

        serde_json::json!({
            "system_status": if inner.emergency_stop { "EMERGENCY_STOP" } else { "ACTIVE" },
            "total_execution_time_seconds": total_time,
            "total_executions": inner.records.len(),
            "method_counts": inner.method_counts,
            "stage_counts": inner.stage_counts.iter()
                .map(|(k, v)| (k.key().to_string(), *v))
                .collect::<HashMap<String, usize>>(),
            "blocked_methods": inner.blocked_methods,
            "blocked_stages": inner.blocked_stages.iter().map(|s| s.key()).collect::<Vec<_>>(),
            "detected_patterns": inner.detected_patterns.len(),
            "recent_patterns": recent_patterns,
            "limits": {
                "max_executions_per_method": self.config.max_executions_per_method,
                "max_executions_per_stage": self.config.max_executions_per_stage,
                "max_total_execution_minutes": self.config.max_total_execution_minutes,
            },
        })
    }

    /// Lightweight status used by health checks
    pub fn get_status(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        serde_json::json!({
            "emergency_stop": inner.emergency_stop,
            "blocked_methods_count": inner.blocked_methods.len(),
            "blocked_stages_count": inner.blocked_stages.len(),
            "total_executions": inner.records.len(),
            "uptime_seconds": (Utc::now() - inner.start_time).num_milliseconds() as f64 / 1000.0,
        })
    }
}

impl Default for LoopPreventionSystem {
    fn default() -> Self {
        Self::new()
    }
}
