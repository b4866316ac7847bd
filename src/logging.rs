//! # Structured Logging - Flow Engine Observability Surface
//!
//! Structured logging with audit trails and performance timing for the flow
//! execution engine. Every engine component logs through the same
//! category-tagged entry point so transitions, retries, breaker trips and
//! review decisions end up in one correlated stream.

use dashmap::DashMap;
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{FlowError, Result};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Global logger instance with safe initialization
pub static LOGGER: Lazy<Arc<FlowLogger>> = Lazy::new(|| {
    let config = LoggingConfig {
        console_enabled: false,
        file_enabled: true,
        ..LoggingConfig::default()
    };

    match FlowLogger::with_config(config) {
        Ok(logger) => Arc::new(logger),
        Err(_) => Arc::new(FlowLogger::new_minimal()),
    }
});

/// Log levels for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            // tracing has no CRITICAL level
            LogLevel::Error | LogLevel::Critical => Level::ERROR,
        }
    }
}

/// Log categories for the flow engine's structured stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    /// Run lifecycle: initialize, finalize, failure
    Flow,
    /// Stage execution start/completion
    Stage,
    /// Accepted and rejected transitions
    Transition,
    /// Retry scheduling and backoff
    Retry,
    /// Circuit breaker state changes
    Breaker,
    /// Loop prevention counters and pattern detection
    LoopGuard,
    /// KPI collection and snapshots
    Metrics,
    /// Alert lifecycle and notification dispatch
    Alert,
    /// Checkpoints, recovery, archival
    Persistence,
    /// Human review requests and decisions
    Review,
    /// Knowledge adapter queries
    Knowledge,
    /// Engine startup, shutdown, configuration
    System,
    /// Audit trail events
    Audit,
    /// Error events
    Error,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogCategory::Flow => "flow",
            LogCategory::Stage => "stage",
            LogCategory::Transition => "transition",
            LogCategory::Retry => "retry",
            LogCategory::Breaker => "breaker",
            LogCategory::LoopGuard => "loop_guard",
            LogCategory::Metrics => "metrics",
            LogCategory::Alert => "alert",
            LogCategory::Persistence => "persistence",
            LogCategory::Review => "review",
            LogCategory::Knowledge => "knowledge",
            LogCategory::System => "system",
            LogCategory::Audit => "audit",
            LogCategory::Error => "error",
        };
        f.write_str(name)
    }
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    /// Additional structured data
    pub data: serde_json::Value,
    /// Flow run correlation id
    pub flow_id: Option<String>,
    /// Operation duration in milliseconds
    pub duration_ms: Option<u64>,
}

/// Logging throughput metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMetrics {
    pub total_entries: u64,
    pub entries_by_level: std::collections::HashMap<String, u64>,
    pub entries_by_category: std::collections::HashMap<String, u64>,
    pub avg_processing_time_ms: f64,
    pub error_rate: f64,
}

/// Configuration for engine logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub min_level: LogLevel,
    pub console_enabled: bool,
    pub file_enabled: bool,
    pub log_dir: String,
    pub rotation: LogRotation,
    /// Emit JSON-formatted entries
    pub json_format: bool,
    /// Record per-entry processing histograms
    pub performance_monitoring: bool,
    pub audit_enabled: bool,
    /// Audit buffer cap; oldest 10% dropped when exceeded
    pub audit_buffer_size: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            console_enabled: true,
            file_enabled: true,
            log_dir: "./logs".to_string(),
            rotation: LogRotation::Daily,
            json_format: true,
            performance_monitoring: true,
            audit_enabled: true,
            audit_buffer_size: 10_000,
        }
    }
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRotation {
    Never,
    Hourly,
    Daily,
}

/// Flow engine logging system
pub struct FlowLogger {
    config: LoggingConfig,
    metrics: Arc<RwLock<LoggingMetrics>>,
    category_counters: Arc<DashMap<LogCategory, u64>>,
    recent_timings: Arc<RwLock<Vec<Duration>>>,
    audit_buffer: Arc<RwLock<Vec<LogEntry>>>,
    init_time: Instant,
}

impl FlowLogger {
    pub fn new() -> Result<Self> {
        Self::with_config(LoggingConfig::default())
    }

    /// Create a minimal logger that doesn't initialize tracing (fallback)
    pub fn new_minimal() -> Self {
        Self {
            config: LoggingConfig {
                console_enabled: false,
                file_enabled: false,
                ..LoggingConfig::default()
            },
            metrics: Arc::new(RwLock::new(Self::empty_metrics())),
            category_counters: Arc::new(DashMap::new()),
            recent_timings: Arc::new(RwLock::new(Vec::with_capacity(1000))),
            audit_buffer: Arc::new(RwLock::new(Vec::new())),
            init_time: Instant::now(),
        }
    }

    /// Create logger with custom configuration
    pub fn with_config(config: LoggingConfig) -> Result<Self> {
        if config.file_enabled {
            fs::create_dir_all(&config.log_dir).map_err(|e| {
                FlowError::Configuration(format!("Failed to create log directory: {e}"))
            })?;
        }

        Self::init_tracing(&config)?;

        let logger = Self {
            config,
            metrics: Arc::new(RwLock::new(Self::empty_metrics())),
            category_counters: Arc::new(DashMap::new()),
            recent_timings: Arc::new(RwLock::new(Vec::with_capacity(1000))),
            audit_buffer: Arc::new(RwLock::new(Vec::new())),
            init_time: Instant::now(),
        };

        info!(
            category = %LogCategory::System,
            "Flow logger initialized with config: {:?}",
            logger.config
        );

        Ok(logger)
    }

    fn empty_metrics() -> LoggingMetrics {
        LoggingMetrics {
            total_entries: 0,
            entries_by_level: std::collections::HashMap::new(),
            entries_by_category: std::collections::HashMap::new(),
            avg_processing_time_ms: 0.0,
            error_rate: 0.0,
        }
    }

    /// Initialize tracing subscriber (thread-safe, can be called multiple times)
    fn init_tracing(config: &LoggingConfig) -> Result<()> {
        if TRACING_INITIALIZED
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Ok(());
        }

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Self::level_to_string(config.min_level)));

        let mut layers = Vec::new();

        if config.console_enabled {
            let console_layer = fmt::layer().with_target(true).with_thread_ids(true);
            if config.json_format {
                layers.push(console_layer.json().boxed());
            } else {
                layers.push(console_layer.pretty().boxed());
            }
        }

        if config.file_enabled {
            let file_appender = match config.rotation {
                LogRotation::Daily => rolling::daily(&config.log_dir, "engine.log"),
                LogRotation::Hourly => rolling::hourly(&config.log_dir, "engine.log"),
                LogRotation::Never => rolling::never(&config.log_dir, "engine.log"),
            };

            let (non_blocking, _guard) = non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            if config.json_format {
                layers.push(file_layer.json().boxed());
            } else {
                layers.push(file_layer.boxed());
            }
        }

        match tracing_subscriber::registry()
            .with(env_filter)
            .with(layers)
            .try_init()
        {
            Ok(()) => Ok(()),
            Err(_) => {
                // Another subscriber got there first; keep going
                TRACING_INITIALIZED.store(false, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn level_to_string(level: LogLevel) -> &'static str {
        match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }

    /// Log a structured entry
    pub fn log(&self, entry: LogEntry) {
        let start_time = Instant::now();

        self.update_metrics(&entry);

        if self.config.audit_enabled
            && matches!(entry.category, LogCategory::Audit | LogCategory::Review)
        {
            let mut audit_buffer = self.audit_buffer.write();
            audit_buffer.push(entry.clone());
            if audit_buffer.len() > self.config.audit_buffer_size {
                let drop_count = self.config.audit_buffer_size / 10;
                audit_buffer.drain(0..drop_count);
            }
        }

        if entry.level < self.config.min_level {
            return;
        }

        let level: Level = entry.level.into();
        let category = entry.category.to_string();

        match level {
            Level::TRACE => trace!(
                category = category,
                flow_id = entry.flow_id,
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::DEBUG => debug!(
                category = category,
                flow_id = entry.flow_id,
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::INFO => info!(
                category = category,
                flow_id = entry.flow_id,
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::WARN => warn!(
                category = category,
                flow_id = entry.flow_id,
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
            Level::ERROR => error!(
                category = category,
                flow_id = entry.flow_id,
                duration_ms = entry.duration_ms,
                data = ?entry.data,
                "{}",
                entry.message
            ),
        }

        let processing_time = start_time.elapsed();
        let mut timings = self.recent_timings.write();
        timings.push(processing_time);
        if timings.len() > 1000 {
            timings.drain(0..100);
        }
        drop(timings);

        if self.config.performance_monitoring {
            histogram!(
                "flow_log_processing_time_ms",
                processing_time.as_millis() as f64
            );
            counter!("flow_log_entries_total", 1,
                "category" => category, "level" => Self::level_to_string(entry.level));
        }
    }

    fn update_metrics(&self, entry: &LogEntry) {
        let mut metrics = self.metrics.write();
        metrics.total_entries += 1;

        let level_key = Self::level_to_string(entry.level).to_string();
        *metrics.entries_by_level.entry(level_key).or_insert(0) += 1;

        let category_key = entry.category.to_string();
        *metrics
            .entries_by_category
            .entry(category_key)
            .or_insert(0) += 1;

        *self
            .category_counters
            .entry(entry.category.clone())
            .or_insert(0) += 1;

        let error_count = metrics.entries_by_level.get("error").copied().unwrap_or(0);
        metrics.error_rate = if metrics.total_entries > 0 {
            (error_count as f64 / metrics.total_entries as f64) * 100.0
        } else {
            0.0
        };

        let timings = self.recent_timings.read();
        if !timings.is_empty() {
            let total_time: Duration = timings.iter().sum();
            metrics.avg_processing_time_ms = total_time.as_millis() as f64 / timings.len() as f64;
        }
    }

    pub fn get_metrics(&self) -> LoggingMetrics {
        self.metrics.read().clone()
    }

    pub fn get_audit_trail(&self) -> Vec<LogEntry> {
        self.audit_buffer.read().clone()
    }

    pub fn clear_audit_trail(&self) {
        self.audit_buffer.write().clear();
    }

    /// Uptime and throughput report for health endpoints
    pub fn get_performance_report(&self) -> serde_json::Value {
        let metrics = self.get_metrics();
        let uptime = self.init_time.elapsed();

        serde_json::json!({
            "uptime_seconds": uptime.as_secs(),
            "total_entries": metrics.total_entries,
            "error_rate_percent": metrics.error_rate,
            "avg_processing_time_ms": metrics.avg_processing_time_ms,
            "entries_by_level": metrics.entries_by_level,
            "entries_by_category": metrics.entries_by_category,
        })
    }
}

fn make_entry(level: LogLevel, category: LogCategory, message: &str) -> LogEntry {
    LogEntry {
        timestamp: chrono::Utc::now(),
        level,
        category,
        message: message.to_string(),
        data: serde_json::Value::Null,
        flow_id: None,
        duration_ms: None,
    }
}

/// Global logging helpers
pub fn log_debug(category: LogCategory, message: &str) {
    LOGGER.log(make_entry(LogLevel::Debug, category, message));
}

pub fn log_info(category: LogCategory, message: &str) {
    LOGGER.log(make_entry(LogLevel::Info, category, message));
}

pub fn log_warn(category: LogCategory, message: &str) {
    LOGGER.log(make_entry(LogLevel::Warn, category, message));
}

pub fn log_error(category: LogCategory, message: &str) {
    LOGGER.log(make_entry(LogLevel::Error, category, message));
}

pub fn log_audit(message: &str, data: serde_json::Value) {
    LOGGER.log(LogEntry {
        timestamp: chrono::Utc::now(),
        level: LogLevel::Info,
        category: LogCategory::Audit,
        message: message.to_string(),
        data,
        flow_id: None,
        duration_ms: None,
    });
}

/// Log a flow-correlated event with structured payload
pub fn log_flow_event(category: LogCategory, flow_id: &str, message: &str, data: serde_json::Value) {
    LOGGER.log(LogEntry {
        timestamp: chrono::Utc::now(),
        level: LogLevel::Info,
        category,
        message: message.to_string(),
        data,
        flow_id: Some(flow_id.to_string()),
        duration_ms: None,
    });
}

/// Performance measurement helper
pub struct PerformanceTimer {
    start_time: Instant,
    category: LogCategory,
    operation: String,
    flow_id: Option<String>,
}

impl PerformanceTimer {
    pub fn start(category: LogCategory, operation: &str) -> Self {
        Self {
            start_time: Instant::now(),
            category,
            operation: operation.to_string(),
            flow_id: None,
        }
    }

    pub fn start_for_flow(category: LogCategory, operation: &str, flow_id: String) -> Self {
        Self {
            start_time: Instant::now(),
            category,
            operation: operation.to_string(),
            flow_id: Some(flow_id),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finish the timer and log the result
    pub fn finish(self) {
        let duration = self.start_time.elapsed();
        let duration_ms = duration.as_millis() as u64;

        LOGGER.log(LogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Info,
            category: self.category.clone(),
            message: format!("Operation '{}' completed", self.operation),
            data: serde_json::json!({
                "operation": self.operation,
                "duration_ms": duration_ms
            }),
            flow_id: self.flow_id,
            duration_ms: Some(duration_ms),
        });

        if LOGGER.config.performance_monitoring {
            histogram!("flow_operation_duration_ms", duration_ms as f64,
                "operation" => self.operation, "category" => self.category.to_string());
        }
    }
}
