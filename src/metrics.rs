//! # Flow Metrics - Real-Time KPI Collection
//!
//! Thread-safe KPI sink for the flow engine. Ring-buffered per-KPI history,
//! cached snapshot computation, moving-window rates and a threshold observer
//! hook that the alert manager plugs into.
//!
//! Throughput uses the actual observed span rather than dividing by a fixed
//! window, so a burst of completions does not read as a misleading spike.
//! Precedence: wall-clock span (earliest start to latest end or now) when
//! start/end times are available, else the span of observed end times, else
//! the fixed window.

use chrono::{DateTime, Utc};
use metrics::gauge;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::logging::{log_warn, LogCategory};
use crate::Result;

/// Closed set of KPIs sampled by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiType {
    CpuUsage,
    MemoryUsage,
    ExecutionTime,
    SuccessRate,
    CompletionRate,
    RetryRate,
    Throughput,
    ErrorRate,
    QueueSize,
    ResponseTime,
    StageDuration,
    FlowEfficiency,
    ResourceEfficiency,
}

impl KpiType {
    pub const ALL: [KpiType; 13] = [
        KpiType::CpuUsage,
        KpiType::MemoryUsage,
        KpiType::ExecutionTime,
        KpiType::SuccessRate,
        KpiType::CompletionRate,
        KpiType::RetryRate,
        KpiType::Throughput,
        KpiType::ErrorRate,
        KpiType::QueueSize,
        KpiType::ResponseTime,
        KpiType::StageDuration,
        KpiType::FlowEfficiency,
        KpiType::ResourceEfficiency,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            KpiType::CpuUsage => "cpu_usage",
            KpiType::MemoryUsage => "memory_usage",
            KpiType::ExecutionTime => "execution_time",
            KpiType::SuccessRate => "success_rate",
            KpiType::CompletionRate => "completion_rate",
            KpiType::RetryRate => "retry_rate",
            KpiType::Throughput => "throughput",
            KpiType::ErrorRate => "error_rate",
            KpiType::QueueSize => "queue_size",
            KpiType::ResponseTime => "response_time",
            KpiType::StageDuration => "stage_duration",
            KpiType::FlowEfficiency => "flow_efficiency",
            KpiType::ResourceEfficiency => "resource_efficiency",
        }
    }
}

impl std::fmt::Display for KpiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// One metric sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Collector tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// KPI snapshot cache TTL in seconds
    pub cache_duration: f64,
    /// Moving window for rate calculations in seconds
    pub time_window: i64,
    /// Throughput window in seconds
    pub throughput_window: i64,
    /// Ring buffer size per KPI
    pub history_size: usize,
    pub memory_threshold_mb: f64,
    pub cpu_threshold_percent: f64,
    /// Error rate alert threshold (%)
    pub error_rate_threshold: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cache_duration: 1.0,
            time_window: 300,
            throughput_window: 60,
            history_size: 1000,
            memory_threshold_mb: 500.0,
            cpu_threshold_percent: 80.0,
            error_rate_threshold: 10.0,
        }
    }
}

/// Computed KPI snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub avg_execution_time: f64,
    pub p95_execution_time: f64,
    pub p99_execution_time: f64,
    pub success_rate: f64,
    pub completion_rate: f64,
    pub retry_rate: f64,
    pub throughput: f64,
    pub error_rate: f64,
    pub active_flows: usize,
    pub total_executions: u64,
    pub flow_efficiency: f64,
    pub resource_efficiency: f64,
    pub avg_stage_duration: f64,
}

/// Threshold breach observer; the alert manager implements this
pub trait MetricsObserver: Send + Sync {
    fn on_threshold_exceeded(
        &self,
        kpi_type: KpiType,
        value: f64,
        threshold: f64,
        metadata: &HashMap<String, serde_json::Value>,
    );
}

struct FlowRecord {
    start_time: f64,
    end_time: f64,
}

struct MetricsInner {
    metrics: HashMap<KpiType, Vec<MetricDataPoint>>,
    active_flows: HashMap<String, f64>,
    completed_flows: Vec<FlowRecord>,
    failed_flows: Vec<FlowRecord>,
    total_completed_flows: u64,
    total_failed_flows: u64,
    successful_stages: u64,
    total_stages: u64,
    thresholds: HashMap<KpiType, f64>,
    cached_kpis: Option<KpiSnapshot>,
    last_kpi_calculation: f64,
}

/// Thread-safe KPI collection and calculation for flow executions.
pub struct FlowMetrics {
    config: MetricsConfig,
    inner: RwLock<MetricsInner>,
    observers: RwLock<Vec<Arc<dyn MetricsObserver>>>,
}

fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl FlowMetrics {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        let thresholds = HashMap::from([
            (KpiType::MemoryUsage, config.memory_threshold_mb),
            (KpiType::CpuUsage, config.cpu_threshold_percent),
            (KpiType::ErrorRate, config.error_rate_threshold),
        ]);

        let metric_buffers = KpiType::ALL.iter().map(|k| (*k, Vec::new())).collect();

        Self {
            config,
            inner: RwLock::new(MetricsInner {
                metrics: metric_buffers,
                active_flows: HashMap::new(),
                completed_flows: Vec::new(),
                failed_flows: Vec::new(),
                total_completed_flows: 0,
                total_failed_flows: 0,
                successful_stages: 0,
                total_stages: 0,
                thresholds,
                cached_kpis: None,
                last_kpi_calculation: 0.0,
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn MetricsObserver>) {
        self.observers.write().push(observer);
    }

    pub fn set_threshold(&self, kpi_type: KpiType, threshold: f64) {
        self.inner.write().thresholds.insert(kpi_type, threshold);
    }

    /// Record a raw sample for one KPI
    pub fn record(
        &self,
        kpi_type: KpiType,
        value: f64,
        stage: Option<&str>,
        flow_id: Option<&str>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        let breach = {
            let mut inner = self.inner.write();
            Self::push_metric(
                &mut inner,
                self.config.history_size,
                kpi_type,
                value,
                stage,
                flow_id,
                metadata.clone(),
            );
            inner
                .thresholds
                .get(&kpi_type)
                .copied()
                .filter(|threshold| value > *threshold)
        };

        gauge!(format!("flow_kpi_{}", kpi_type.key()), value);

        // Observers run outside the collector lock
        if let Some(threshold) = breach {
            for observer in self.observers.read().iter() {
                observer.on_threshold_exceeded(kpi_type, value, threshold, &metadata);
            }
        }
    }

    /// Record several samples at once
    pub fn record_batch(&self, samples: Vec<(KpiType, f64)>) {
        for (kpi_type, value) in samples {
            self.record(kpi_type, value, None, None, HashMap::new());
        }
    }

    fn push_metric(
        inner: &mut MetricsInner,
        history_size: usize,
        kpi_type: KpiType,
        value: f64,
        stage: Option<&str>,
        flow_id: Option<&str>,
        metadata: HashMap<String, serde_json::Value>,
    ) {
        let buffer = inner.metrics.entry(kpi_type).or_default();
        buffer.push(MetricDataPoint {
            timestamp: Utc::now(),
            value,
            stage: stage.map(str::to_string),
            flow_id: flow_id.map(str::to_string),
            metadata,
        });
        if buffer.len() > history_size {
            let drop_count = buffer.len() - history_size;
            buffer.drain(0..drop_count);
        }
    }

    /// Track the start of a flow run
    pub fn record_flow_start(&self, flow_id: &str, stage: &str) {
        {
            let mut inner = self.inner.write();
            inner.active_flows.insert(flow_id.to_string(), now_epoch());
        }
        self.record(KpiType::Throughput, 1.0, Some(stage), Some(flow_id), HashMap::new());
    }

    /// Track one stage completion inside a run
    pub fn record_stage_completion(
        &self,
        flow_id: &str,
        stage: &str,
        execution_time: f64,
        success: bool,
    ) {
        {
            let mut inner = self.inner.write();
            inner.total_stages += 1;
            if success {
                inner.successful_stages += 1;
            }
        }
        self.record(
            KpiType::ExecutionTime,
            execution_time,
            Some(stage),
            Some(flow_id),
            HashMap::new(),
        );
        self.record(
            KpiType::StageDuration,
            execution_time,
            Some(stage),
            Some(flow_id),
            HashMap::new(),
        );
        self.record(
            KpiType::SuccessRate,
            if success { 1.0 } else { 0.0 },
            Some(stage),
            Some(flow_id),
            HashMap::new(),
        );
    }

    /// Track the end of a flow run
    pub fn record_flow_completion(&self, flow_id: &str, success: bool) {
        let final_stage = if success { "finalized" } else { "failed" };
        {
            let mut inner = self.inner.write();
            let start_time = inner
                .active_flows
                .remove(flow_id)
                .unwrap_or_else(now_epoch);
            let record = FlowRecord {
                start_time,
                end_time: now_epoch(),
            };
            if success {
                inner.total_completed_flows += 1;
                inner.completed_flows.push(record);
            } else {
                inner.total_failed_flows += 1;
                inner.failed_flows.push(record);
            }
            Self::cleanup_flow_history(&mut inner, self.config.history_size);
        }

        self.record(
            KpiType::CompletionRate,
            if success { 1.0 } else { 0.0 },
            Some(final_stage),
            Some(flow_id),
            HashMap::new(),
        );
        self.record(
            KpiType::ErrorRate,
            if success { 0.0 } else { 1.0 },
            Some(final_stage),
            Some(flow_id),
            HashMap::new(),
        );
    }

    pub fn record_retry(&self, flow_id: &str, stage: &str, retry_count: u32) {
        self.record(
            KpiType::RetryRate,
            retry_count as f64,
            Some(stage),
            Some(flow_id),
            HashMap::new(),
        );
    }

    /// Sample process CPU% and RSS via sysinfo
    pub fn record_system_metrics(&self) {
        use std::sync::OnceLock;

        static SYSTEM: OnceLock<std::sync::Mutex<sysinfo::System>> = OnceLock::new();

        let system = SYSTEM.get_or_init(|| {
            let mut sys = sysinfo::System::new_all();
            sys.refresh_cpu();
            sys.refresh_memory();
            std::sync::Mutex::new(sys)
        });

        let (cpu_percent, memory_mb) = match system.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                let cpu = sys.global_cpu_info().cpu_usage() as f64;
                let mem = sys.used_memory() as f64 / 1024.0 / 1024.0;
                (cpu, mem)
            }
            Err(_) => {
                log_warn(LogCategory::Metrics, "System sampling unavailable");
                return;
            }
        };

        let queue_size = self.inner.read().active_flows.len() as f64;

        self.record(KpiType::CpuUsage, cpu_percent, None, None, HashMap::new());
        self.record(KpiType::MemoryUsage, memory_mb, None, None, HashMap::new());
        self.record(KpiType::QueueSize, queue_size, None, None, HashMap::new());
    }

    /// Current KPI snapshot with caching (default 1 s TTL). Zero samples in
    /// the window produce zeros, never errors.
    pub fn get_current_kpis(&self, force_recalculate: bool) -> KpiSnapshot {
        let current_time = now_epoch();

        if !force_recalculate {
            let inner = self.inner.read();
            if let Some(cached) = &inner.cached_kpis {
                if current_time - inner.last_kpi_calculation < self.config.cache_duration {
                    return cached.clone();
                }
            }
        }

        let inner = self.inner.read();
        let window = self.config.time_window;

        let cpu_usage = Self::calculate_kpi(&inner, KpiType::CpuUsage, window);
        let memory_usage = Self::calculate_kpi(&inner, KpiType::MemoryUsage, window);
        let throughput = Self::calculate_throughput(&inner, self.config.throughput_window);
        let (p95, p99) = Self::execution_percentiles(&inner, window);

        let flow_efficiency = if inner.total_stages > 0 {
            inner.successful_stages as f64 / inner.total_stages as f64
        } else {
            0.0
        };

        let denominator = (cpu_usage / 100.0 + memory_usage / 1024.0) / 2.0;
        let resource_efficiency = if denominator > 0.0 {
            throughput / denominator
        } else {
            0.0
        };

        let snapshot = KpiSnapshot {
            timestamp: Utc::now(),
            cpu_usage,
            memory_usage,
            avg_execution_time: Self::calculate_kpi(&inner, KpiType::ExecutionTime, window),
            p95_execution_time: p95,
            p99_execution_time: p99,
            success_rate: Self::calculate_kpi(&inner, KpiType::SuccessRate, window) * 100.0,
            completion_rate: Self::calculate_kpi(&inner, KpiType::CompletionRate, window) * 100.0,
            retry_rate: Self::calculate_kpi(&inner, KpiType::RetryRate, window),
            throughput,
            error_rate: Self::calculate_kpi(&inner, KpiType::ErrorRate, window) * 100.0,
            active_flows: inner.active_flows.len(),
            total_executions: inner.total_completed_flows + inner.total_failed_flows,
            flow_efficiency,
            resource_efficiency,
            avg_stage_duration: Self::calculate_kpi(&inner, KpiType::StageDuration, window),
        };
        drop(inner);

        let mut inner = self.inner.write();
        inner.cached_kpis = Some(snapshot.clone());
        inner.last_kpi_calculation = current_time;

        snapshot
    }

    fn calculate_kpi(inner: &MetricsInner, kpi_type: KpiType, window_seconds: i64) -> f64 {
        let buffer = match inner.metrics.get(&kpi_type) {
            Some(buffer) if !buffer.is_empty() => buffer,
            _ => return 0.0,
        };

        let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds);
        let recent: Vec<f64> = buffer
            .iter()
            .filter(|m| m.timestamp > cutoff)
            .map(|m| m.value)
            .collect();

        if recent.is_empty() {
            return 0.0;
        }

        match kpi_type {
            // Latest value for resource metrics
            KpiType::CpuUsage | KpiType::MemoryUsage | KpiType::QueueSize => {
                *recent.last().unwrap()
            }
            // Mean for rates and everything else
            _ => recent.iter().sum::<f64>() / recent.len() as f64,
        }
    }

    /// Throughput in executions per second. Precedence: wall-clock span,
    /// then actual span of end times, then the fixed window.
    fn calculate_throughput(inner: &MetricsInner, window_seconds: i64) -> f64 {
        let cutoff = now_epoch() - window_seconds as f64;

        let recent: Vec<&FlowRecord> = inner
            .completed_flows
            .iter()
            .chain(inner.failed_flows.iter())
            .filter(|f| f.end_time > cutoff)
            .collect();

        let total = recent.len();
        if total == 0 {
            return 0.0;
        }

        // Preferred: wall-clock span from the earliest start to the later of
        // the latest end and now
        let earliest_start = recent
            .iter()
            .map(|f| f.start_time)
            .fold(f64::INFINITY, f64::min);
        let latest_end = recent
            .iter()
            .map(|f| f.end_time)
            .fold(f64::NEG_INFINITY, f64::max);

        if earliest_start.is_finite() {
            let wall_clock = latest_end.max(now_epoch()) - earliest_start;
            if wall_clock > 0.0 {
                return total as f64 / wall_clock;
            }
        }

        // Next: actual span of observed end times
        let earliest_end = recent
            .iter()
            .map(|f| f.end_time)
            .fold(f64::INFINITY, f64::min);
        let span = latest_end - earliest_end;
        if span > 0.0 {
            if total > 1 {
                return (total - 1) as f64 / span;
            }
            return total as f64 / span;
        }

        // Last resort: the fixed window
        total as f64 / window_seconds as f64
    }

    fn execution_percentiles(inner: &MetricsInner, window_seconds: i64) -> (f64, f64) {
        let buffer = match inner.metrics.get(&KpiType::ExecutionTime) {
            Some(buffer) if !buffer.is_empty() => buffer,
            _ => return (0.0, 0.0),
        };

        let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds);
        let mut values: Vec<f64> = buffer
            .iter()
            .filter(|m| m.timestamp > cutoff)
            .map(|m| m.value)
            .collect();

        if values.is_empty() {
            return (0.0, 0.0);
        }

        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: f64| -> f64 {
            let index = ((values.len() as f64 * p) as usize).min(values.len() - 1);
            values[index]
        };
        (percentile(0.95), percentile(0.99))
    }

    fn cleanup_flow_history(inner: &mut MetricsInner, history_size: usize) {
        let max_completed = history_size / 2;
        let max_failed = history_size / 4;

        if inner.completed_flows.len() > max_completed {
            let drop_count = inner.completed_flows.len() - max_completed;
            inner.completed_flows.drain(0..drop_count);
        }
        if inner.failed_flows.len() > max_failed {
            let drop_count = inner.failed_flows.len() - max_failed;
            inner.failed_flows.drain(0..drop_count);
        }
    }

    /// Samples for one KPI within a window, newest last
    pub fn get_detailed_metrics(
        &self,
        kpi_type: KpiType,
        window_seconds: i64,
    ) -> Vec<MetricDataPoint> {
        let inner = self.inner.read();
        let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds);
        inner
            .metrics
            .get(&kpi_type)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|m| m.timestamp > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// High-level flow counters
    pub fn flow_summary(&self) -> serde_json::Value {
        let inner = self.inner.read();
        serde_json::json!({
            "active_flows": inner.active_flows.keys().collect::<Vec<_>>(),
            "total_completed": inner.total_completed_flows,
            "total_failed": inner.total_failed_flows,
            "successful_stages": inner.successful_stages,
            "total_stages": inner.total_stages,
        })
    }
}

impl Default for FlowMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder for the `metrics` facade. Returns the
/// handle to render scrapes from; safe to call once per process.
pub fn install_prometheus_recorder() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::FlowError::Configuration(format!("prometheus recorder: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_window_yields_zero_snapshot() {
        let metrics = FlowMetrics::new();
        let snapshot = metrics.get_current_kpis(true);
        assert_eq!(snapshot.avg_execution_time, 0.0);
        assert_eq!(snapshot.success_rate, 0.0);
        assert_eq!(snapshot.throughput, 0.0);
        assert_eq!(snapshot.active_flows, 0);
        assert_eq!(snapshot.total_executions, 0);
    }

    #[test]
    fn test_stage_completion_rates() {
        let metrics = FlowMetrics::new();
        metrics.record_flow_start("flow-1", "input_validation");
        metrics.record_stage_completion("flow-1", "draft_generation", 1.5, true);
        metrics.record_stage_completion("flow-1", "style_validation", 0.5, false);

        let snapshot = metrics.get_current_kpis(true);
        assert!((snapshot.success_rate - 50.0).abs() < 1e-9);
        assert!((snapshot.avg_execution_time - 1.0).abs() < 1e-9);
        assert!((snapshot.flow_efficiency - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_single_completion_throughput_is_finite() {
        let metrics = FlowMetrics::new();
        metrics.record_flow_start("flow-1", "input_validation");
        metrics.record_flow_completion("flow-1", true);

        let snapshot = metrics.get_current_kpis(true);
        assert!(snapshot.throughput.is_finite());
        assert!(snapshot.throughput >= 0.0);
        assert_eq!(snapshot.total_executions, 1);
    }

    #[test]
    fn test_queue_size_tracks_active_flows() {
        let metrics = FlowMetrics::new();
        metrics.record_flow_start("flow-1", "input_validation");
        metrics.record_flow_start("flow-2", "input_validation");

        let snapshot = metrics.get_current_kpis(true);
        assert_eq!(snapshot.active_flows, 2);

        metrics.record_flow_completion("flow-1", true);
        let snapshot = metrics.get_current_kpis(true);
        assert_eq!(snapshot.active_flows, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = FlowMetrics::with_config(MetricsConfig {
            history_size: 10,
            ..MetricsConfig::default()
        });

        for i in 0..50 {
            metrics.record(KpiType::ResponseTime, i as f64, None, None, HashMap::new());
        }

        let points = metrics.get_detailed_metrics(KpiType::ResponseTime, 3600);
        assert_eq!(points.len(), 10);
        assert_eq!(points.last().unwrap().value, 49.0);
    }

    #[test]
    fn test_snapshot_cache() {
        let metrics = FlowMetrics::new();
        let first = metrics.get_current_kpis(false);
        metrics.record_stage_completion("flow-1", "draft_generation", 5.0, true);
        // Cached within the TTL
        let second = metrics.get_current_kpis(false);
        assert_eq!(first.avg_execution_time, second.avg_execution_time);
        // Forced recalculation sees the new sample
        let third = metrics.get_current_kpis(true);
        assert!((third.avg_execution_time - 5.0).abs() < 1e-9);
    }

    struct CountingObserver {
        breaches: AtomicUsize,
    }

    impl MetricsObserver for CountingObserver {
        fn on_threshold_exceeded(
            &self,
            _kpi_type: KpiType,
            _value: f64,
            _threshold: f64,
            _metadata: &HashMap<String, serde_json::Value>,
        ) {
            self.breaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_threshold_observer_notified() {
        let metrics = FlowMetrics::new();
        let observer = Arc::new(CountingObserver {
            breaches: AtomicUsize::new(0),
        });
        metrics.add_observer(observer.clone());
        metrics.set_threshold(KpiType::ResponseTime, 100.0);

        metrics.record(KpiType::ResponseTime, 50.0, None, None, HashMap::new());
        assert_eq!(observer.breaches.load(Ordering::SeqCst), 0);

        metrics.record(KpiType::ResponseTime, 250.0, None, None, HashMap::new());
        assert_eq!(observer.breaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prometheus_recorder_install_and_render() {
        let handle = install_prometheus_recorder().unwrap();
        let metrics = FlowMetrics::new();
        metrics.record(KpiType::QueueSize, 3.0, None, None, HashMap::new());
        assert!(handle.render().contains("flow_kpi_queue_size"));
    }

    #[test]
    fn test_metric_record_serialization_round_trip() {
        let point = MetricDataPoint {
            timestamp: Utc::now(),
            value: 3.25,
            stage: Some("draft_generation".to_string()),
            flow_id: Some("flow-1".to_string()),
            metadata: HashMap::from([(
                "attempt".to_string(),
                serde_json::Value::from(2),
            )]),
        };
        let json = serde_json::to_string(&point).unwrap();
        let parsed: MetricDataPoint = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, rejson);
    }
}
