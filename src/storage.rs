//! # Metrics Storage - Durable KPI History
//!
//! Buffered, backend-agnostic persistence for metric samples. Writes are
//! batched (by count or by a periodic background flush) and rollups are
//! computed into aggregation buckets anchored to the earliest observed
//! sample rather than wall-clock boundaries; resumed aggregation continues
//! from the bucket after the last aggregated one.
//!
//! Two interchangeable backends ship with the engine: a per-day JSON file
//! backend (`metrics_YYYY-MM-DD.json`) and an in-memory backend for tests
//! and short-lived tooling.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::logging::{log_error, log_info, LogCategory};
use crate::metrics::KpiType;
use crate::{FlowError, Result};

/// Storage tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub storage_path: PathBuf,
    pub retention_days: i64,
    /// Buffered records before an eager flush
    pub batch_size: usize,
    /// Background flush cadence
    pub flush_interval_seconds: u64,
    /// Rollup intervals in seconds (1 hour and 1 day by default)
    pub aggregation_intervals: Vec<i64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("metrics_storage"),
            retention_days: 90,
            batch_size: 1000,
            flush_interval_seconds: 300,
            aggregation_intervals: vec![3600, 86_400],
        }
    }
}

/// One durable metric sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    pub kpi_type: KpiType,
    pub value: f64,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One rollup bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMetric {
    /// Bucket start
    pub timestamp: DateTime<Utc>,
    pub kpi_type: KpiType,
    pub interval_seconds: i64,
    pub count: usize,
    pub min_value: f64,
    pub max_value: f64,
    pub avg_value: f64,
    pub sum_value: f64,
    pub p95_value: f64,
    pub p99_value: f64,
}

fn aggregate_bucket(
    kpi_type: KpiType,
    bucket_start: DateTime<Utc>,
    interval_seconds: i64,
    values: &[f64],
) -> AggregatedMetric {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let percentile = |p: f64| -> f64 {
        if sorted.len() > 1 {
            sorted[((p * sorted.len() as f64) as usize).min(sorted.len() - 1)]
        } else {
            sorted[0]
        }
    };

    AggregatedMetric {
        timestamp: bucket_start,
        kpi_type,
        interval_seconds,
        count: values.len(),
        min_value: sorted[0],
        max_value: sorted[sorted.len() - 1],
        avg_value: values.iter().sum::<f64>() / values.len() as f64,
        sum_value: values.iter().sum(),
        p95_value: percentile(0.95),
        p99_value: percentile(0.99),
    }
}

/// Backend contract: raw batches in, windows and rollups out
pub trait StorageBackend: Send + Sync {
    fn store_metrics(&self, metrics: &[MetricRecord]) -> Result<()>;

    fn query_metrics(
        &self,
        kpi_type: KpiType,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MetricRecord>>;

    /// Persisted rollups within the window
    fn get_aggregated_metrics(
        &self,
        kpi_type: KpiType,
        interval_seconds: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<AggregatedMetric>>;

    /// Roll raw samples into buckets. Buckets are anchored to the earliest
    /// sample per KPI; a resumed run continues from the bucket after the
    /// last aggregated one. Returns the number of buckets written.
    fn aggregate_raw_metrics(&self, interval_seconds: i64) -> Result<usize>;

    /// Remove raw and aggregated data older than the cutoff; returns the
    /// number of removed records (files count their contained records)
    fn cleanup_old_data(&self, retention_days: i64) -> Result<usize>;

    fn storage_stats(&self) -> serde_json::Value;
}

/// Per-day JSON file backend (`metrics_YYYY-MM-DD.json`). Rollups land in
/// `aggregated_<interval>.json` alongside the raw files.
pub struct FileStorageBackend {
    storage_path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorageBackend {
    pub fn new(storage_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_path).map_err(|e| {
            FlowError::Persistence(format!("failed to create metrics storage dir: {e}"))
        })?;
        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.storage_path
            .join(format!("metrics_{}.json", date.format("%Y-%m-%d")))
    }

    fn aggregated_file(&self, interval_seconds: i64) -> PathBuf {
        self.storage_path
            .join(format!("aggregated_{interval_seconds}.json"))
    }

    fn load_records(path: &Path) -> Vec<MetricRecord> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn save_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
        let contents = serde_json::to_string(data)
            .map_err(|e| FlowError::Persistence(format!("metrics serialization failed: {e}")))?;
        std::fs::write(path, contents)
            .map_err(|e| FlowError::Persistence(format!("metrics write failed: {e}")))
    }

    fn load_aggregates(path: &Path) -> Vec<AggregatedMetric> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn all_raw_records(&self) -> Vec<MetricRecord> {
        let mut records = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.storage_path) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("metrics_") && name.ends_with(".json") {
                    records.extend(Self::load_records(&entry.path()));
                }
            }
        }
        records.sort_by_key(|r| r.timestamp);
        records
    }
}

impl StorageBackend for FileStorageBackend {
    fn store_metrics(&self, metrics: &[MetricRecord]) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut by_date: HashMap<NaiveDate, Vec<&MetricRecord>> = HashMap::new();
        for metric in metrics {
            by_date
                .entry(metric.timestamp.date_naive())
                .or_default()
                .push(metric);
        }

        let _guard = self.lock.lock();
        for (date, day_metrics) in by_date {
            let path = self.day_file(date);
            let mut existing = Self::load_records(&path);
            existing.extend(day_metrics.into_iter().cloned());
            Self::save_json(&path, &existing)?;
        }
        Ok(())
    }

    fn query_metrics(
        &self,
        kpi_type: KpiType,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MetricRecord>> {
        let _guard = self.lock.lock();

        let mut metrics = Vec::new();
        let mut current_date = start_time.date_naive();
        let end_date = end_time.date_naive();

        while current_date <= end_date {
            let path = self.day_file(current_date);
            if path.exists() {
                for record in Self::load_records(&path) {
                    if record.kpi_type == kpi_type
                        && record.timestamp >= start_time
                        && record.timestamp <= end_time
                    {
                        metrics.push(record);
                    }
                }
            }
            current_date = current_date
                .succ_opt()
                .ok_or_else(|| FlowError::Persistence("date overflow".to_string()))?;
        }

        // Newest first
        metrics.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            metrics.truncate(limit);
        }
        Ok(metrics)
    }

    fn get_aggregated_metrics(
        &self,
        kpi_type: KpiType,
        interval_seconds: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<AggregatedMetric>> {
        let path = self.aggregated_file(interval_seconds);
        let _guard = self.lock.lock();
        Ok(Self::load_aggregates(&path)
            .into_iter()
            .filter(|a| {
                a.kpi_type == kpi_type && a.timestamp >= start_time && a.timestamp <= end_time
            })
            .collect())
    }

    fn aggregate_raw_metrics(&self, interval_seconds: i64) -> Result<usize> {
        let _guard = self.lock.lock();

        let path = self.aggregated_file(interval_seconds);
        let mut aggregates = Self::load_aggregates(&path);
        let raw = self.all_raw_records();
        if raw.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        let now = Utc::now();

        for kpi_type in KpiType::ALL {
            let samples: Vec<&MetricRecord> =
                raw.iter().filter(|r| r.kpi_type == kpi_type).collect();
            if samples.is_empty() {
                continue;
            }

            // Resume from the bucket after the last aggregated one for this
            // KPI; otherwise anchor at the first raw sample
            let last_aggregated = aggregates
                .iter()
                .filter(|a| a.kpi_type == kpi_type)
                .map(|a| a.timestamp)
                .max();

            let mut bucket_start = match last_aggregated {
                Some(last) => last + ChronoDuration::seconds(interval_seconds),
                None => samples[0].timestamp,
            };
            let max_ts = samples[samples.len() - 1].timestamp;

            while bucket_start <= max_ts && bucket_start <= now {
                let bucket_end = bucket_start + ChronoDuration::seconds(interval_seconds);
                let values: Vec<f64> = samples
                    .iter()
                    .filter(|r| r.timestamp >= bucket_start && r.timestamp < bucket_end)
                    .map(|r| r.value)
                    .collect();

                if !values.is_empty() {
                    aggregates.push(aggregate_bucket(
                        kpi_type,
                        bucket_start,
                        interval_seconds,
                        &values,
                    ));
                    written += 1;
                }
                bucket_start = bucket_end;
            }
        }

        if written > 0 {
            Self::save_json(&path, &aggregates)?;
        }
        Ok(written)
    }

    fn cleanup_old_data(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let cutoff_date = cutoff.date_naive();
        let _guard = self.lock.lock();

        let mut removed = 0usize;
        if let Ok(entries) = std::fs::read_dir(&self.storage_path) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(date_part) = name
                    .strip_prefix("metrics_")
                    .and_then(|s| s.strip_suffix(".json"))
                else {
                    continue;
                };
                if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
                    if date < cutoff_date {
                        let record_count = Self::load_records(&entry.path()).len();
                        if std::fs::remove_file(entry.path()).is_ok() {
                            removed += record_count;
                        }
                    }
                }
            }
        }

        // Trim aggregated rollups past retention as well
        if let Ok(entries) = std::fs::read_dir(&self.storage_path) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("aggregated_") && name.ends_with(".json") {
                    let mut aggregates = Self::load_aggregates(&entry.path());
                    let before = aggregates.len();
                    aggregates.retain(|a| a.timestamp >= cutoff);
                    if aggregates.len() != before {
                        removed += before - aggregates.len();
                        let _ = Self::save_json(&entry.path(), &aggregates);
                    }
                }
            }
        }

        Ok(removed)
    }

    fn storage_stats(&self) -> serde_json::Value {
        let _guard = self.lock.lock();
        let mut file_count = 0usize;
        let mut total_bytes = 0u64;
        if let Ok(entries) = std::fs::read_dir(&self.storage_path) {
            for entry in entries.flatten() {
                file_count += 1;
                if let Ok(meta) = entry.metadata() {
                    total_bytes += meta.len();
                }
            }
        }
        serde_json::json!({
            "backend": "file",
            "path": self.storage_path,
            "files": file_count,
            "total_bytes": total_bytes,
        })
    }
}

/// In-memory backend for tests and short-lived tooling
pub struct MemoryStorageBackend {
    records: Mutex<Vec<MetricRecord>>,
    aggregates: Mutex<Vec<AggregatedMetric>>,
}

impl MemoryStorageBackend {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            aggregates: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryStorageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorageBackend {
    fn store_metrics(&self, metrics: &[MetricRecord]) -> Result<()> {
        self.records.lock().extend(metrics.iter().cloned());
        Ok(())
    }

    fn query_metrics(
        &self,
        kpi_type: KpiType,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MetricRecord>> {
        let mut metrics: Vec<MetricRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| {
                r.kpi_type == kpi_type && r.timestamp >= start_time && r.timestamp <= end_time
            })
            .cloned()
            .collect();
        metrics.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            metrics.truncate(limit);
        }
        Ok(metrics)
    }

    fn get_aggregated_metrics(
        &self,
        kpi_type: KpiType,
        interval_seconds: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Vec<AggregatedMetric>> {
        Ok(self
            .aggregates
            .lock()
            .iter()
            .filter(|a| {
                a.kpi_type == kpi_type
                    && a.interval_seconds == interval_seconds
                    && a.timestamp >= start_time
                    && a.timestamp <= end_time
            })
            .cloned()
            .collect())
    }

    fn aggregate_raw_metrics(&self, interval_seconds: i64) -> Result<usize> {
        let records = self.records.lock().clone();
        if records.is_empty() {
            return Ok(0);
        }
        let mut aggregates = self.aggregates.lock();
        let mut written = 0usize;
        let now = Utc::now();

        for kpi_type in KpiType::ALL {
            let mut samples: Vec<&MetricRecord> =
                records.iter().filter(|r| r.kpi_type == kpi_type).collect();
            if samples.is_empty() {
                continue;
            }
            samples.sort_by_key(|r| r.timestamp);

            let last_aggregated = aggregates
                .iter()
                .filter(|a| a.kpi_type == kpi_type && a.interval_seconds == interval_seconds)
                .map(|a| a.timestamp)
                .max();

            let mut bucket_start = match last_aggregated {
                Some(last) => last + ChronoDuration::seconds(interval_seconds),
                None => samples[0].timestamp,
            };
            let max_ts = samples[samples.len() - 1].timestamp;

            while bucket_start <= max_ts && bucket_start <= now {
                let bucket_end = bucket_start + ChronoDuration::seconds(interval_seconds);
                let values: Vec<f64> = samples
                    .iter()
                    .filter(|r| r.timestamp >= bucket_start && r.timestamp < bucket_end)
                    .map(|r| r.value)
                    .collect();
                if !values.is_empty() {
                    aggregates.push(aggregate_bucket(
                        kpi_type,
                        bucket_start,
                        interval_seconds,
                        &values,
                    ));
                    written += 1;
                }
                bucket_start = bucket_end;
            }
        }
        Ok(written)
    }

    fn cleanup_old_data(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        let mut removed = before - records.len();

        let mut aggregates = self.aggregates.lock();
        let before = aggregates.len();
        aggregates.retain(|a| a.timestamp >= cutoff);
        removed += before - aggregates.len();
        Ok(removed)
    }

    fn storage_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "backend": "memory",
            "records": self.records.lock().len(),
            "aggregates": self.aggregates.lock().len(),
        })
    }
}

/// Buffered storage facade over a backend.
///
/// Samples land in an in-memory buffer and flush either when the batch size
/// is reached or from the background worker every flush interval. The
/// worker also drives rollup aggregation and retention cleanup.
pub struct MetricsStorage {
    config: StorageConfig,
    backend: Arc<dyn StorageBackend>,
    buffer: Arc<Mutex<Vec<MetricRecord>>>,
    running: Arc<AtomicBool>,
}

impl MetricsStorage {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileStorageBackend::new(&config.storage_path)?);
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: StorageConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            config,
            backend,
            buffer: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Buffer one sample; flushes eagerly at the batch size
    pub fn store_metric(
        &self,
        kpi_type: KpiType,
        value: f64,
        stage: Option<&str>,
        flow_id: Option<&str>,
    ) -> Result<()> {
        let record = MetricRecord {
            timestamp: Utc::now(),
            kpi_type,
            value,
            stage: stage.map(str::to_string),
            flow_id: flow_id.map(str::to_string),
            metadata: HashMap::new(),
        };

        let flush_now = {
            let mut buffer = self.buffer.lock();
            buffer.push(record);
            buffer.len() >= self.config.batch_size
        };

        if flush_now {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the buffer to the backend
    pub fn flush(&self) -> Result<()> {
        let to_store: Vec<MetricRecord> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if to_store.is_empty() {
            return Ok(());
        }
        self.backend.store_metrics(&to_store)
    }

    /// Spawn the background flush/aggregation/cleanup worker. Requires a
    /// tokio runtime.
    pub fn start_background_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::Relaxed);
        let storage = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                storage.config.flush_interval_seconds.max(1),
            ));
            ticker.tick().await; // immediate first tick

            while storage.running.load(Ordering::Relaxed) {
                ticker.tick().await;

                if let Err(e) = storage.flush() {
                    log_error(LogCategory::Metrics, &format!("Metrics flush failed: {e}"));
                }
                for interval in &storage.config.aggregation_intervals {
                    if let Err(e) = storage.backend.aggregate_raw_metrics(*interval) {
                        log_error(
                            LogCategory::Metrics,
                            &format!("Metrics aggregation failed: {e}"),
                        );
                    }
                }
                if let Err(e) = storage.backend.cleanup_old_data(storage.config.retention_days) {
                    log_error(LogCategory::Metrics, &format!("Metrics cleanup failed: {e}"));
                }
            }
        })
    }

    /// Stop the worker and flush remaining samples
    pub fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        let result = self.flush();
        log_info(LogCategory::Metrics, "Metrics storage shut down");
        result
    }

    pub fn query_metrics(
        &self,
        kpi_type: KpiType,
        time_range_hours: i64,
        limit: Option<usize>,
    ) -> Result<Vec<MetricRecord>> {
        let end = Utc::now();
        let start = end - ChronoDuration::hours(time_range_hours);
        self.backend.query_metrics(kpi_type, start, end, limit)
    }

    pub fn get_aggregated_metrics(
        &self,
        kpi_type: KpiType,
        interval_seconds: i64,
        time_range_hours: i64,
    ) -> Result<Vec<AggregatedMetric>> {
        let end = Utc::now();
        let start = end - ChronoDuration::hours(time_range_hours);
        self.backend
            .get_aggregated_metrics(kpi_type, interval_seconds, start, end)
    }

    /// Min/max/avg summary over a window
    pub fn metrics_summary(&self, kpi_type: KpiType, time_range_hours: i64) -> Result<serde_json::Value> {
        let metrics = self.query_metrics(kpi_type, time_range_hours, None)?;
        if metrics.is_empty() {
            return Ok(serde_json::json!({
                "kpi_type": kpi_type,
                "count": 0,
            }));
        }

        let values: Vec<f64> = metrics.iter().map(|m| m.value).collect();
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;

        Ok(serde_json::json!({
            "kpi_type": kpi_type,
            "count": values.len(),
            "min": min,
            "max": max,
            "avg": avg,
            "time_range_hours": time_range_hours,
        }))
    }

    pub fn cleanup_old_data(&self) -> Result<usize> {
        self.backend.cleanup_old_data(self.config.retention_days)
    }

    pub fn aggregate_now(&self) -> Result<usize> {
        let mut total = 0;
        for interval in &self.config.aggregation_intervals {
            total += self.backend.aggregate_raw_metrics(*interval)?;
        }
        Ok(total)
    }

    pub fn storage_statistics(&self) -> serde_json::Value {
        let mut stats = self.backend.storage_stats();
        if let Some(obj) = stats.as_object_mut() {
            obj.insert(
                "buffered_records".to_string(),
                serde_json::Value::from(self.buffer.lock().len()),
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(kpi: KpiType, value: f64, offset_seconds: i64) -> MetricRecord {
        MetricRecord {
            timestamp: Utc::now() - ChronoDuration::seconds(offset_seconds),
            kpi_type: kpi,
            value,
            stage: None,
            flow_id: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_file_backend_store_and_query() {
        let dir = TempDir::new().unwrap();
        let backend = FileStorageBackend::new(dir.path()).unwrap();

        backend
            .store_metrics(&[
                record(KpiType::ExecutionTime, 1.0, 30),
                record(KpiType::ExecutionTime, 2.0, 20),
                record(KpiType::ErrorRate, 0.0, 10),
            ])
            .unwrap();

        let results = backend
            .query_metrics(
                KpiType::ExecutionTime,
                Utc::now() - ChronoDuration::hours(1),
                Utc::now(),
                None,
            )
            .unwrap();
        assert_eq!(results.len(), 2);
        // Newest first
        assert_eq!(results[0].value, 2.0);

        let file = dir
            .path()
            .join(format!("metrics_{}.json", Utc::now().format("%Y-%m-%d")));
        assert!(file.exists());
    }

    #[test]
    fn test_aggregation_anchored_to_earliest_sample() {
        let backend = MemoryStorageBackend::new();
        let base_offset = 500;
        backend
            .store_metrics(&[
                record(KpiType::ExecutionTime, 1.0, base_offset),
                record(KpiType::ExecutionTime, 3.0, base_offset - 30),
                record(KpiType::ExecutionTime, 5.0, base_offset - 59),
            ])
            .unwrap();

        let written = backend.aggregate_raw_metrics(60).unwrap();
        assert_eq!(written, 1);

        let aggregates = backend
            .get_aggregated_metrics(
                KpiType::ExecutionTime,
                60,
                Utc::now() - ChronoDuration::hours(1),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(aggregates.len(), 1);
        let bucket = &aggregates[0];
        assert_eq!(bucket.count, 3);
        assert_eq!(bucket.min_value, 1.0);
        assert_eq!(bucket.max_value, 5.0);
        assert!((bucket.avg_value - 3.0).abs() < 1e-9);

        // Invariant: every sample in the bucket is inside
        // [bucket.start, bucket.start + interval)
        let bucket_end = bucket.timestamp + ChronoDuration::seconds(60);
        let raw = backend
            .query_metrics(
                KpiType::ExecutionTime,
                bucket.timestamp,
                bucket_end - ChronoDuration::milliseconds(1),
                None,
            )
            .unwrap();
        assert_eq!(raw.len(), 3);
    }

    #[test]
    fn test_aggregation_resumes_after_last_bucket() {
        let backend = MemoryStorageBackend::new();
        backend
            .store_metrics(&[record(KpiType::Throughput, 1.0, 240)])
            .unwrap();
        assert_eq!(backend.aggregate_raw_metrics(60).unwrap(), 1);

        // New samples in a later bucket; re-aggregation only writes the new
        // bucket, not the already aggregated one
        backend
            .store_metrics(&[record(KpiType::Throughput, 2.0, 100)])
            .unwrap();
        assert_eq!(backend.aggregate_raw_metrics(60).unwrap(), 1);

        let aggregates = backend
            .get_aggregated_metrics(
                KpiType::Throughput,
                60,
                Utc::now() - ChronoDuration::hours(1),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(aggregates.len(), 2);
    }

    #[test]
    fn test_retention_cleanup_removes_old_day_files() {
        let dir = TempDir::new().unwrap();
        let backend = FileStorageBackend::new(dir.path()).unwrap();

        // Write an old-day file directly
        let old_date = (Utc::now() - ChronoDuration::days(120)).date_naive();
        let old_path = dir
            .path()
            .join(format!("metrics_{}.json", old_date.format("%Y-%m-%d")));
        let old_records = vec![MetricRecord {
            timestamp: Utc::now() - ChronoDuration::days(120),
            kpi_type: KpiType::CpuUsage,
            value: 10.0,
            stage: None,
            flow_id: None,
            metadata: HashMap::new(),
        }];
        std::fs::write(&old_path, serde_json::to_string(&old_records).unwrap()).unwrap();

        backend
            .store_metrics(&[record(KpiType::CpuUsage, 20.0, 10)])
            .unwrap();

        let removed = backend.cleanup_old_data(90).unwrap();
        assert_eq!(removed, 1);
        assert!(!old_path.exists());

        // Recent data survives
        let recent = backend
            .query_metrics(
                KpiType::CpuUsage,
                Utc::now() - ChronoDuration::hours(1),
                Utc::now(),
                None,
            )
            .unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_buffered_writes_flush_at_batch_size() {
        let backend = Arc::new(MemoryStorageBackend::new());
        let storage = MetricsStorage::with_backend(
            StorageConfig {
                batch_size: 3,
                ..StorageConfig::default()
            },
            backend.clone(),
        );

        storage.store_metric(KpiType::ResponseTime, 1.0, None, None).unwrap();
        storage.store_metric(KpiType::ResponseTime, 2.0, None, None).unwrap();
        assert_eq!(backend.records.lock().len(), 0);

        storage.store_metric(KpiType::ResponseTime, 3.0, None, None).unwrap();
        assert_eq!(backend.records.lock().len(), 3);

        storage.store_metric(KpiType::ResponseTime, 4.0, None, None).unwrap();
        storage.shutdown().unwrap();
        assert_eq!(backend.records.lock().len(), 4);
    }

    #[test]
    fn test_metrics_summary() {
        let backend = Arc::new(MemoryStorageBackend::new());
        let storage = MetricsStorage::with_backend(StorageConfig::default(), backend);
        for value in [1.0, 2.0, 3.0] {
            storage
                .store_metric(KpiType::StageDuration, value, Some("draft_generation"), None)
                .unwrap();
        }
        storage.flush().unwrap();

        let summary = storage.metrics_summary(KpiType::StageDuration, 1).unwrap();
        assert_eq!(summary["count"], 3);
        assert_eq!(summary["min"], 1.0);
        assert_eq!(summary["max"], 3.0);
        assert_eq!(summary["avg"], 2.0);
    }
}
