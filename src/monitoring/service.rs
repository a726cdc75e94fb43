// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation aggregates and store health probing.
//!
//! Every component reports outcomes through [`MonitoringService::record_operation`].
//! Each operation name owns one running aggregate, updated in place; no
//! per-call history is kept. Failures are additionally timestamped so the
//! health check can count errors over the last minute.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::health::{classify, compute_trends, HealthSample, HealthStatus, HealthTrends};
use crate::storage::traits::KvStore;

/// Window for counting recent failures in a health check.
pub const ERROR_WINDOW: Duration = Duration::from_secs(60);

const ERROR_BUCKETS: usize = ERROR_WINDOW.as_secs() as usize;

/// Running aggregate for one operation name.
#[derive(Debug, Clone, Serialize)]
pub struct OperationMetric {
    pub name: String,
    pub total_calls: u64,
    pub success_calls: u64,
    pub failure_calls: u64,
    pub total_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Unix millis
    pub last_executed_at: u64,
}

impl OperationMetric {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            total_calls: 0,
            success_calls: 0,
            failure_calls: 0,
            total_duration_ms: 0.0,
            min_duration_ms: f64::MAX,
            max_duration_ms: 0.0,
            last_executed_at: 0,
        }
    }

    fn record(&mut self, duration_ms: f64, success: bool) {
        self.total_calls += 1;
        if success {
            self.success_calls += 1;
        } else {
            self.failure_calls += 1;
        }
        self.total_duration_ms += duration_ms;
        self.min_duration_ms = self.min_duration_ms.min(duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.last_executed_at = now_millis();
    }

    #[must_use]
    pub fn avg_duration_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_duration_ms / self.total_calls as f64
        }
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            1.0
        } else {
            self.success_calls as f64 / self.total_calls as f64
        }
    }
}

/// Summary view used in reports.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub name: String,
    pub total_calls: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl From<&OperationMetric> for OperationSummary {
    fn from(m: &OperationMetric) -> Self {
        Self {
            name: m.name.clone(),
            total_calls: m.total_calls,
            success_rate: m.success_rate(),
            avg_duration_ms: m.avg_duration_ms(),
            min_duration_ms: if m.total_calls == 0 { 0.0 } else { m.min_duration_ms },
            max_duration_ms: m.max_duration_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub uptime_secs: u64,
    pub total_operations: u64,
    pub overall_success_rate: f64,
    /// Sorted by name
    pub operations: Vec<OperationSummary>,
    /// Up to five operations with the highest average latency
    pub slowest: Vec<String>,
    /// Operations whose success rate is below 95%
    pub failing: Vec<String>,
    pub latest_health: Option<HealthSample>,
    pub trends: HealthTrends,
    pub recommendations: Vec<String>,
}

/// Raw dump for external collectors.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
    /// Unix millis
    pub timestamp: u64,
    pub operations: Vec<OperationMetric>,
    pub health_history: Vec<HealthSample>,
}

impl MetricsExport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub struct MonitoringService {
    store: Arc<dyn KvStore>,
    operations: DashMap<String, OperationMetric>,
    failures: Mutex<ErrorWindow>,
    history: Mutex<VecDeque<HealthSample>>,
    history_size: AtomicUsize,
    started_at: Instant,
}

impl MonitoringService {
    pub fn new(store: Arc<dyn KvStore>, history_size: usize) -> Self {
        Self {
            store,
            operations: DashMap::new(),
            failures: Mutex::new(ErrorWindow::new()),
            history: Mutex::new(VecDeque::with_capacity(history_size)),
            history_size: AtomicUsize::new(history_size.max(1)),
            started_at: Instant::now(),
        }
    }

    /// Change the ring buffer capacity, evicting oldest samples if shrinking.
    pub fn set_history_size(&self, size: usize) {
        let size = size.max(1);
        self.history_size.store(size, Ordering::Relaxed);
        let mut history = self.history.lock();
        while history.len() > size {
            history.pop_front();
        }
    }

    pub fn record_operation(&self, name: &str, duration: Duration, success: bool) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        self.operations
            .entry(name.to_string())
            .or_insert_with(|| OperationMetric::new(name))
            .record(duration_ms, success);

        if !success {
            self.failures.lock().record(self.second());
        }
        crate::metrics::record_operation(name, success, duration);
    }

    /// Failures recorded across all operations within [`ERROR_WINDOW`].
    #[must_use]
    pub fn recent_error_count(&self) -> u64 {
        self.failures.lock().count(self.second())
    }

    /// Whole seconds since the service started.
    fn second(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn operation(&self, name: &str) -> Option<OperationMetric> {
        self.operations.get(name).map(|m| m.clone())
    }

    /// Ping the store and append the sample to the history.
    ///
    /// A failed PING yields an unhealthy sample rather than an error; a
    /// failed INFO only loses the memory and connection readings.
    pub async fn health_check(&self) -> HealthSample {
        let started = Instant::now();
        let ping = self.store.ping().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (memory_pct, active_connections) = match self.store.info().await {
            Ok(info) => (info.memory_pct(), info.connected_clients),
            Err(e) => {
                debug!(error = %e, "Store INFO unavailable during health check");
                (0.0, 0)
            }
        };
        let recent_error_count = self.recent_error_count();

        let status = match &ping {
            Ok(()) => classify(latency_ms, memory_pct, recent_error_count),
            Err(e) => {
                warn!(error = %e, "Store liveness check failed");
                HealthStatus::Unhealthy
            }
        };

        let sample = HealthSample {
            status,
            latency_ms,
            memory_pct,
            active_connections,
            recent_error_count,
            timestamp: now_millis(),
        };
        self.push_sample(sample.clone());

        crate::metrics::set_health(status as u8, latency_ms, memory_pct);
        debug!(%status, latency_ms, memory_pct, recent_error_count, "Health check complete");
        sample
    }

    fn push_sample(&self, sample: HealthSample) {
        let capacity = self.history_size.load(Ordering::Relaxed);
        let mut history = self.history.lock();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(sample);
    }

    #[must_use]
    pub fn latest_health(&self) -> Option<HealthSample> {
        self.history.lock().back().cloned()
    }

    /// Oldest first.
    #[must_use]
    pub fn health_history(&self) -> Vec<HealthSample> {
        self.history.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn trends(&self) -> HealthTrends {
        compute_trends(self.history.lock().iter())
    }

    #[must_use]
    pub fn performance_report(&self) -> PerformanceReport {
        let mut operations: Vec<OperationSummary> =
            self.operations.iter().map(|m| OperationSummary::from(m.value())).collect();
        operations.sort_by(|a, b| a.name.cmp(&b.name));

        let total_operations: u64 = operations.iter().map(|o| o.total_calls).sum();
        let total_success: u64 = self.operations.iter().map(|m| m.success_calls).sum();
        let overall_success_rate = if total_operations == 0 {
            1.0
        } else {
            total_success as f64 / total_operations as f64
        };

        let mut by_latency: Vec<&OperationSummary> = operations.iter().collect();
        by_latency.sort_by(|a, b| b.avg_duration_ms.total_cmp(&a.avg_duration_ms));
        let slowest = by_latency.iter().take(5).map(|o| o.name.clone()).collect();

        let failing: Vec<String> = operations
            .iter()
            .filter(|o| o.success_rate < 0.95)
            .map(|o| o.name.clone())
            .collect();

        let latest_health = self.latest_health();
        let trends = self.trends();

        let mut recommendations = Vec::new();
        if let Some(health) = &latest_health {
            if health.latency_ms > super::health::DEGRADED_LATENCY_MS {
                recommendations.push("Store latency is high; consider larger batches or a closer replica".to_string());
            }
            if health.memory_pct > super::health::DEGRADED_MEMORY_PCT {
                recommendations.push("Store memory is nearly exhausted; shorten TTLs or raise maxmemory".to_string());
            }
        }
        if !failing.is_empty() {
            recommendations.push(format!("Investigate failing operations: {}", failing.join(", ")));
        }
        if trends.latency == super::health::Trend::Degrading {
            recommendations.push("Latency trend is degrading".to_string());
        }
        if trends.errors == super::health::Trend::Degrading {
            recommendations.push("Error trend is degrading".to_string());
        }

        PerformanceReport {
            uptime_secs: self.started_at.elapsed().as_secs(),
            total_operations,
            overall_success_rate,
            operations,
            slowest,
            failing,
            latest_health,
            trends,
            recommendations,
        }
    }

    #[must_use]
    pub fn export_metrics(&self) -> MetricsExport {
        let mut operations: Vec<OperationMetric> = self.operations.iter().map(|m| m.clone()).collect();
        operations.sort_by(|a, b| a.name.cmp(&b.name));
        MetricsExport {
            timestamp: now_millis(),
            operations,
            health_history: self.health_history(),
        }
    }

    /// Push per-operation averages to the metrics recorder.
    pub fn publish_gauges(&self) {
        for entry in self.operations.iter() {
            crate::metrics::set_operation_stats(entry.key(), entry.avg_duration_ms(), entry.success_rate());
        }
        crate::metrics::set_recent_errors(self.recent_error_count());
    }
}

/// Failure counts for the last [`ERROR_WINDOW`], one bucket per second.
/// A bucket is reused once its second has left the window.
struct ErrorWindow {
    /// (second, failures in that second)
    buckets: [(u64, u64); ERROR_BUCKETS],
}

impl ErrorWindow {
    fn new() -> Self {
        Self { buckets: [(u64::MAX, 0); ERROR_BUCKETS] }
    }

    fn record(&mut self, second: u64) {
        let bucket = &mut self.buckets[(second % ERROR_BUCKETS as u64) as usize];
        if bucket.0 != second {
            *bucket = (second, 0);
        }
        bucket.1 += 1;
    }

    fn count(&self, now: u64) -> u64 {
        self.buckets
            .iter()
            .filter(|(second, _)| *second <= now && now - second < ERROR_BUCKETS as u64)
            .map(|(_, failures)| failures)
            .sum()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;

    fn service(history: usize) -> MonitoringService {
        MonitoringService::new(Arc::new(InMemoryStore::new()), history)
    }

    #[test]
    fn test_error_window_expires_and_reuses_buckets() {
        let mut window = ErrorWindow::new();
        assert_eq!(window.count(0), 0);

        window.record(0);
        window.record(0);
        window.record(59);
        assert_eq!(window.count(59), 3);
        // Second 0 has left the window
        assert_eq!(window.count(60), 1);

        // Same bucket as second 0, which is overwritten rather than added to
        window.record(60);
        assert_eq!(window.count(60), 2);
        assert_eq!(window.count(119), 1);
        assert_eq!(window.count(500), 0);
    }

    #[test]
    fn test_record_operation_aggregates() {
        let monitor = service(10);
        monitor.record_operation("cache.get", Duration::from_millis(10), true);
        monitor.record_operation("cache.get", Duration::from_millis(30), true);
        monitor.record_operation("cache.get", Duration::from_millis(20), false);

        let m = monitor.operation("cache.get").unwrap();
        assert_eq!(m.total_calls, 3);
        assert_eq!(m.success_calls, 2);
        assert_eq!(m.failure_calls, 1);
        assert!((m.avg_duration_ms() - 20.0).abs() < 0.5);
        assert!((m.min_duration_ms - 10.0).abs() < 0.5);
        assert!((m.max_duration_ms - 30.0).abs() < 0.5);
        assert!(m.last_executed_at > 0);
        assert_eq!(monitor.recent_error_count(), 1);
    }

    #[tokio::test]
    async fn test_health_check_appends_to_ring_buffer() {
        let monitor = service(3);
        for _ in 0..5 {
            let sample = monitor.health_check().await;
            assert_eq!(sample.status, HealthStatus::Healthy);
        }
        assert_eq!(monitor.health_history().len(), 3);
        assert!(monitor.latest_health().is_some());
    }

    #[tokio::test]
    async fn test_recent_errors_degrade_health() {
        let monitor = service(10);
        for _ in 0..11 {
            monitor.record_operation("redis.pipeline", Duration::from_millis(1), false);
        }
        let sample = monitor.health_check().await;
        assert_eq!(sample.recent_error_count, 11);
        assert_eq!(sample.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_memory_pressure_degrades_health() {
        let store = Arc::new(InMemoryStore::new().with_max_memory(64));
        let monitor = MonitoringService::new(store.clone(), 10);
        store
            .pipeline(&[crate::storage::command::Command::set("k", "x".repeat(200))])
            .await
            .unwrap();

        let sample = monitor.health_check().await;
        assert!(sample.memory_pct > 90.0);
        assert_eq!(sample.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_shrinking_history_evicts_oldest() {
        let monitor = service(5);
        for i in 0..5u64 {
            monitor.push_sample(HealthSample {
                status: HealthStatus::Healthy,
                latency_ms: i as f64,
                memory_pct: 0.0,
                active_connections: 0,
                recent_error_count: 0,
                timestamp: i,
            });
        }
        monitor.set_history_size(2);
        let history = monitor.health_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, 3);
    }

    #[test]
    fn test_performance_report_flags_failing_operations() {
        let monitor = service(10);
        monitor.record_operation("fast", Duration::from_millis(1), true);
        monitor.record_operation("flaky", Duration::from_millis(50), false);
        monitor.record_operation("flaky", Duration::from_millis(50), true);

        let report = monitor.performance_report();
        assert_eq!(report.total_operations, 3);
        assert_eq!(report.slowest.first().map(String::as_str), Some("flaky"));
        assert_eq!(report.failing, vec!["flaky".to_string()]);
        assert!(report.recommendations.iter().any(|r| r.contains("flaky")));
    }

    #[test]
    fn test_export_serializes() {
        let monitor = service(10);
        monitor.record_operation("op", Duration::from_millis(2), true);
        let json = monitor.export_metrics().to_json().unwrap();
        assert!(json.contains("\"name\":\"op\""));
    }
}
