// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos Testing for the Cache Layer
//!
//! Failure scenarios driven by a [`ChaosStore`] wrapper around the
//! in-memory store:
//! 1. **Error injection** - fail every pipeline after N calls, or fail scans
//! 2. **Latency injection** - slow pipelines and pings
//! 3. **Flush accounting** - in-flight counter and recorded batch sizes
//! 4. **Panics** - a pipeline touching a chosen key panics
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use resilient_cache::adaptive::{default_features, AdaptiveController, OptimizationMode, UsageThresholds};
use resilient_cache::batching::{BatchConfig, BatchError, BatchScheduler};
use resilient_cache::invalidation::{InvalidationEngine, InvalidationRule, InvalidationSettings};
use resilient_cache::monitoring::{classify, HealthStatus, MonitoringService};
use resilient_cache::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use resilient_cache::storage::command::{Command, Reply};
use resilient_cache::storage::memory::InMemoryStore;
use resilient_cache::storage::traits::{KvStore, StoreError, StoreInfo};

// =============================================================================
// Chaos Store - Precise Error and Latency Injection
// =============================================================================

/// Wraps an [`InMemoryStore`] and misbehaves on demand.
#[derive(Default)]
pub struct ChaosStore {
    inner: InMemoryStore,
    pipeline_calls: AtomicU64,
    /// Pipelines numbered above this fail (1-indexed, 0 = never)
    fail_after: AtomicU64,
    fail_scans: AtomicBool,
    panic_on_key: Mutex<Option<String>>,
    pipeline_delay: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl ChaosStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every pipeline after the first `n` fails.
    fn failing_after(n: u64) -> Arc<Self> {
        let store = Self::default();
        store.fail_after.store(n + 1, Ordering::SeqCst);
        Arc::new(store)
    }

    fn slow(delay: Duration) -> Arc<Self> {
        let store = Self::default();
        *store.pipeline_delay.lock() = delay;
        Arc::new(store)
    }

    fn panicking_on(key: &str) -> Arc<Self> {
        let store = Self::default();
        *store.panic_on_key.lock() = Some(key.to_string());
        Arc::new(store)
    }

    fn calls(&self) -> u64 {
        self.pipeline_calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

#[async_trait]
impl KvStore for ChaosStore {
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        let call = self.pipeline_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.batch_sizes.lock().push(commands.len());

        let poisoned = self.panic_on_key.lock().clone();
        if let Some(key) = poisoned {
            if commands.iter().any(|c| c.key() == key) {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                panic!("injected panic on {key}");
            }
        }

        let delay = *self.pipeline_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let threshold = self.fail_after.load(Ordering::SeqCst);
        let result = if threshold != 0 && call >= threshold {
            Err(StoreError::Backend("injected pipeline failure".into()))
        } else {
            self.inner.pipeline(commands).await
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        if self.fail_scans.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected scan failure".into()));
        }
        self.inner.scan_match(pattern).await
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.inner.del_many(keys).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        self.inner.subscribe(channel).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let delay = std::mem::take(&mut *self.ping_delay.lock());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.ping().await
    }

    async fn info(&self) -> Result<StoreInfo, StoreError> {
        self.inner.info().await
    }
}

fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "redis",
        CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(200),
            expected_error_rate: 0.5,
            call_timeout: Duration::from_secs(1),
        },
    ))
}

fn batch_config(max: usize) -> BatchConfig {
    BatchConfig {
        max_batch_size: max,
        batch_timeout: Duration::from_millis(5),
        ..Default::default()
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[tokio::test]
async fn chaos_breaker_opens_on_third_failure_and_stops_calling() {
    let cb = breaker(3);
    let invoked = Arc::new(AtomicUsize::new(0));

    for expected in [CircuitState::Closed, CircuitState::Closed, CircuitState::Open] {
        let counter = invoked.clone();
        let result: Result<(), CircuitError<&str>> = cb
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down")
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Inner("down"))));
        assert_eq!(cb.state(), expected);
    }
    assert_eq!(cb.failure_rate(), 1.0);

    // Open: the operation is never invoked before recovery
    for _ in 0..5 {
        let counter = invoked.clone();
        let result: Result<(), CircuitError<&str>> = cb
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 3);

    // After recovery a single successful trial closes it
    tokio::time::sleep(Duration::from_millis(250)).await;
    let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(7) }).await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test]
async fn chaos_fallback_error_is_returned_unchanged() {
    let cb = breaker(1);
    cb.force_open();

    let result: Result<i32, String> = cb
        .call_or_else(
            || async { Ok::<i32, String>(1) },
            |err| async move { Err(format!("fallback saw: {err}")) },
        )
        .await;
    let message = result.unwrap_err();
    assert!(message.starts_with("fallback saw:"));
    // Fallback outcome does not move the breaker
    assert_eq!(cb.state(), CircuitState::Open);
}

// =============================================================================
// Batch Scheduler
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_thousand_concurrent_enqueues_never_overlap() {
    let store = ChaosStore::slow(Duration::from_millis(2));
    let scheduler = Arc::new(BatchScheduler::new(store.clone(), breaker(1000), batch_config(64)));

    let mut handles = Vec::with_capacity(1000);
    for i in 0..1000 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                scheduler.set(&format!("key:{i}"), i.to_string()).await.map(|_| ())
            } else {
                scheduler.get(&format!("key:{}", i - 1)).await.map(|_| ())
            }
        }));
    }

    let mut ok = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    assert_eq!(ok, 1000);
    assert_eq!(store.max_in_flight(), 1, "two pipelines ran at once");
    let stats = scheduler.stats();
    assert_eq!(stats.enqueued, 1000);
    assert_eq!(stats.resolved + stats.rejected, stats.enqueued);
    assert_eq!(store.batch_sizes().iter().sum::<usize>(), 1000);
}

#[tokio::test]
async fn chaos_150_gets_flush_as_100_then_50() {
    let store = ChaosStore::new();
    for i in 0..150 {
        store.inner.pipeline(&[Command::set(format!("k{i}"), format!("v{i}"))]).await.unwrap();
    }
    let scheduler = BatchScheduler::new(store.clone(), breaker(5), batch_config(100));

    let pending: Vec<_> = (0..150).map(|i| scheduler.enqueue(Command::get(format!("k{i}")))).collect();
    let replies = futures::future::join_all(pending).await;

    assert_eq!(store.batch_sizes(), vec![100, 50]);
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap(), Reply::Data(format!("v{i}")));
    }
}

#[tokio::test]
async fn chaos_failed_batch_rejects_every_operation_uniformly() {
    let store = ChaosStore::failing_after(0);
    let scheduler = BatchScheduler::new(store.clone(), breaker(100), batch_config(10));

    let pending: Vec<_> = (0..10).map(|i| scheduler.enqueue(Command::get(format!("k{i}")))).collect();
    let errors: Vec<BatchError> = futures::future::join_all(pending)
        .await
        .into_iter()
        .map(|r| r.unwrap_err())
        .collect();

    assert!(matches!(errors[0], BatchError::Execution(_)));
    assert!(errors.iter().all(|e| *e == errors[0]));
    // No retry of the failed batch
    assert_eq!(store.calls(), 1);
    let stats = scheduler.stats();
    assert_eq!(stats.rejected, 10);
    assert_eq!(stats.resolved + stats.rejected, stats.enqueued);
}

#[tokio::test]
async fn chaos_open_breaker_rejects_without_touching_store() {
    let store = ChaosStore::new();
    let cb = breaker(3);
    cb.force_open();
    let scheduler = BatchScheduler::new(store.clone(), cb, batch_config(10));

    let err = scheduler.get("auth:user:1").await.unwrap_err();
    assert!(matches!(err, BatchError::Rejected { .. }));
    assert_eq!(store.calls(), 0);

    let value = scheduler
        .get_or_else("auth:user:1", |_| async { Ok::<_, BatchError>(Some("from-db".to_string())) })
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("from-db"));
}

#[tokio::test]
async fn chaos_store_outage_trips_breaker_then_batches_are_rejected() {
    let store = ChaosStore::failing_after(2);
    let scheduler = BatchScheduler::new(store.clone(), breaker(3), batch_config(1));

    let mut errors = Vec::new();
    for i in 0..8 {
        if let Err(e) = scheduler.set(&format!("k{i}"), "v").await {
            errors.push(e);
        }
    }

    // 2 ok, then store failures until the breaker opens
    assert!(errors.iter().any(|e| matches!(e, BatchError::Execution(_))));
    assert!(errors.iter().any(|e| matches!(e, BatchError::Rejected { .. })));
    assert!(store.calls() < 8);
}

#[tokio::test]
async fn chaos_refused_command_fails_only_its_caller() {
    let store = ChaosStore::new();
    store.inner.pipeline(&[Command::set("name", "ada")]).await.unwrap();
    let cb = breaker(2);
    let scheduler = BatchScheduler::new(store.clone(), cb.clone(), BatchConfig {
        max_batch_size: 2,
        batch_timeout: Duration::from_secs(60),
        ..Default::default()
    });

    // Each round is one pipeline: an innocent GET next to an INCR on text
    for round in 0..3 {
        let get = scheduler.enqueue(Command::get(format!("course:{round}")));
        let incr = scheduler.enqueue(Command::incr("name"));
        assert_eq!(get.await.unwrap(), Reply::Nil);
        assert!(matches!(incr.await.unwrap_err(), BatchError::Command(_)));
    }

    assert_eq!(store.batch_sizes(), vec![2, 2, 2]);
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failures(), 0);
    let stats = scheduler.stats();
    assert_eq!(stats.failed_flushes, 0);
    assert_eq!(stats.refused, 3);
    assert_eq!(stats.resolved, 6);
    assert_eq!(scheduler.get("name").await.unwrap().as_deref(), Some("ada"));
}

#[tokio::test]
async fn chaos_incr_overflow_is_refused_and_scheduler_survives() {
    let store = ChaosStore::new();
    store.inner.pipeline(&[Command::set("c", i64::MAX.to_string())]).await.unwrap();
    let scheduler = BatchScheduler::new(store.clone(), breaker(3), batch_config(10));

    assert!(matches!(scheduler.incr("c").await.unwrap_err(), BatchError::Command(_)));
    assert_eq!(scheduler.get("c").await.unwrap(), Some(i64::MAX.to_string()));
    assert_eq!(scheduler.decr("c").await.unwrap(), i64::MAX - 1);
}

#[tokio::test]
async fn chaos_panicking_pipeline_rejects_batch_and_keeps_supervisor() {
    let store = ChaosStore::panicking_on("boom");
    let scheduler = BatchScheduler::new(store.clone(), breaker(5), batch_config(10));

    let err = scheduler.get("boom").await.unwrap_err();
    assert!(matches!(err, BatchError::Execution(_)));

    // The supervisor is still flushing on its timer
    scheduler.set("after", "1").await.unwrap();
    assert_eq!(scheduler.get("after").await.unwrap().as_deref(), Some("1"));
    let stats = scheduler.stats();
    assert_eq!(stats.failed_flushes, 1);
    assert_eq!(stats.resolved + stats.rejected, stats.enqueued);
}

// =============================================================================
// Invalidation
// =============================================================================

#[tokio::test]
async fn chaos_empty_tag_invalidates_zero_twice() {
    let store = ChaosStore::new();
    let engine = InvalidationEngine::new(store, InvalidationSettings::default());

    assert_eq!(engine.invalidate_tag("course:missing").await.unwrap(), 0);
    assert_eq!(engine.invalidate_tag("course:missing").await.unwrap(), 0);
}

#[tokio::test]
async fn chaos_rule_failure_does_not_block_siblings() {
    let store = ChaosStore::new();
    let engine = Arc::new(InvalidationEngine::new(store.clone(), InvalidationSettings::default()));
    engine.add_rule(InvalidationRule::new("by_tag").on("course.updated").tag("course:{course_id}"));
    engine.add_rule(InvalidationRule::new("by_pattern").on("course.updated").pattern("cache:course:{course_id}:*"));

    store.inner.pipeline(&[Command::set("cache:course:1:meta", "{}")]).await.unwrap();
    engine.tag_key("course-1-page", &["course:1"]).await.unwrap();
    store.inner.pipeline(&[Command::set("course-1-page", "<html>")]).await.unwrap();

    store.fail_scans.store(true, Ordering::SeqCst);
    let report = engine.trigger("course.updated", json!({"course_id": 1}), None, None).await;

    assert_eq!(report.rules_matched, 2);
    assert_eq!(report.rules_failed, 1);
    assert_eq!(report.rules_executed, 1);
    assert_eq!(store.get("course-1-page").await.unwrap(), None);
    assert!(store.get("cache:course:1:meta").await.unwrap().is_some());
    assert_eq!(engine.rule_stats("by_pattern").unwrap().errors, 1);
}

// =============================================================================
// Adaptive Controller
// =============================================================================

#[tokio::test]
async fn chaos_critical_flag_survives_everything() {
    let controller = AdaptiveController::new(default_features(), UsageThresholds::default());

    assert!(!controller.set_feature_enabled("auth_caching", false));
    for usage in [99.0, 75.0, 10.0, 100.0] {
        controller.auto_optimize(usage);
        assert!(controller.is_feature_enabled("auth_caching"));
    }
    controller.set_optimization_mode(OptimizationMode::Aggressive);
    assert!(controller.is_feature_enabled("auth_caching"));
}

// =============================================================================
// Monitoring
// =============================================================================

#[test]
fn chaos_first_slow_sample_is_unhealthy() {
    let statuses: Vec<HealthStatus> = [1200.0, 50.0, 60.0].iter().map(|&l| classify(l, 10.0, 0)).collect();
    assert_eq!(statuses, vec![HealthStatus::Unhealthy, HealthStatus::Healthy, HealthStatus::Healthy]);
}

#[tokio::test]
async fn chaos_slow_ping_is_recorded_unhealthy() {
    let store = ChaosStore::new();
    *store.ping_delay.lock() = Duration::from_millis(1100);
    let monitor = MonitoringService::new(store, 10);

    let first = monitor.health_check().await;
    let second = monitor.health_check().await;

    assert_eq!(first.status, HealthStatus::Unhealthy);
    assert_eq!(second.status, HealthStatus::Healthy);
    assert_eq!(monitor.health_history()[0].status, HealthStatus::Unhealthy);
}
