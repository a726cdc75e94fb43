// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the cache layer.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing an exporter
//! (Prometheus, OTEL, etc.); without one every call here is a no-op.
//!
//! # Metric Naming Convention
//! - `cache_layer_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `circuit`: breaker name
//! - `operation`: monitored operation name
//! - `rule` / `event_type`: invalidation rule and triggering event
//! - `outcome`: success, failure, timeout, rejected

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Set circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "cache_layer_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(f64::from(state));
}

/// Record circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "cache_layer_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BATCH SCHEDULER - Pipelined flushes
// ═══════════════════════════════════════════════════════════════════════════

/// Record one pipeline flush and how many operations it carried
pub fn record_batch_flush(size: usize, outcome: &str) {
    counter!(
        "cache_layer_batch_flushes_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("cache_layer_batch_size").record(size as f64);
}

/// Record batch flush duration
pub fn record_flush_duration(duration: Duration) {
    histogram!("cache_layer_flush_seconds").record(duration.as_secs_f64());
}

/// Set queue depth for both lanes
pub fn set_batch_queue_depth(priority: usize, regular: usize) {
    gauge!("cache_layer_batch_queue_items", "lane" => "priority").set(priority as f64);
    gauge!("cache_layer_batch_queue_items", "lane" => "regular").set(regular as f64);
}

/// Record operations rejected without a store reply
pub fn record_batch_rejected(count: usize, reason: &str) {
    counter!(
        "cache_layer_batch_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// INVALIDATION - Rule execution and propagation
// ═══════════════════════════════════════════════════════════════════════════

/// Record a rule execution and the keys it removed
pub fn record_invalidation(rule: &str, event_type: &str, deleted: u64) {
    counter!(
        "cache_layer_invalidation_runs_total",
        "rule" => rule.to_string(),
        "event_type" => event_type.to_string()
    )
    .increment(1);
    counter!(
        "cache_layer_invalidated_keys_total",
        "rule" => rule.to_string()
    )
    .increment(deleted);
}

/// Record a failed rule execution
pub fn record_rule_error(rule: &str) {
    counter!(
        "cache_layer_invalidation_rule_errors_total",
        "rule" => rule.to_string()
    )
    .increment(1);
}

/// Record an event handled locally or received from a peer
pub fn record_invalidation_event(event_type: &str, origin: &str) {
    counter!(
        "cache_layer_invalidation_events_total",
        "event_type" => event_type.to_string(),
        "origin" => origin.to_string()
    )
    .increment(1);
}

/// Record a transport failure (publish or receive side)
pub fn record_transport_error(transport: &str, direction: &str) {
    counter!(
        "cache_layer_transport_errors_total",
        "transport" => transport.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ADAPTIVE - Mode and feature gating
// ═══════════════════════════════════════════════════════════════════════════

/// Set optimization mode (0 = normal, 1 = conservative, 2 = aggressive)
pub fn set_optimization_mode(mode: u8) {
    gauge!("cache_layer_optimization_mode").set(f64::from(mode));
}

/// Set last observed resource usage (0 - 100)
pub fn set_usage_pct(pct: f64) {
    gauge!("cache_layer_usage_pct").set(pct);
}

/// Record a feature flag changing state
pub fn record_feature_toggle(feature: &str, enabled: bool) {
    counter!(
        "cache_layer_feature_toggles_total",
        "feature" => feature.to_string(),
        "enabled" => if enabled { "true" } else { "false" }
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// MONITORING - Operations and store health
// ═══════════════════════════════════════════════════════════════════════════

/// Record a monitored operation outcome and latency
pub fn record_operation(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "cache_layer_operations_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "cache_layer_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set latest health sample (status 0 = healthy, 1 = degraded, 2 = unhealthy)
pub fn set_health(status: u8, latency_ms: f64, memory_pct: f64) {
    gauge!("cache_layer_health_status").set(f64::from(status));
    gauge!("cache_layer_store_latency_ms").set(latency_ms);
    gauge!("cache_layer_store_memory_pct").set(memory_pct);
}

/// Set aggregate gauges for one operation
pub fn set_operation_stats(operation: &str, avg_ms: f64, success_rate: f64) {
    gauge!(
        "cache_layer_operation_avg_ms",
        "operation" => operation.to_string()
    )
    .set(avg_ms);
    gauge!(
        "cache_layer_operation_success_rate",
        "operation" => operation.to_string()
    )
    .set(success_rate);
}

/// Set failures seen in the health error window
pub fn set_recent_errors(count: u64) {
    gauge!("cache_layer_recent_errors").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Count transitions into each layer state
pub fn set_layer_state(state: &str) {
    counter!(
        "cache_layer_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("cache_layer_startup_seconds").record(duration.as_secs_f64());
}
