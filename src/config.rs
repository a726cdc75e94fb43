// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache layer.
//!
//! # Example
//!
//! ```
//! use resilient_cache::CacheLayerConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CacheLayerConfig::default();
//! assert_eq!(config.failure_threshold, 3);
//! assert_eq!(config.max_batch_size, 100);
//!
//! // Override what you need
//! let config = CacheLayerConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     max_batch_size: 50,
//!     batch_timeout_ms: 5,
//!     ..Default::default()
//! };
//! assert_eq!(config.batch_config().max_batch_size, 50);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::adaptive::{default_features, FeatureFlag, UsageThresholds};
use crate::batching::BatchConfig;
use crate::invalidation::InvalidationSettings;
use crate::resilience::circuit_breaker::CircuitConfig;

/// How invalidation events reach peer instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Pub/sub channel
    #[default]
    Push,
    /// Signal keys scanned on an interval
    Poll,
}

/// Configuration for the cache layer.
///
/// All fields have sensible defaults. Without `redis_url` the layer runs
/// on the in-process store, which is only useful for tests and demos.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheLayerConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Identity stamped on broadcast invalidations (random when unset)
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Store circuit breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_expected_error_rate")]
    pub expected_error_rate: f64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Batch scheduler
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub priority_queues: bool,
    #[serde(default = "default_priority_prefixes")]
    pub priority_prefixes: Vec<String>,

    /// Usage thresholds (percent) for adaptive mode selection
    #[serde(default = "default_usage_soft")]
    pub usage_soft_threshold: f64,
    #[serde(default = "default_usage_hard")]
    pub usage_hard_threshold: f64,
    #[serde(default = "default_usage_relax")]
    pub usage_relax_threshold: f64,

    /// Feature catalog (empty = built-in catalog)
    #[serde(default)]
    pub features: Vec<FeatureFlag>,

    /// Invalidation propagation
    #[serde(default)]
    pub invalidation_transport: TransportKind,
    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
    #[serde(default = "default_invalidation_signal_prefix")]
    pub invalidation_signal_prefix: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,

    /// Reverse-index prefix for tags
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
    /// Key families for user-scoped invalidation; `{user}` is substituted
    #[serde(default = "default_user_key_patterns")]
    pub user_key_patterns: Vec<String>,

    /// Background loops (0 = disabled)
    #[serde(default = "default_health_history_size")]
    pub health_history_size: usize,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_adaptive_interval_secs")]
    pub adaptive_interval_secs: u64,
}

fn default_failure_threshold() -> u32 { 3 }
fn default_recovery_timeout_ms() -> u64 { 30_000 }
fn default_expected_error_rate() -> f64 { 0.5 }
fn default_call_timeout_ms() -> u64 { 5_000 }
fn default_max_batch_size() -> usize { 100 }
fn default_batch_timeout_ms() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_priority_prefixes() -> Vec<String> { vec!["auth:".into(), "session:".into(), "otp:".into()] }
fn default_usage_soft() -> f64 { 70.0 }
fn default_usage_hard() -> f64 { 85.0 }
fn default_usage_relax() -> f64 { 50.0 }
fn default_invalidation_channel() -> String { "cache:invalidation".into() }
fn default_invalidation_signal_prefix() -> String { "cache:invalidation:signal".into() }
fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_signal_ttl_secs() -> u64 { 30 }
fn default_tag_prefix() -> String { "tag:".into() }
fn default_user_key_patterns() -> Vec<String> { InvalidationSettings::default().user_key_patterns }
fn default_health_history_size() -> usize { 100 }
fn default_health_interval_secs() -> u64 { 30 }
fn default_adaptive_interval_secs() -> u64 { 60 }

impl Default for CacheLayerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            instance_id: None,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            expected_error_rate: default_expected_error_rate(),
            call_timeout_ms: default_call_timeout_ms(),
            max_batch_size: default_max_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            priority_queues: true,
            priority_prefixes: default_priority_prefixes(),
            usage_soft_threshold: default_usage_soft(),
            usage_hard_threshold: default_usage_hard(),
            usage_relax_threshold: default_usage_relax(),
            features: Vec::new(),
            invalidation_transport: TransportKind::default(),
            invalidation_channel: default_invalidation_channel(),
            invalidation_signal_prefix: default_invalidation_signal_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
            signal_ttl_secs: default_signal_ttl_secs(),
            tag_prefix: default_tag_prefix(),
            user_key_patterns: default_user_key_patterns(),
            health_history_size: default_health_history_size(),
            health_interval_secs: default_health_interval_secs(),
            adaptive_interval_secs: default_adaptive_interval_secs(),
        }
    }
}

impl CacheLayerConfig {
    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            expected_error_rate: self.expected_error_rate.clamp(0.0, 1.0),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }

    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size.max(1),
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            priority_queues: self.priority_queues,
            priority_prefixes: self.priority_prefixes.clone(),
        }
    }

    #[must_use]
    pub fn usage_thresholds(&self) -> UsageThresholds {
        UsageThresholds {
            soft: self.usage_soft_threshold,
            hard: self.usage_hard_threshold,
            relax: self.usage_relax_threshold,
        }
    }

    /// Invalidation settings; `instance_id` is resolved by the caller so it
    /// stays stable across reloads.
    #[must_use]
    pub fn invalidation_settings(&self, instance_id: &str) -> InvalidationSettings {
        InvalidationSettings {
            instance_id: instance_id.to_string(),
            tag_prefix: self.tag_prefix.clone(),
            user_key_patterns: self.user_key_patterns.clone(),
        }
    }

    #[must_use]
    pub fn feature_catalog(&self) -> Vec<FeatureFlag> {
        if self.features.is_empty() {
            default_features()
        } else {
            self.features.clone()
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            recovery_timeout_ms: 50,
            call_timeout_ms: 1_000,
            failure_threshold: 2,
            batch_timeout_ms: 5,
            health_interval_secs: 0,
            adaptive_interval_secs: 0,
            instance_id: Some("test-node".into()),
            ..Default::default()
        }
    }
}
