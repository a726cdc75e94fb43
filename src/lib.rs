// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Resilient Cache
//!
//! A cache layer that keeps an application responsive while its shared
//! key-value store is slow, overloaded or down.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Application code                       │
//! │  • gated_get / gated_set per feature                       │
//! │  • trigger(event) on domain changes                        │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                  │
//!            ▼                                  ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │     AdaptiveController   │   │      InvalidationEngine      │
//! │  • feature tiers         │   │  • rules → tags / patterns   │
//! │  • normal/conservative/  │   │  • push or poll transport    │
//! │    aggressive modes      │   │    to peer instances         │
//! └──────────────────────────┘   └──────────────────────────────┘
//!            │ scales                           │
//!            ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       BatchScheduler                        │
//! │  • priority + regular lanes                                │
//! │  • flush on size or timer, one pipeline per flush          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  CircuitBreaker ("redis")                   │
//! │  • closed → open → half-open with a single trial call      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                   KvStore (Redis / in-memory)
//!
//!        MonitoringService observes every layer above
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilient_cache::{CacheLayer, CacheLayerConfig};
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheLayerConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let layer = CacheLayer::connect(config, rx).await.expect("Failed to connect");
//!     layer.start().await.expect("Failed to start");
//!
//!     // Cached reads and writes, skipped when the feature is shed
//!     layer.gated_set("course_caching", "cache:course:42:meta", "{...}", None).await.unwrap();
//!     let meta = layer.gated_get("course_caching", "cache:course:42:meta").await.unwrap();
//!     println!("Found: {:?}", meta);
//!
//!     // Domain event: invalidate here and on every peer
//!     let report = layer
//!         .invalidation()
//!         .trigger("course.updated", json!({"course_id": 42}), None, None)
//!         .await;
//!     println!("Invalidated {} keys", report.keys_invalidated);
//!
//!     layer.shutdown().await;
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`CacheLayerConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`CacheLayer`] context wiring all components
//! - [`storage`]: Store backends (Redis, in-memory) behind [`KvStore`]
//! - [`resilience`]: Circuit breakers and retry logic
//! - [`batching`]: Batch scheduler pipelining commands through the breaker
//! - [`invalidation`]: Rule-driven, cross-instance invalidation
//! - [`adaptive`]: Feature tiers and optimization modes
//! - [`monitoring`]: Operation metrics, health sampling and trends

pub mod adaptive;
pub mod batching;
pub mod config;
pub mod coordinator;
pub mod invalidation;
pub mod metrics;
pub mod monitoring;
pub mod resilience;
pub mod storage;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use adaptive::{AdaptiveController, FeatureFlag, FeatureTier, OptimizationMode, UsageThresholds};
pub use batching::{BatchConfig, BatchError, BatchScheduler, FlushReason};
pub use config::{CacheLayerConfig, TransportKind};
pub use coordinator::{CacheLayer, LayerError, LayerReport, LayerState};
pub use invalidation::{InvalidationEngine, InvalidationEvent, InvalidationRule, TriggerReport};
pub use monitoring::{HealthSample, HealthStatus, MonitoringService};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitRegistry, CircuitState};
pub use resilience::retry::RetryConfig;
pub use storage::command::{Command, Reply};
pub use storage::memory::InMemoryStore;
pub use storage::redis::RedisStore;
pub use storage::traits::{KvStore, StoreError};
